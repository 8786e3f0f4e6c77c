//! WebSocket transport.
//!
//! A connection is upgraded on `GET /api/v1/ws/meetings/:id` with the caller's
//! identity taken from the auth layer's headers. The first frame must be a
//! `join` for that meeting; the room answers with a `join` ack plus one
//! `participant-joined` per peer already present.
//!
//! After the join the socket is split:
//! - the write half becomes the peer's [`FrameSink`], owned by its
//!   `ConnectionActor`
//! - the read half stays here, decoding frames and dispatching them to the
//!   hub
//!
//! Rejected frames come back to the sender as an `error` frame; the
//! connection stays open. Any inbound traffic counts as a heartbeat.

use crate::actors::{FrameSink, JoinRejected, JoinRequest};
use crate::api::handlers::{caller_identity, display_name};
use crate::api::AppState;
use crate::chat::ChatEnvelope;
use crate::errors::{HubError, Operation};
use crate::hub::Hub;
use crate::observability::metrics;
use crate::protocol::{Body, Envelope, JoinPayload, LeaveReason, PeerStatePayload};
use crate::signaling::{PeerConnectionState, SignalingEnvelope};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use common::types::{MeetingId, PeerIdentity};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// How long a new socket may take to send its `join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A socket silent for this long is dropped. Keepalive pings every 54s keep
/// a healthy client under it.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a single write before the transport is considered dead.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write half of a WebSocket.
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsSink {
    #[must_use]
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }

    async fn write(&mut self, message: Message) -> Result<(), HubError> {
        match timeout(WRITE_TIMEOUT, self.inner.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HubError::Internal(format!("websocket write failed: {e}"))),
            Err(_) => Err(HubError::Internal("websocket write timed out".to_string())),
        }
    }
}

impl FrameSink for WsSink {
    fn send_frame(&mut self, frame: Envelope) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let text = frame.encode()?;
            self.write(Message::Text(text)).await
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move { self.write(Message::Ping(Vec::new())).await })
    }

    fn close(&mut self, reason: LeaveReason) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: close_code_for(reason),
                reason: Cow::Borrowed(reason.as_str()),
            };
            if let Err(e) = self.write(Message::Close(Some(frame))).await {
                debug!(target: "hub.transport.ws", error = %e, "Close frame not sent");
            }
            let _ = self.inner.close().await;
        })
    }
}

/// WebSocket close code for a leave reason.
#[must_use]
pub const fn close_code_for(reason: LeaveReason) -> u16 {
    match reason {
        LeaveReason::Voluntary | LeaveReason::Disconnected => close_code::NORMAL,
        LeaveReason::Shutdown => close_code::AWAY,
        LeaveReason::Replaced => close_code::POLICY,
        LeaveReason::Failed | LeaveReason::Timeout => close_code::ERROR,
    }
}

/// Handler for GET /api/v1/ws/meetings/{id}
///
/// # Errors
///
/// `INVALID_MEETING_ID` or `UNAUTHORIZED` before the upgrade.
#[instrument(skip_all, name = "hub.transport.ws.upgrade", fields(meeting_id = %id))]
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, HubError> {
    let room_id = MeetingId::parse(&id)?;
    let identity = caller_identity(&headers)?;
    let name = display_name(&headers);
    let hub = state.hub.clone();

    Ok(ws.on_upgrade(move |socket| serve(hub, room_id, identity, name, socket)))
}

#[instrument(skip_all, name = "hub.transport.ws", fields(meeting_id = %room_id))]
async fn serve(
    hub: Hub,
    room_id: MeetingId,
    identity: PeerIdentity,
    name: Option<String>,
    socket: WebSocket,
) {
    let (sink, mut stream) = socket.split();
    let mut sink = WsSink::new(sink);

    let payload = match await_join(&mut stream, room_id).await {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            debug!(target: "hub.transport.ws", "Socket closed before join");
            return;
        }
        Err(e) => {
            reject(&mut sink, room_id, &e).await;
            sink.close(LeaveReason::Failed).await;
            return;
        }
    };

    let name = Some(payload.name)
        .filter(|n| !n.trim().is_empty())
        .or(name)
        .unwrap_or_else(|| identity.id().to_string());
    let mut request = JoinRequest::new(identity.clone(), name).with_transport(Box::new(sink));
    request.peer_id = payload.participant_id.filter(|p| !p.trim().is_empty());
    request.avatar_url = payload.avatar_url;

    let joined = match hub.join(room_id, request).await {
        Ok(joined) => joined,
        Err(JoinRejected { error, request }) => {
            let error = error.during(Operation::Join);
            warn!(
                target: "hub.transport.ws",
                meeting_id = %room_id,
                error = %error,
                "Join rejected"
            );
            if let Some(mut transport) = request.and_then(|r| r.transport) {
                reject(transport.as_mut(), room_id, &error).await;
                transport.close(LeaveReason::Failed).await;
            }
            return;
        }
    };

    let peer_id = joined.peer.peer_id;
    let connection_id = joined.connection_id;
    info!(
        target: "hub.transport.ws",
        meeting_id = %room_id,
        peer_id = %peer_id,
        "WebSocket peer joined"
    );

    let shutdown = hub.child_token();
    let reason = loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break LeaveReason::Shutdown,
            next = timeout(READ_TIMEOUT, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                debug!(target: "hub.transport.ws", peer_id = %peer_id, "Read timed out");
                break LeaveReason::Timeout;
            }
            Ok(None | Some(Ok(Message::Close(_)))) => break LeaveReason::Disconnected,
            Ok(Some(Err(e))) => {
                debug!(target: "hub.transport.ws", peer_id = %peer_id, error = %e, "Read failed");
                break LeaveReason::Disconnected;
            }
            Ok(Some(Ok(message))) => message,
        };

        if let Err(e) = hub.touch(room_id, peer_id.clone()).await {
            // Removed by the room (timeout, failure, replacement) or room gone
            debug!(
                target: "hub.transport.ws",
                peer_id = %peer_id,
                error = %e,
                "Peer no longer live"
            );
            break LeaveReason::Disconnected;
        }

        let Message::Text(text) = message else {
            continue;
        };

        match dispatch(&hub, room_id, &peer_id, &identity, &text).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Leave(reason)) => break reason,
            Err(e) => {
                metrics::record_error("ws", e.error_type_label(), e.status_code());
                let frame = Envelope::error(room_id, &e).to(peer_id.clone());
                if hub.notify(room_id, peer_id.clone(), frame).await.is_err() {
                    break LeaveReason::Disconnected;
                }
            }
        }
    };

    if let Err(e) = hub
        .leave(room_id, peer_id.clone(), connection_id, reason)
        .await
    {
        debug!(
            target: "hub.transport.ws",
            peer_id = %peer_id,
            error = %e,
            "Leave after socket end was a no-op"
        );
    }
    info!(
        target: "hub.transport.ws",
        meeting_id = %room_id,
        peer_id = %peer_id,
        reason = %reason,
        "WebSocket peer left"
    );
}

/// Wait for the opening `join`. `Ok(None)` means the client went away.
async fn await_join(
    stream: &mut SplitStream<WebSocket>,
    room_id: MeetingId,
) -> Result<Option<JoinPayload>, HubError> {
    timeout(JOIN_TIMEOUT, read_join(stream, room_id))
        .await
        .map_err(|_| HubError::Protocol("join not received in time".to_string()))?
}

async fn read_join(
    stream: &mut SplitStream<WebSocket>,
    room_id: MeetingId,
) -> Result<Option<JoinPayload>, HubError> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame = Envelope::decode(&text)?;
                if frame.meeting_id != room_id {
                    return Err(meeting_mismatch());
                }
                return match frame.body {
                    Body::Join(payload) => Ok(Some(payload)),
                    other => Err(HubError::Protocol(format!(
                        "expected join, got {}",
                        other.kind()
                    ))),
                };
            }
            Ok(Message::Close(_)) | Err(_) => return Ok(None),
            Ok(_) => {}
        }
    }
    Ok(None)
}

async fn reject(sink: &mut dyn FrameSink, room_id: MeetingId, error: &HubError) {
    metrics::record_error("ws", error.error_type_label(), error.status_code());
    if let Err(e) = sink.send_frame(Envelope::error(room_id, error)).await {
        debug!(target: "hub.transport.ws", error = %e, "Error frame not sent");
    }
}

fn meeting_mismatch() -> HubError {
    HubError::Validation("meetingId does not match this connection".to_string())
}

/// What the read loop does after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Leave(LeaveReason),
}

/// Route one inbound frame from `peer_id`.
///
/// # Errors
///
/// Decoding, membership and validation errors, to be sent back to the peer.
pub async fn dispatch(
    hub: &Hub,
    room_id: MeetingId,
    peer_id: &str,
    identity: &PeerIdentity,
    text: &str,
) -> Result<Flow, HubError> {
    let frame = Envelope::decode(text)?;
    if frame.meeting_id != room_id {
        return Err(meeting_mismatch());
    }

    match frame.body {
        Body::Join(_) => Err(HubError::Protocol("already joined".to_string())),
        Body::Leave(_) => Ok(Flow::Leave(LeaveReason::Voluntary)),
        Body::PeerState(PeerStatePayload { state, .. }) => {
            hub.update_state(room_id, peer_id.to_string(), state)
                .await
                .map_err(|e| e.during(Operation::UpdateState))?;
            if state.is_departure() {
                let reason = if state == PeerConnectionState::Failed {
                    LeaveReason::Failed
                } else {
                    LeaveReason::Voluntary
                };
                return Ok(Flow::Leave(reason));
            }
            Ok(Flow::Continue)
        }
        Body::Offer(_) | Body::Answer(_) | Body::IceCandidate(_) => {
            let operation = match frame.body {
                Body::Offer(_) => Operation::Offer,
                Body::Answer(_) => Operation::Answer,
                _ => Operation::IceCandidate,
            };
            let envelope = SignalingEnvelope::from_frame(frame, peer_id)
                .map_err(|e| e.during(operation))?;
            hub.relay(envelope).await.map_err(|e| e.during(operation))?;
            Ok(Flow::Continue)
        }
        Body::ParticipantJoined(_) | Body::ParticipantLeft(_) | Body::Error(_) => Err(
            HubError::Protocol(format!("{} is server-only", frame.body.kind())),
        ),
        _ => {
            let envelope = ChatEnvelope::from_frame(frame, peer_id, identity.clone())?;
            hub.publish(envelope).await?;
            Ok(Flow::Continue)
        }
    }
}
