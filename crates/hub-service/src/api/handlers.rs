//! Control-plane handlers.
//!
//! Implements the REST endpoints under `/api/v1/webrtc/meetings/{id}`:
//!
//! - `GET /peers` - List peers in the room
//! - `POST /join` - Join (peer id generated when omitted)
//! - `POST /leave` - Leave
//! - `POST /offer`, `/answer`, `/ice-candidate` - Relay on behalf of the caller's peer
//! - `PUT /peer-state` - Update the caller's connection state
//! - `GET /stats` - Room statistics
//! - `POST /turn-credentials` - Issue a TURN credential
//! - `GET /ice-servers` - STUN list plus a TURN entry
//!
//! # Identity
//!
//! The external auth layer forwards the caller as `X-User-Id` (authenticated)
//! or `X-Session-Id` (guest), plus an optional `X-Display-Name`. Requests
//! carrying neither id are rejected with `UNAUTHORIZED`.

use super::AppState;
use crate::actors::{JoinRequest, JoinResult, PeerInfo, RoomStats};
use crate::errors::{HubError, Operation};
use crate::protocol::{IceCandidatePayload, LeaveReason, SessionDescription};
use crate::signaling::{PeerConnectionState, SignalPayload, SignalingEnvelope};
use crate::turn::{IceServer, RelayCredential};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use common::types::{MeetingId, PeerIdentity};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const DISPLAY_NAME_HEADER: &str = "x-display-name";

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBody {
    #[serde(default, alias = "participantId")]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveBody {
    #[serde(default, alias = "participantId")]
    pub peer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OfferBody {
    pub to: String,
    pub offer: SessionDescription,
}

#[derive(Debug, Deserialize)]
pub struct AnswerBody {
    pub to: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Deserialize)]
pub struct IceCandidateBody {
    pub to: String,
    pub candidate: IceCandidatePayload,
}

#[derive(Debug, Deserialize)]
pub struct PeerStateBody {
    pub state: PeerConnectionState,
}

#[derive(Debug, Default, Deserialize)]
pub struct TurnCredentialsBody {
    /// Requested lifetime in seconds. Zero or absent means the default.
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    const OK: Ack = Ack { success: true };
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub participants: Vec<PeerInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Resolve the caller from the auth layer's headers.
///
/// # Errors
///
/// `Unauthorized` when neither a user nor a session id is present.
pub fn caller_identity(headers: &HeaderMap) -> Result<PeerIdentity, HubError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if let Some(user_id) = header(USER_ID_HEADER) {
        return Ok(PeerIdentity::User(user_id));
    }
    if let Some(session_id) = header(SESSION_ID_HEADER) {
        return Ok(PeerIdentity::Session(session_id));
    }
    Err(HubError::Unauthorized(
        "Missing caller identity".to_string(),
    ))
}

/// Display name from `X-Display-Name`, if any.
#[must_use]
pub fn display_name(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DISPLAY_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Deserialize a JSON body, answering 400 rather than Axum's 422.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, HubError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(target: "hub.api", error = %e, "Invalid request body");
        HubError::Validation("Invalid request body".to_string())
    })
}

/// Like [`parse_body`], with an empty body meaning the default.
fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, HubError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

/// The caller's own peer id in a room.
async fn caller_peer(
    state: &AppState,
    room_id: MeetingId,
    identity: PeerIdentity,
) -> Result<String, HubError> {
    Ok(state.hub.find_peer(room_id, identity).await?.peer_id)
}

async fn relay(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
    to: String,
    payload: SignalPayload,
) -> Result<Json<Ack>, HubError> {
    let room_id = MeetingId::parse(id)?;
    let identity = caller_identity(headers)?;
    let from = caller_peer(state, room_id, identity).await?;

    let envelope = SignalingEnvelope::new(room_id, from, to, payload)?;
    state.hub.relay(envelope).await?;
    Ok(Json(Ack::OK))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for GET /api/v1/webrtc/meetings/{id}/peers
///
/// A meeting with no live room has no peers.
#[instrument(skip_all, name = "hub.api.list_peers", fields(meeting_id = %id))]
pub async fn list_peers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PeersResponse>, HubError> {
    let room_id = MeetingId::parse(&id)?;
    caller_identity(&headers)?;

    let participants = match state.hub.list_peers(room_id).await {
        Ok(peers) => peers,
        Err(HubError::RoomNotFound(_) | HubError::RoomClosed(_)) => Vec::new(),
        Err(e) => return Err(e),
    };
    Ok(Json(PeersResponse { participants }))
}

/// Handler for POST /api/v1/webrtc/meetings/{id}/join
///
/// REST peers have no outbound transport; after joining they are moved to
/// `connecting` while the client negotiates.
///
/// # Response
///
/// - 200 OK: the peer plus the other peers in the room
/// - 400 Bad Request: invalid meeting id or body
/// - 401 Unauthorized: no caller identity
/// - 403 Forbidden: room is full
/// - 500 Internal Server Error: `JOIN_FAILED`
#[instrument(skip_all, name = "hub.api.join", fields(meeting_id = %id))]
pub async fn join(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JoinResult>, HubError> {
    let room_id = MeetingId::parse(&id)?;
    let identity = caller_identity(&headers)?;
    let request: JoinBody = parse_optional_body(&body)?;

    let name = request
        .name
        .filter(|n| !n.trim().is_empty())
        .or_else(|| display_name(&headers))
        .unwrap_or_else(|| identity.id().to_string());

    let mut join = JoinRequest::new(identity, name);
    if let Some(peer_id) = request.peer_id.filter(|p| !p.trim().is_empty()) {
        join = join.with_peer_id(peer_id);
    }
    if let Some(avatar_url) = request.avatar_url {
        join = join.with_avatar_url(avatar_url);
    }

    let mut result = state
        .hub
        .join(room_id, join)
        .await
        .map_err(|rejected| rejected.error.during(Operation::Join))?;

    match state
        .hub
        .update_state(
            room_id,
            result.peer.peer_id.clone(),
            PeerConnectionState::Connecting,
        )
        .await
    {
        Ok(peer) => result.peer = peer,
        Err(e) => {
            debug!(target: "hub.api", error = %e, "Could not mark peer connecting");
        }
    }

    info!(
        target: "hub.api",
        meeting_id = %room_id,
        peer_id = %result.peer.peer_id,
        "Peer joined via control plane"
    );
    Ok(Json(result))
}

/// Handler for POST /api/v1/webrtc/meetings/{id}/leave
///
/// Leaves as the caller's own peer. A `peerId` naming someone else is refused.
#[instrument(skip_all, name = "hub.api.leave", fields(meeting_id = %id))]
pub async fn leave(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Ack>, HubError> {
    leave_as_caller(&state, &id, &headers, &body)
        .await
        .map_err(|e| e.during(Operation::Leave))?;
    Ok(Json(Ack::OK))
}

async fn leave_as_caller(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(), HubError> {
    let room_id = MeetingId::parse(id)?;
    let identity = caller_identity(headers)?;
    let request: LeaveBody = parse_optional_body(body)?;

    let peer_id = caller_peer(state, room_id, identity).await?;
    if request.peer_id.as_deref().is_some_and(|p| p != peer_id) {
        return Err(HubError::PermissionDenied(
            "Cannot remove another peer".to_string(),
        ));
    }

    state
        .hub
        .leave(room_id, peer_id, None, LeaveReason::Voluntary)
        .await
}

/// Handler for POST /api/v1/webrtc/meetings/{id}/offer
#[instrument(skip_all, name = "hub.api.offer", fields(meeting_id = %id))]
pub async fn offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Ack>, HubError> {
    let request: OfferBody = parse_body(&body).map_err(|e| e.during(Operation::Offer))?;
    relay(
        &state,
        &id,
        &headers,
        request.to,
        SignalPayload::Offer(request.offer),
    )
    .await
    .map_err(|e| e.during(Operation::Offer))
}

/// Handler for POST /api/v1/webrtc/meetings/{id}/answer
#[instrument(skip_all, name = "hub.api.answer", fields(meeting_id = %id))]
pub async fn answer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Ack>, HubError> {
    let request: AnswerBody = parse_body(&body).map_err(|e| e.during(Operation::Answer))?;
    relay(
        &state,
        &id,
        &headers,
        request.to,
        SignalPayload::Answer(request.answer),
    )
    .await
    .map_err(|e| e.during(Operation::Answer))
}

/// Handler for POST /api/v1/webrtc/meetings/{id}/ice-candidate
#[instrument(skip_all, name = "hub.api.ice_candidate", fields(meeting_id = %id))]
pub async fn ice_candidate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Ack>, HubError> {
    let request: IceCandidateBody =
        parse_body(&body).map_err(|e| e.during(Operation::IceCandidate))?;
    relay(
        &state,
        &id,
        &headers,
        request.to,
        SignalPayload::IceCandidate(request.candidate),
    )
    .await
    .map_err(|e| e.during(Operation::IceCandidate))
}

/// Handler for PUT /api/v1/webrtc/meetings/{id}/peer-state
#[instrument(skip_all, name = "hub.api.peer_state", fields(meeting_id = %id))]
pub async fn update_peer_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PeerInfo>, HubError> {
    let peer = update_caller_state(&state, &id, &headers, &body)
        .await
        .map_err(|e| e.during(Operation::UpdateState))?;
    Ok(Json(peer))
}

async fn update_caller_state(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<PeerInfo, HubError> {
    let room_id = MeetingId::parse(id)?;
    let identity = caller_identity(headers)?;
    let request: PeerStateBody = parse_body(body)?;

    let peer_id = caller_peer(state, room_id, identity).await?;
    state
        .hub
        .update_state(room_id, peer_id, request.state)
        .await
}

/// Handler for GET /api/v1/webrtc/meetings/{id}/stats
#[instrument(skip_all, name = "hub.api.stats", fields(meeting_id = %id))]
pub async fn room_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomStats>, HubError> {
    let room_id = MeetingId::parse(&id)?;
    caller_identity(&headers)?;
    Ok(Json(state.hub.room_stats(room_id).await?))
}

/// Handler for POST /api/v1/webrtc/meetings/{id}/turn-credentials
///
/// Optional body `{"ttl": seconds}`; the lifetime is capped at the
/// configured maximum.
#[instrument(skip_all, name = "hub.api.turn_credentials", fields(meeting_id = %id))]
pub async fn turn_credentials(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RelayCredential>, HubError> {
    let room_id = MeetingId::parse(&id)?;
    let identity = caller_identity(&headers)?;
    let request: TurnCredentialsBody = parse_optional_body(&body)?;

    let ttl = request.ttl.filter(|t| *t > 0).map(Duration::from_secs);
    let credential = state
        .hub
        .issue_credential(&identity, room_id, ttl)
        .map_err(|e| e.during(Operation::IssueCredential))?;
    Ok(Json(credential))
}

/// Handler for GET /api/v1/webrtc/meetings/{id}/ice-servers
#[instrument(skip_all, name = "hub.api.ice_servers", fields(meeting_id = %id))]
pub async fn ice_servers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<IceServersResponse>, HubError> {
    let room_id = MeetingId::parse(&id)?;
    let identity = caller_identity(&headers)?;

    let ice_servers = state
        .hub
        .ice_servers(&identity, room_id)
        .map_err(|e| e.during(Operation::IssueCredential))?;
    Ok(Json(IceServersResponse { ice_servers }))
}
