//! `ConnectionActor` - per-peer outbound writer.
//!
//! Each `ConnectionActor`:
//! - Owns exactly one peer transport (a [`FrameSink`])
//! - Drains a bounded mailbox that acts as the peer's outbound queue
//! - Sends keepalive pings while idle
//!
//! # Lifecycle
//!
//! 1. Spawned by the `RoomActor` when a peer joins with a transport
//! 2. Runs until it is closed, its transport fails, or the room goes away
//! 3. Closing cancels the actor: queued frames are discarded and the
//!    transport is closed with the leave reason

use crate::errors::HubError;
use crate::protocol::{Envelope, LeaveReason};

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::MeetingId;
use futures_util::future::BoxFuture;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Interval between keepalive pings on an idle transport.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(54);

/// Outbound half of a peer transport.
///
/// Implemented by the WebSocket writer and by [`ChannelSink`] for in-process
/// subscribers.
pub trait FrameSink: Send + 'static {
    /// Write one frame. An error ends the connection.
    fn send_frame(&mut self, frame: Envelope) -> BoxFuture<'_, Result<(), HubError>>;

    /// Keepalive probe.
    fn ping(&mut self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async { Ok(()) })
    }

    /// Close the transport. Best effort.
    fn close(&mut self, reason: LeaveReason) -> BoxFuture<'_, ()>;
}

/// In-process subscriber backed by a bounded channel.
///
/// The receiver sees `None` once the connection has been closed.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<Envelope>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl FrameSink for ChannelSink {
    fn send_frame(&mut self, frame: Envelope) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.sender
                .send(frame)
                .await
                .map_err(|_| HubError::Internal("subscriber dropped".to_string()))
        })
    }

    fn close(&mut self, _reason: LeaveReason) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Why a frame could not be queued for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbound queue is full.
    Overflow,
    /// Connection actor has stopped.
    Closed,
}

impl DeliveryError {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliveryError::Overflow => "overflow",
            DeliveryError::Closed => "closed",
        }
    }
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    close_reason: Arc<OnceLock<LeaveReason>>,
    connection_id: String,
    peer_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Overflow`] when the outbound queue is full and
    /// [`DeliveryError::Closed`] when the actor has stopped.
    pub fn try_deliver(&self, frame: Envelope) -> Result<(), DeliveryError> {
        self.sender
            .try_send(ConnectionMessage::Deliver { frame })
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Overflow,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Close the connection. Queued frames are discarded.
    pub fn close(&self, reason: LeaveReason) {
        let _ = self.close_reason.set(reason);
        self.cancel_token.cancel();
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    peer_id: String,
    room_id: MeetingId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    sink: Box<dyn FrameSink>,
    /// Child of the room's token.
    cancel_token: CancellationToken,
    close_reason: Arc<OnceLock<LeaveReason>>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor with an outbound queue of `capacity` frames.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        peer_id: String,
        room_id: MeetingId,
        sink: Box<dyn FrameSink>,
        capacity: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let close_reason = Arc::new(OnceLock::new());

        let actor = Self {
            connection_id: connection_id.clone(),
            peer_id: peer_id.clone(),
            room_id,
            receiver,
            sink,
            cancel_token: cancel_token.clone(),
            close_reason: Arc::clone(&close_reason),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            close_reason,
            connection_id,
            peer_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "hub.actor.connection",
        fields(
            connection_id = %self.connection_id,
            peer_id = %self.peer_id,
            meeting_id = %self.room_id
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "hub.actor.connection",
            connection_id = %self.connection_id,
            peer_id = %self.peer_id,
            "ConnectionActor started"
        );

        let start = tokio::time::Instant::now() + KEEPALIVE_INTERVAL;
        let mut keepalive = tokio::time::interval_at(start, KEEPALIVE_INTERVAL);

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    let reason = self
                        .close_reason
                        .get()
                        .copied()
                        .unwrap_or(LeaveReason::Shutdown);
                    self.receiver.close();
                    debug!(
                        target: "hub.actor.connection",
                        connection_id = %self.connection_id,
                        reason = %reason,
                        discarded = self.receiver.len(),
                        "Closing connection"
                    );
                    self.sink.close(reason).await;
                    break;
                }

                _ = keepalive.tick() => {
                    if let Err(e) = self.sink.ping().await {
                        warn!(
                            target: "hub.actor.connection",
                            connection_id = %self.connection_id,
                            error = %e,
                            "Keepalive failed"
                        );
                        break;
                    }
                }

                msg = self.receiver.recv() => {
                    let Some(ConnectionMessage::Deliver { frame }) = msg else {
                        debug!(
                            target: "hub.actor.connection",
                            connection_id = %self.connection_id,
                            "ConnectionActor channel closed, exiting"
                        );
                        break;
                    };

                    self.mailbox.record_enqueue();
                    // A stalled write must not hold off a close.
                    let result = tokio::select! {
                        biased;
                        () = self.cancel_token.cancelled() => Ok(()),
                        result = self.sink.send_frame(frame) => result,
                    };
                    self.mailbox.record_dequeue();
                    self.metrics.record_message_processed();

                    if let Err(e) = result {
                        warn!(
                            target: "hub.actor.connection",
                            connection_id = %self.connection_id,
                            error = %e,
                            "Transport write failed"
                        );
                        break;
                    }
                    keepalive.reset();
                }
            }
        }

        info!(
            target: "hub.actor.connection",
            connection_id = %self.connection_id,
            peer_id = %self.peer_id,
            frames_sent = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }
}
