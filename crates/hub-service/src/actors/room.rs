//! `RoomActor` - one per live meeting.
//!
//! The `RoomActor` owns everything about one meeting:
//!
//! - The peer map (at most one peer per identity)
//! - Each peer's connection state and `ConnectionActor`
//! - The chat sequence counter, chat log and typing expiries
//! - The room's `ChatPersister`
//!
//! Every mutation and every fan-out happens inside a single message handler,
//! so a broadcast always sees a consistent peer snapshot and chat sequence
//! numbers form a gap-free total order per room.
//!
//! Fan-out never blocks: frames are queued on each peer's bounded outbound
//! queue. A peer whose queue is full or closed is removed as `failed` and
//! its departure is broadcast; delivery to everyone else continues.

use crate::chat::{ChatEnvelope, ChatEvent, ChatLog, ChatMessage, TypingEntry, TypingTracker};
use crate::errors::HubError;
use crate::observability::metrics;
use crate::persistence::{ChatStore, PersistOp, PersistRecord};
use crate::protocol::{
    Body, ChatReactionPayload, ChatReadStatusPayload, ChatTypingPayload, Envelope, JoinPayload,
    LeaveReason, ParticipantLeftPayload, PeerStatePayload,
};
use crate::signaling::{PeerConnectionState, SignalingEnvelope};

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::messages::{
    empty_histogram, JoinRejected, JoinRequest, JoinResult, PeerInfo, PublishOutcome,
    RoomMessage, RoomStats, RoomView,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::persister::{ChatPersister, ChatPersisterHandle, PersistOutcome, RetryPolicy};

use chrono::{DateTime, Utc};
use common::types::{MeetingId, PeerIdentity};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How often peers are checked against the heartbeat timeout.
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How often typing indicators are checked for expiry.
pub const TYPING_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Time allowed for child actors to stop during shutdown.
const CHILD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-room limits and timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSettings {
    /// Hard ceiling on peers.
    pub capacity: usize,
    /// How long an empty room is kept before eviction.
    pub grace_period: Duration,
    /// Peers with an attached transport not seen for this long are removed.
    pub heartbeat_timeout: Duration,
    /// Control-plane peers (no transport) idle for this long are removed.
    pub idle_timeout: Duration,
    /// Typing indicator lifetime without a refresh.
    pub typing_expiry: Duration,
    /// Per-peer outbound queue capacity.
    pub outbound_capacity: usize,
    pub persist_retry: RetryPolicy,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            capacity: 50,
            grace_period: Duration::from_secs(180),
            heartbeat_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
            typing_expiry: Duration::from_secs(3),
            outbound_capacity: 256,
            persist_retry: RetryPolicy::default(),
        }
    }
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: MeetingId,
    peer_count: Arc<AtomicUsize>,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> MeetingId {
        self.room_id
    }

    /// Peers currently in the room, without a round trip.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    fn closed(&self) -> HubError {
        HubError::RoomClosed(self.room_id.to_string())
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Add a peer, replacing any peer with the same identity.
    ///
    /// # Errors
    ///
    /// The rejection carries the request back whenever the room did not
    /// consume it.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinResult, JoinRejected> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self
            .sender
            .send(RoomMessage::Join {
                request,
                respond_to: tx,
            })
            .await
        {
            let request = match e.0 {
                RoomMessage::Join { request, .. } => Some(request),
                _ => None,
            };
            return Err(JoinRejected::new(self.closed(), request));
        }

        rx.await
            .map_err(|_| JoinRejected::new(self.closed(), None))?
    }

    /// Remove a peer.
    ///
    /// # Errors
    ///
    /// `PeerNotFound` if the peer is not in the room.
    pub async fn leave(
        &self,
        peer_id: String,
        connection_id: Option<String>,
        reason: LeaveReason,
    ) -> Result<(), HubError> {
        self.request(|respond_to| RoomMessage::Leave {
            peer_id,
            connection_id,
            reason,
            respond_to,
        })
        .await?
    }

    /// # Errors
    ///
    /// `RoomClosed` if the room has stopped.
    pub async fn view(&self) -> Result<RoomView, HubError> {
        self.request(|respond_to| RoomMessage::GetView { respond_to })
            .await
    }

    /// # Errors
    ///
    /// `RoomClosed` if the room has stopped.
    pub async fn list_peers(&self) -> Result<Vec<PeerInfo>, HubError> {
        self.request(|respond_to| RoomMessage::ListPeers { respond_to })
            .await
    }

    /// # Errors
    ///
    /// `PeerNotFound` or `InvalidTransition`.
    pub async fn update_state(
        &self,
        peer_id: String,
        state: PeerConnectionState,
    ) -> Result<PeerInfo, HubError> {
        self.request(|respond_to| RoomMessage::UpdateState {
            peer_id,
            state,
            respond_to,
        })
        .await?
    }

    /// # Errors
    ///
    /// `PeerNotFound` if the peer is not in the room.
    pub async fn touch(&self, peer_id: String) -> Result<(), HubError> {
        self.request(|respond_to| RoomMessage::Touch {
            peer_id,
            respond_to,
        })
        .await?
    }

    /// # Errors
    ///
    /// `RoomClosed` if the room has stopped.
    pub async fn stats(&self) -> Result<RoomStats, HubError> {
        self.request(|respond_to| RoomMessage::GetStats { respond_to })
            .await
    }

    /// Route a signaling message to its target.
    ///
    /// # Errors
    ///
    /// `PeerNotInRoom` if the sender or target is absent.
    pub async fn relay(&self, envelope: SignalingEnvelope) -> Result<(), HubError> {
        self.request(|respond_to| RoomMessage::Relay {
            envelope,
            respond_to,
        })
        .await?
    }

    /// Sequence and fan out a chat event.
    ///
    /// # Errors
    ///
    /// `NotInMeeting` if the sender is not in the room, or a chat validation
    /// error.
    pub async fn publish(&self, envelope: ChatEnvelope) -> Result<PublishOutcome, HubError> {
        self.request(|respond_to| RoomMessage::Publish {
            envelope,
            respond_to,
        })
        .await?
    }

    /// # Errors
    ///
    /// `RoomClosed` if the room has stopped.
    pub async fn unread_count(&self, identity: PeerIdentity) -> Result<usize, HubError> {
        self.request(|respond_to| RoomMessage::UnreadCount {
            identity,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// `RoomClosed` if the room has stopped.
    pub async fn find_peer(&self, identity: PeerIdentity) -> Result<Option<PeerInfo>, HubError> {
        self.request(|respond_to| RoomMessage::FindPeer {
            identity,
            respond_to,
        })
        .await
    }

    /// Push a frame to one peer. Silently dropped if the peer is gone.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the room has stopped.
    pub async fn notify(&self, peer_id: String, frame: Envelope) -> Result<(), HubError> {
        self.sender
            .send(RoomMessage::Notify { peer_id, frame })
            .await
            .map_err(|_| self.closed())
    }

    /// Ask the room to stop if it has been empty for `grace`.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the room has already stopped.
    pub async fn try_evict(&self, grace: Duration) -> Result<bool, HubError> {
        self.request(|respond_to| RoomMessage::TryEvict { grace, respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the room has stopped taking messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Attached transport.
struct ManagedConnection {
    handle: ConnectionActorHandle,
    task_handle: JoinHandle<()>,
}

struct Peer {
    peer_id: String,
    identity: PeerIdentity,
    name: String,
    avatar_url: Option<String>,
    state: PeerConnectionState,
    joined_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_seen_at: Instant,
    connection: Option<ManagedConnection>,
}

impl Peer {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            identity: self.identity.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            is_authenticated: self.identity.is_authenticated(),
            state: self.state,
            joined_at: self.joined_at,
            last_seen: self.last_seen,
            connected: self.connection.is_some(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.last_seen_at = Instant::now();
    }

    fn connection_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.handle.connection_id())
    }
}

/// Recipients of a frame.
#[derive(Debug, Clone)]
enum Audience {
    All,
    AllExcept(String),
    Only(String),
    /// Every peer of one identity.
    Identity(PeerIdentity),
}

impl Audience {
    fn includes(&self, peer: &Peer) -> bool {
        match self {
            Audience::All => true,
            Audience::AllExcept(peer_id) => &peer.peer_id != peer_id,
            Audience::Only(peer_id) => &peer.peer_id == peer_id,
            Audience::Identity(identity) => &peer.identity == identity,
        }
    }
}

fn leave_reason_for(state: PeerConnectionState) -> LeaveReason {
    match state {
        PeerConnectionState::Disconnected => LeaveReason::Disconnected,
        PeerConnectionState::Failed => LeaveReason::Failed,
        _ => LeaveReason::Voluntary,
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: MeetingId,
    settings: RoomSettings,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Child of the registry's token.
    cancel_token: CancellationToken,
    peers: HashMap<String, Peer>,
    peer_count: Arc<AtomicUsize>,
    /// Last assigned chat sequence.
    sequence: u64,
    chat: ChatLog,
    typing: TypingTracker,
    store: Arc<dyn ChatStore>,
    persister: ChatPersisterHandle,
    persister_task: JoinHandle<()>,
    outcome_sender: mpsc::Sender<PersistOutcome>,
    outcomes: mpsc::Receiver<PersistOutcome>,
    durable_sequence: u64,
    pending_reconciliation: BTreeSet<u64>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    /// Set while the room has no peers.
    empty_since: Option<Instant>,
    evicted: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: MeetingId,
        settings: RoomSettings,
        store: Arc<dyn ChatStore>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (outcome_sender, outcomes) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let peer_count = Arc::new(AtomicUsize::new(0));

        let (persister, persister_task) = ChatPersister::spawn(
            room_id,
            Arc::clone(&store),
            settings.persist_retry,
            outcome_sender.clone(),
            cancel_token.child_token(),
            Arc::clone(&metrics),
        );

        let now = Utc::now();
        let actor = Self {
            room_id,
            typing: TypingTracker::new(settings.typing_expiry),
            settings,
            receiver,
            cancel_token: cancel_token.clone(),
            peers: HashMap::new(),
            peer_count: Arc::clone(&peer_count),
            sequence: 0,
            chat: ChatLog::new(),
            store,
            persister,
            persister_task,
            outcome_sender,
            outcomes,
            durable_sequence: 0,
            pending_reconciliation: BTreeSet::new(),
            created_at: now,
            last_activity: now,
            empty_since: Some(Instant::now()),
            evicted: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            peer_count,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "hub.actor.room", fields(meeting_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "hub.actor.room",
            meeting_id = %self.room_id,
            "RoomActor started"
        );

        let mut heartbeat_check = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
        let mut typing_sweep = tokio::time::interval(TYPING_SWEEP_INTERVAL);

        loop {
            // Check for terminated connection and persister actors
            self.check_child_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.room",
                        meeting_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = heartbeat_check.tick() => {
                    self.expire_silent_peers();
                }

                _ = typing_sweep.tick() => {
                    self.expire_typing();
                }

                Some(outcome) = self.outcomes.recv() => {
                    self.apply_persist_outcome(outcome);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if self.evicted {
                                self.receiver.close();
                                self.stop_persister().await;
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "hub.actor.room",
                                meeting_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "hub.actor.room",
            meeting_id = %self.room_id,
            sequence = self.sequence,
            pending_reconciliation = self.pending_reconciliation.len(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                request,
                respond_to,
            } => {
                let result = self.handle_join(request);
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                peer_id,
                connection_id,
                reason,
                respond_to,
            } => {
                let result = self.handle_leave(&peer_id, connection_id.as_deref(), reason);
                let _ = respond_to.send(result);
            }

            RoomMessage::GetView { respond_to } => {
                let _ = respond_to.send(self.view());
            }

            RoomMessage::ListPeers { respond_to } => {
                let _ = respond_to.send(self.peer_infos());
            }

            RoomMessage::UpdateState {
                peer_id,
                state,
                respond_to,
            } => {
                let result = self.handle_update_state(&peer_id, state);
                let _ = respond_to.send(result);
            }

            RoomMessage::Touch {
                peer_id,
                respond_to,
            } => {
                let result = match self.peers.get_mut(&peer_id) {
                    Some(peer) => {
                        peer.touch();
                        self.last_activity = peer.last_seen;
                        Ok(())
                    }
                    None => Err(HubError::PeerNotFound(peer_id)),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }

            RoomMessage::Relay {
                envelope,
                respond_to,
            } => {
                let result = self.handle_relay(envelope);
                let _ = respond_to.send(result);
            }

            RoomMessage::Publish {
                envelope,
                respond_to,
            } => {
                let result = self.handle_publish(envelope);
                let _ = respond_to.send(result);
            }

            RoomMessage::UnreadCount {
                identity,
                respond_to,
            } => {
                let _ = respond_to.send(self.chat.unread_count(&identity));
            }

            RoomMessage::FindPeer {
                identity,
                respond_to,
            } => {
                let peer = self
                    .peers
                    .values()
                    .find(|p| p.identity == identity)
                    .map(Peer::info);
                let _ = respond_to.send(peer);
            }

            RoomMessage::Notify { peer_id, frame } => {
                self.deliver(&Audience::Only(peer_id), &frame);
            }

            RoomMessage::TryEvict { grace, respond_to } => {
                let idle = self.peers.is_empty()
                    && self
                        .empty_since
                        .is_some_and(|since| since.elapsed() >= grace);
                if idle {
                    debug!(
                        target: "hub.actor.room",
                        meeting_id = %self.room_id,
                        "Room idle past grace period, evicting"
                    );
                    self.evicted = true;
                }
                let _ = respond_to.send(idle);
            }
        }
    }

    #[instrument(skip_all, fields(meeting_id = %self.room_id))]
    fn handle_join(&mut self, request: JoinRequest) -> Result<JoinResult, JoinRejected> {
        let peer_id = match request.peer_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => request.identity.default_peer_id(),
        };

        if let Some(existing) = self.peers.get(&peer_id) {
            if existing.identity != request.identity {
                return Err(JoinRejected::new(
                    HubError::Conflict("peer id is held by another participant".to_string()),
                    Some(request),
                ));
            }
        }

        // One live peer per identity: a rejoin replaces the old peer and does
        // not count against capacity.
        let replaced = self
            .peers
            .values()
            .find(|p| p.identity == request.identity)
            .map(|p| p.peer_id.clone());

        if replaced.is_none() && self.peers.len() >= self.settings.capacity {
            return Err(JoinRejected::new(
                HubError::RoomFull {
                    capacity: self.settings.capacity,
                },
                Some(request),
            ));
        }

        if let Some(old_peer_id) = &replaced {
            debug!(
                target: "hub.actor.room",
                meeting_id = %self.room_id,
                peer_id = %old_peer_id,
                "Replacing peer with same identity"
            );
            self.remove_peer(old_peer_id, LeaveReason::Replaced);
        }

        let JoinRequest {
            identity,
            name,
            avatar_url,
            transport,
            ..
        } = request;

        let name = match name.trim() {
            "" => peer_id.clone(),
            trimmed => trimmed.to_string(),
        };

        let connection = transport.map(|sink| {
            let connection_id = Uuid::new_v4().to_string();
            let (handle, task_handle) = ConnectionActor::spawn(
                connection_id,
                peer_id.clone(),
                self.room_id,
                sink,
                self.settings.outbound_capacity,
                self.cancel_token.child_token(),
                Arc::clone(&self.metrics),
            );
            ManagedConnection {
                handle,
                task_handle,
            }
        });
        let connection_id = connection
            .as_ref()
            .map(|c| c.handle.connection_id().to_string());

        let now = Utc::now();
        let peer = Peer {
            peer_id: peer_id.clone(),
            identity,
            name,
            avatar_url,
            state: PeerConnectionState::New,
            joined_at: now,
            last_seen: now,
            last_seen_at: Instant::now(),
            connection,
        };
        let info = peer.info();

        self.peers.insert(peer_id.clone(), peer);
        self.peer_count.store(self.peers.len(), Ordering::Relaxed);
        self.metrics.peer_joined();
        self.empty_since = None;
        self.last_activity = now;

        let announcement = Envelope::new(
            self.room_id,
            peer_id.clone(),
            Body::ParticipantJoined(info.to_participant()),
        );
        self.deliver(&Audience::AllExcept(peer_id.clone()), &announcement);

        let others: Vec<PeerInfo> = self
            .peer_infos()
            .into_iter()
            .filter(|p| p.peer_id != peer_id)
            .collect();

        if connection_id.is_some() {
            self.greet(&info, &others);
        }

        info!(
            target: "hub.actor.room",
            meeting_id = %self.room_id,
            peer_id = %peer_id,
            replaced = replaced.is_some(),
            total_peers = self.peers.len(),
            "Peer joined"
        );

        Ok(JoinResult {
            peer: info,
            connection_id,
            replaced,
            peers: others,
        })
    }

    /// Tell a newly attached peer who it is and who is already here.
    fn greet(&mut self, peer: &PeerInfo, others: &[PeerInfo]) {
        let only = Audience::Only(peer.peer_id.clone());
        let ack = Envelope::new(
            self.room_id,
            peer.peer_id.clone(),
            Body::Join(JoinPayload {
                participant_id: Some(peer.peer_id.clone()),
                name: peer.name.clone(),
                avatar_url: peer.avatar_url.clone(),
                is_authenticated: peer.is_authenticated,
            }),
        );
        self.deliver(&only, &ack);

        for other in others {
            let frame = Envelope::new(
                self.room_id,
                other.peer_id.clone(),
                Body::ParticipantJoined(other.to_participant()),
            )
            .to(peer.peer_id.clone());
            self.deliver(&only, &frame);
        }
    }

    fn handle_leave(
        &mut self,
        peer_id: &str,
        connection_id: Option<&str>,
        reason: LeaveReason,
    ) -> Result<(), HubError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| HubError::PeerNotFound(peer_id.to_string()))?;

        if let Some(connection_id) = connection_id {
            if peer.connection_id() != Some(connection_id) {
                debug!(
                    target: "hub.actor.room",
                    meeting_id = %self.room_id,
                    peer_id = %peer_id,
                    "Ignoring leave from superseded connection"
                );
                return Ok(());
            }
        }

        self.remove_peer(peer_id, reason);
        Ok(())
    }

    fn handle_update_state(
        &mut self,
        peer_id: &str,
        state: PeerConnectionState,
    ) -> Result<PeerInfo, HubError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| HubError::PeerNotFound(peer_id.to_string()))?;

        let previous = peer.state;
        peer.state = previous.transition(state)?;
        peer.touch();
        self.last_activity = peer.last_seen;
        let info = peer.info();

        debug!(
            target: "hub.actor.room",
            meeting_id = %self.room_id,
            peer_id = %peer_id,
            from = %previous,
            to = %state,
            "Peer state updated"
        );

        if state.is_departure() {
            self.remove_peer(peer_id, leave_reason_for(state));
        } else if previous != state {
            let frame = Envelope::new(
                self.room_id,
                peer_id.to_string(),
                Body::PeerState(PeerStatePayload {
                    participant_id: Some(peer_id.to_string()),
                    state,
                }),
            );
            self.deliver(&Audience::AllExcept(peer_id.to_string()), &frame);
        }

        Ok(info)
    }

    fn handle_relay(&mut self, envelope: SignalingEnvelope) -> Result<(), HubError> {
        let started = Instant::now();
        let kind = envelope.kind();

        let check = if envelope.room_id != self.room_id {
            Err(HubError::Validation("meeting id mismatch".to_string()))
        } else if !self.peers.contains_key(&envelope.from) {
            Err(HubError::PeerNotInRoom(envelope.from.clone()))
        } else if !self.peers.contains_key(&envelope.to) {
            Err(HubError::PeerNotInRoom(envelope.to.clone()))
        } else if envelope.from == envelope.to {
            Err(HubError::Validation(
                "signaling target must be another peer".to_string(),
            ))
        } else {
            Ok(())
        };
        if let Err(e) = check {
            metrics::record_signal_relayed(kind, "rejected");
            return Err(e);
        }

        if let Some(sender) = self.peers.get_mut(&envelope.from) {
            sender.touch();
            self.last_activity = sender.last_seen;
        }

        let target = Audience::Only(envelope.to.clone());
        let delivered = self.deliver(&target, &envelope.into_frame());

        let outcome = if delivered > 0 {
            "delivered"
        } else {
            "undeliverable"
        };
        metrics::record_signal_relayed(kind, outcome);
        metrics::record_message_latency(kind, started.elapsed());
        Ok(())
    }

    fn handle_publish(&mut self, envelope: ChatEnvelope) -> Result<PublishOutcome, HubError> {
        let started = Instant::now();
        let ChatEnvelope {
            room_id,
            peer_id,
            identity,
            event,
        } = envelope;

        if room_id != self.room_id {
            return Err(HubError::Validation("meeting id mismatch".to_string()));
        }
        match self.peers.get_mut(&peer_id) {
            Some(peer) if peer.identity == identity => {
                peer.touch();
                self.last_activity = peer.last_seen;
            }
            _ => return Err(HubError::NotInMeeting),
        }

        let kind = event.kind();
        // Only committed once the event is accepted, so rejected events
        // leave no gap.
        let sequence = self.sequence + 1;
        let now = Utc::now();

        // A message from a typing peer ends its typing indicator
        let mut typing_ended = None;
        let (body, audience) = match event {
            ChatEvent::Message(draft) => {
                let message = self
                    .chat
                    .post(self.room_id, &identity, &peer_id, draft, sequence, now)?;
                let body = Body::ChatMessage(message.to_payload(sequence));
                self.persist(sequence, PersistOp::Create, message);
                typing_ended = self.typing.stop(&peer_id);
                (body, Audience::All)
            }
            ChatEvent::Edit {
                message_id,
                content,
            } => {
                let message = self.chat.edit(&identity, &message_id, &content, now)?;
                let body = Body::ChatMessageEdit(message.to_payload(sequence));
                self.persist(sequence, PersistOp::Edit, message);
                (body, Audience::All)
            }
            ChatEvent::Delete { message_id } => {
                let message = self.chat.delete(&identity, &message_id, now)?;
                let body = Body::ChatMessageDelete(message.to_payload(sequence));
                self.persist(sequence, PersistOp::Delete, message);
                (body, Audience::All)
            }
            ChatEvent::Reaction {
                message_id,
                reaction,
            } => {
                let (reaction, action) =
                    self.chat.toggle_reaction(&identity, &message_id, &reaction)?;
                let body = Body::ChatReaction(ChatReactionPayload {
                    message_id,
                    reaction,
                    action: Some(action),
                    sequence: Some(sequence),
                    identity: Some(identity.clone()),
                });
                (body, Audience::All)
            }
            ChatEvent::ReadReceipt { message_id } => {
                let author = self.chat.mark_read(&identity, &message_id)?;
                let body = Body::ChatReadStatus(ChatReadStatusPayload {
                    message_id,
                    read_at: Some(now),
                    sequence: Some(sequence),
                    identity: Some(identity.clone()),
                });
                (body, Audience::Identity(author))
            }
            ChatEvent::TypingStart { user_name } => {
                self.typing
                    .start(&peer_id, &identity, user_name.clone(), Instant::now());
                let body = Body::ChatTyping(ChatTypingPayload {
                    user_name,
                    is_typing: true,
                    sequence: Some(sequence),
                    identity: Some(identity.clone()),
                });
                (body, Audience::AllExcept(peer_id.clone()))
            }
            ChatEvent::TypingStop { user_name } => {
                self.typing.stop(&peer_id);
                let body = Body::ChatTypingStop(ChatTypingPayload {
                    user_name,
                    is_typing: false,
                    sequence: Some(sequence),
                    identity: Some(identity.clone()),
                });
                (body, Audience::AllExcept(peer_id.clone()))
            }
        };

        self.sequence = sequence;
        let frame = Envelope::new(self.room_id, peer_id.clone(), body);
        let delivered = self.deliver(&audience, &frame);
        if let Some(entry) = typing_ended {
            self.announce_typing_stop(&peer_id, entry);
        }

        metrics::record_chat_event(kind);
        metrics::record_message_latency(frame.body.kind(), started.elapsed());

        Ok(PublishOutcome {
            delivered,
            sequence,
        })
    }

    /// Hand a durable write to the persister. A refused record is flagged
    /// immediately.
    fn persist(&mut self, sequence: u64, op: PersistOp, message: ChatMessage) {
        let record = PersistRecord {
            sequence,
            op,
            message,
        };
        if let Err(record) = self.persister.try_enqueue(record) {
            warn!(
                target: "hub.chat.persist",
                meeting_id = %self.room_id,
                sequence = record.sequence,
                "Persist queue unavailable, flagging for reconciliation"
            );
            metrics::record_persist_failure(self.store.name());
            self.pending_reconciliation.insert(record.sequence);
        }
    }

    fn apply_persist_outcome(&mut self, outcome: PersistOutcome) {
        if !outcome.durable {
            self.pending_reconciliation.insert(outcome.sequence);
        }
        self.durable_sequence = self.durable_sequence.max(outcome.sequence);
    }

    /// Queue `frame` for every peer in `audience`. Returns successful enqueues.
    fn deliver(&mut self, audience: &Audience, frame: &Envelope) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for peer in self.peers.values() {
            if !audience.includes(peer) {
                continue;
            }
            let Some(connection) = &peer.connection else {
                continue;
            };
            match connection.handle.try_deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    metrics::record_delivery_dropped(e.as_str());
                    warn!(
                        target: "hub.actor.room",
                        meeting_id = %self.room_id,
                        peer_id = %peer.peer_id,
                        reason = e.as_str(),
                        "Outbound queue unavailable, dropping peer"
                    );
                    failed.push(peer.peer_id.clone());
                }
            }
        }

        for peer_id in failed {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.state = PeerConnectionState::Failed;
            }
            self.remove_peer(&peer_id, LeaveReason::Failed);
        }

        delivered
    }

    /// Remove a peer, close its transport and announce the departure.
    fn remove_peer(&mut self, peer_id: &str, reason: LeaveReason) {
        let Some(mut peer) = self.peers.remove(peer_id) else {
            return;
        };

        if let Some(connection) = peer.connection.take() {
            connection.handle.close(reason);
        }

        self.peer_count.store(self.peers.len(), Ordering::Relaxed);
        self.metrics.peer_left();
        self.last_activity = Utc::now();
        if self.peers.is_empty() {
            self.empty_since = Some(Instant::now());
        }

        info!(
            target: "hub.actor.room",
            meeting_id = %self.room_id,
            peer_id = %peer_id,
            reason = %reason,
            total_peers = self.peers.len(),
            "Peer left"
        );

        if let Some(entry) = self.typing.stop(peer_id) {
            self.announce_typing_stop(peer_id, entry);
        }

        let frame = Envelope::new(
            self.room_id,
            peer_id.to_string(),
            Body::ParticipantLeft(ParticipantLeftPayload {
                participant_id: peer_id.to_string(),
                reason,
            }),
        );
        self.deliver(&Audience::All, &frame);
    }

    fn announce_typing_stop(&mut self, peer_id: &str, entry: TypingEntry) {
        self.sequence += 1;
        let frame = Envelope::new(
            self.room_id,
            peer_id.to_string(),
            Body::ChatTypingStop(ChatTypingPayload {
                user_name: entry.user_name,
                is_typing: false,
                sequence: Some(self.sequence),
                identity: Some(entry.identity),
            }),
        );
        self.deliver(&Audience::AllExcept(peer_id.to_string()), &frame);
        metrics::record_chat_event("typing_stop");
    }

    fn expire_typing(&mut self) {
        for (peer_id, entry) in self.typing.take_expired(Instant::now()) {
            debug!(
                target: "hub.actor.room",
                meeting_id = %self.room_id,
                peer_id = %peer_id,
                "Typing indicator expired"
            );
            self.announce_typing_stop(&peer_id, entry);
        }
    }

    fn expire_silent_peers(&mut self) {
        let now = Instant::now();
        let silent: Vec<String> = self
            .peers
            .values()
            .filter(|p| {
                let timeout = if p.connection.is_some() {
                    self.settings.heartbeat_timeout
                } else {
                    self.settings.idle_timeout
                };
                now.duration_since(p.last_seen_at) >= timeout
            })
            .map(|p| p.peer_id.clone())
            .collect();

        for peer_id in silent {
            info!(
                target: "hub.actor.room",
                meeting_id = %self.room_id,
                peer_id = %peer_id,
                "Heartbeat timeout, removing peer"
            );
            self.remove_peer(&peer_id, LeaveReason::Timeout);
        }
    }

    /// Reap finished connection actors and restart a dead persister.
    async fn check_child_health(&mut self) {
        let finished: Vec<String> = self
            .peers
            .values()
            .filter(|p| {
                p.connection
                    .as_ref()
                    .is_some_and(|c| c.task_handle.is_finished())
            })
            .map(|p| p.peer_id.clone())
            .collect();

        for peer_id in finished {
            let Some(connection) = self
                .peers
                .get_mut(&peer_id)
                .and_then(|p| p.connection.take())
            else {
                continue;
            };

            match connection.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "hub.actor.room",
                        meeting_id = %self.room_id,
                        peer_id = %peer_id,
                        "Connection actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "hub.actor.room",
                            meeting_id = %self.room_id,
                            peer_id = %peer_id,
                            error = ?join_error,
                            "Connection actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Connection);
                    }
                }
            }

            self.remove_peer(&peer_id, LeaveReason::Failed);
        }

        if self.persister_task.is_finished() && !self.cancel_token.is_cancelled() {
            let (persister, persister_task) = ChatPersister::spawn(
                self.room_id,
                Arc::clone(&self.store),
                self.settings.persist_retry,
                self.outcome_sender.clone(),
                self.cancel_token.child_token(),
                Arc::clone(&self.metrics),
            );
            let previous = std::mem::replace(&mut self.persister_task, persister_task);
            self.persister = persister;

            if let Err(join_error) = previous.await {
                if join_error.is_panic() {
                    error!(
                        target: "hub.actor.room",
                        meeting_id = %self.room_id,
                        error = ?join_error,
                        "Chat persister panicked, restarted"
                    );
                    self.metrics.record_panic(ActorType::Persister);
                }
            }
        }
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().map(Peer::info).collect();
        peers.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        peers
    }

    fn view(&self) -> RoomView {
        RoomView {
            room_id: self.room_id,
            created_at: self.created_at,
            last_activity: self.last_activity,
            peers: self.peer_infos(),
            sequence: self.sequence,
            durable_sequence: self.durable_sequence,
            pending_reconciliation: self.pending_reconciliation.iter().copied().collect(),
            typing: self.typing.identities(),
        }
    }

    fn stats(&self) -> RoomStats {
        let mut state_histogram = empty_histogram();
        for peer in self.peers.values() {
            *state_histogram.entry(peer.state).or_insert(0) += 1;
        }
        RoomStats {
            room_id: self.room_id,
            exists: true,
            peer_count: self.peers.len(),
            created_at: Some(self.created_at),
            last_activity: Some(self.last_activity),
            state_histogram,
            pending_reconciliation: self.pending_reconciliation.iter().copied().collect(),
        }
    }

    async fn stop_persister(&mut self) {
        self.persister.cancel();
        let task = std::mem::replace(&mut self.persister_task, tokio::spawn(async {}));
        if tokio::time::timeout(CHILD_SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!(
                target: "hub.actor.room",
                meeting_id = %self.room_id,
                "Chat persister shutdown timed out"
            );
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "hub.actor.room",
            meeting_id = %self.room_id,
            peers = self.peers.len(),
            "Performing graceful shutdown"
        );

        let peer_count = self.peers.len();
        let mut tasks = Vec::new();
        for (peer_id, mut peer) in self.peers.drain() {
            if let Some(connection) = peer.connection.take() {
                connection.handle.close(LeaveReason::Shutdown);
                tasks.push((peer_id, connection.task_handle));
            }
        }

        for (peer_id, task) in tasks {
            match tokio::time::timeout(CHILD_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "hub.actor.room",
                        meeting_id = %self.room_id,
                        peer_id = %peer_id,
                        error = ?e,
                        "Connection task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "hub.actor.room",
                        meeting_id = %self.room_id,
                        peer_id = %peer_id,
                        "Connection shutdown timed out"
                    );
                }
            }
        }

        self.peer_count.store(0, Ordering::Relaxed);
        self.metrics.peers_left(peer_count);
        self.stop_persister().await;

        info!(
            target: "hub.actor.room",
            meeting_id = %self.room_id,
            "Graceful shutdown complete"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::connection::ChannelSink;
    use crate::chat::MessageDraft;
    use crate::persistence::InMemoryChatStore;
    use crate::protocol::{ReactionAction, SessionDescription};
    use crate::signaling::SignalPayload;

    use futures_util::future::BoxFuture;

    fn alice() -> PeerIdentity {
        PeerIdentity::User("alice".to_string())
    }

    fn bob() -> PeerIdentity {
        PeerIdentity::User("bob".to_string())
    }

    fn spawn_room(settings: RoomSettings) -> (RoomActorHandle, Arc<InMemoryChatStore>) {
        let store = Arc::new(InMemoryChatStore::new());
        let (handle, _task) = RoomActor::spawn(
            MeetingId::new(),
            settings,
            Arc::clone(&store) as Arc<dyn ChatStore>,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        (handle, store)
    }

    async fn join_with_sink(
        room: &RoomActorHandle,
        identity: PeerIdentity,
        name: &str,
    ) -> (JoinResult, mpsc::Receiver<Envelope>) {
        let (sink, rx) = ChannelSink::new(64);
        let result = room
            .join(JoinRequest::new(identity, name).with_transport(Box::new(sink)))
            .await
            .unwrap();
        (result, rx)
    }

    /// Skip the join greeting and membership chatter.
    async fn next_of(rx: &mut mpsc::Receiver<Envelope>, kind: &str) -> Envelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("subscriber closed");
            if frame.body.kind() == kind {
                return frame;
            }
        }
    }

    fn chat(
        room: &RoomActorHandle,
        peer_id: &str,
        identity: PeerIdentity,
        event: ChatEvent,
    ) -> ChatEnvelope {
        ChatEnvelope {
            room_id: room.room_id(),
            peer_id: peer_id.to_string(),
            identity,
            event,
        }
    }

    fn say(content: &str) -> ChatEvent {
        ChatEvent::Message(MessageDraft {
            content: content.to_string(),
            ..MessageDraft::default()
        })
    }

    #[tokio::test]
    async fn test_join_assigns_default_peer_id_and_greets() {
        let (room, _) = spawn_room(RoomSettings::default());

        let (result, mut rx) = join_with_sink(&room, alice(), "Alice").await;
        assert_eq!(result.peer.peer_id, "user_alice");
        assert_eq!(result.peer.state, PeerConnectionState::New);
        assert!(result.connection_id.is_some());
        assert!(result.peers.is_empty());

        let ack = next_of(&mut rx, "join").await;
        match ack.body {
            Body::Join(payload) => {
                assert_eq!(payload.participant_id.as_deref(), Some("user_alice"));
                assert!(payload.is_authenticated);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(room.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_join_announces_to_others_only() {
        let (room, _) = spawn_room(RoomSettings::default());
        let (_, mut rx_a) = join_with_sink(&room, alice(), "Alice").await;
        let (result_b, mut rx_b) = join_with_sink(&room, bob(), "Bob").await;

        assert_eq!(result_b.peers.len(), 1);
        assert_eq!(result_b.peers.first().unwrap().peer_id, "user_alice");

        let joined = next_of(&mut rx_a, "participant-joined").await;
        assert_eq!(joined.from, "user_bob");

        // Bob learns about Alice through the greeting, not about himself.
        let existing = next_of(&mut rx_b, "participant-joined").await;
        assert_eq!(existing.from, "user_alice");
    }

    #[tokio::test]
    async fn test_rejoin_replaces_peer() {
        let (room, _) = spawn_room(RoomSettings::default());
        let (first, mut old_rx) = join_with_sink(&room, alice(), "Alice").await;
        let (_, mut rx_b) = join_with_sink(&room, bob(), "Bob").await;

        let (second, _new_rx) = join_with_sink(&room, alice(), "Alice").await;
        assert_eq!(second.replaced.as_deref(), Some("user_alice"));
        assert_ne!(first.connection_id, second.connection_id);

        let peers = room.list_peers().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers.iter().filter(|p| p.identity == alice()).count(), 1);

        let left = next_of(&mut rx_b, "participant-left").await;
        match left.body {
            Body::ParticipantLeft(payload) => assert_eq!(payload.reason, LeaveReason::Replaced),
            other => panic!("unexpected frame {other:?}"),
        }

        // The old transport is closed.
        while old_rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_stale_leave_after_replacement_is_ignored() {
        let (room, _) = spawn_room(RoomSettings::default());
        let (first, _rx1) = join_with_sink(&room, alice(), "Alice").await;
        let (_second, _rx2) = join_with_sink(&room, alice(), "Alice").await;

        room.leave(
            "user_alice".to_string(),
            first.connection_id,
            LeaveReason::Disconnected,
        )
        .await
        .unwrap();

        assert_eq!(room.list_peers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_id_conflict() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice").with_peer_id("shared"))
            .await
            .unwrap();

        let rejected = room
            .join(JoinRequest::new(bob(), "Bob").with_peer_id("shared"))
            .await
            .unwrap_err();
        assert!(matches!(rejected.error, HubError::Conflict(_)));
        assert!(rejected.request.is_some());
    }

    #[tokio::test]
    async fn test_capacity_and_replacement() {
        let settings = RoomSettings {
            capacity: 2,
            ..RoomSettings::default()
        };
        let (room, _) = spawn_room(settings);
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();
        room.join(JoinRequest::new(bob(), "Bob")).await.unwrap();

        let rejected = room
            .join(JoinRequest::new(
                PeerIdentity::Session("guest".to_string()),
                "Guest",
            ))
            .await
            .unwrap_err();
        assert!(matches!(rejected.error, HubError::RoomFull { capacity: 2 }));

        // Rejoin of a present identity does not count against capacity.
        assert!(room.join(JoinRequest::new(alice(), "Alice")).await.is_ok());
    }

    #[tokio::test]
    async fn test_state_machine_and_departure() {
        let (room, _) = spawn_room(RoomSettings::default());
        let (_, mut rx_a) = join_with_sink(&room, alice(), "Alice").await;
        room.join(JoinRequest::new(bob(), "Bob")).await.unwrap();

        let err = room
            .update_state("user_bob".to_string(), PeerConnectionState::Connected)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition { .. }));

        room.update_state("user_bob".to_string(), PeerConnectionState::Connecting)
            .await
            .unwrap();
        let state = next_of(&mut rx_a, "peer-state").await;
        assert_eq!(state.from, "user_bob");

        room.update_state("user_bob".to_string(), PeerConnectionState::Failed)
            .await
            .unwrap();
        let left = next_of(&mut rx_a, "participant-left").await;
        match left.body {
            Body::ParticipantLeft(payload) => {
                assert_eq!(payload.participant_id, "user_bob");
                assert_eq!(payload.reason, LeaveReason::Failed);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let err = room
            .update_state("user_bob".to_string(), PeerConnectionState::Connecting)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn test_stats_histogram() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();
        room.join(JoinRequest::new(bob(), "Bob")).await.unwrap();
        room.update_state("user_bob".to_string(), PeerConnectionState::Connecting)
            .await
            .unwrap();

        let stats = room.stats().await.unwrap();
        assert!(stats.exists);
        assert_eq!(stats.peer_count, 2);
        assert_eq!(
            stats.state_histogram.get(&PeerConnectionState::New),
            Some(&1)
        );
        assert_eq!(
            stats.state_histogram.get(&PeerConnectionState::Connecting),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_relay_to_absent_peer_changes_nothing() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();
        let before = room.view().await.unwrap();

        let envelope = SignalingEnvelope::new(
            room.room_id(),
            "user_alice",
            "user_nobody",
            SignalPayload::Offer(SessionDescription {
                sdp: "v=0".to_string(),
                sdp_type: Some("offer".to_string()),
            }),
        )
        .unwrap();
        let err = room.relay(envelope).await.unwrap_err();
        assert!(matches!(err, HubError::PeerNotInRoom(ref id) if id == "user_nobody"));

        let after = room.view().await.unwrap();
        assert_eq!(before.peers, after.peers);
        assert_eq!(before.sequence, after.sequence);
    }

    #[tokio::test]
    async fn test_relay_preserves_pair_order() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();
        let (_, mut rx_b) = join_with_sink(&room, bob(), "Bob").await;

        for i in 0..5 {
            let envelope = SignalingEnvelope::new(
                room.room_id(),
                "user_alice",
                "user_bob",
                SignalPayload::IceCandidate(crate::protocol::IceCandidatePayload {
                    candidate: format!("candidate:{i}"),
                    sdp_m_line_index: Some(0),
                    sdp_mid: None,
                }),
            )
            .unwrap();
            room.relay(envelope).await.unwrap();
        }

        for i in 0..5 {
            let frame = next_of(&mut rx_b, "ice-candidate").await;
            assert_eq!(frame.from, "user_alice");
            match frame.body {
                Body::IceCandidate(c) => assert_eq!(c.candidate, format!("candidate:{i}")),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_requires_membership() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();

        let err = room
            .publish(chat(&room, "user_bob", bob(), say("hi")))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotInMeeting));

        // Right peer id, wrong identity.
        let err = room
            .publish(chat(&room, "user_alice", bob(), say("hi")))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotInMeeting));
    }

    #[tokio::test]
    async fn test_sequences_are_gap_free() {
        let (room, store) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();

        let first = room
            .publish(chat(&room, "user_alice", alice(), say("one")))
            .await
            .unwrap();
        assert!(room
            .publish(chat(&room, "user_alice", alice(), say("   ")))
            .await
            .is_err());
        let second = room
            .publish(chat(&room, "user_alice", alice(), say("two")))
            .await
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);

        // Persistence catches up in the background.
        for _ in 0..100 {
            if room.view().await.unwrap().durable_sequence == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(room.view().await.unwrap().durable_sequence, 2);
        let stored = store.room_messages(&room.room_id()).await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.first().unwrap().content, "one");
    }

    #[tokio::test]
    async fn test_reaction_toggle_fanout() {
        let (room, _) = spawn_room(RoomSettings::default());
        let (_, mut rx_a) = join_with_sink(&room, alice(), "Alice").await;

        room.publish(chat(&room, "user_alice", alice(), say("hello")))
            .await
            .unwrap();
        let message = next_of(&mut rx_a, "chat-message").await;
        let message_id = match message.body {
            Body::ChatMessage(payload) => payload.message_id.unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };

        for expected in [ReactionAction::Add, ReactionAction::Remove] {
            room.publish(chat(
                &room,
                "user_alice",
                alice(),
                ChatEvent::Reaction {
                    message_id,
                    reaction: "👍".to_string(),
                },
            ))
            .await
            .unwrap();
            let frame = next_of(&mut rx_a, "chat-reaction").await;
            match frame.body {
                Body::ChatReaction(payload) => assert_eq!(payload.action, Some(expected)),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_with_implicit_stop() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();
        let (_, mut rx_b) = join_with_sink(&room, bob(), "Bob").await;

        let outcome = room
            .publish(chat(
                &room,
                "user_alice",
                alice(),
                ChatEvent::TypingStart { user_name: None },
            ))
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);
        next_of(&mut rx_b, "chat-typing").await;
        assert_eq!(room.view().await.unwrap().typing, vec![alice()]);

        tokio::time::sleep(Duration::from_millis(3600)).await;

        let stop = next_of(&mut rx_b, "chat-typing-stop").await;
        assert_eq!(stop.from, "user_alice");
        assert!(room.view().await.unwrap().typing.is_empty());
    }

    #[tokio::test]
    async fn test_message_ends_typing_with_next_sequence() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();
        let (_, mut rx_b) = join_with_sink(&room, bob(), "Bob").await;

        room.publish(chat(
            &room,
            "user_alice",
            alice(),
            ChatEvent::TypingStart { user_name: None },
        ))
        .await
        .unwrap();
        next_of(&mut rx_b, "chat-typing").await;

        let outcome = room
            .publish(chat(&room, "user_alice", alice(), say("done typing")))
            .await
            .unwrap();

        let message = next_of(&mut rx_b, "chat-message").await;
        let Body::ChatMessage(payload) = message.body else {
            panic!("expected chat-message");
        };
        assert_eq!(payload.sequence, Some(outcome.sequence));

        let stop = next_of(&mut rx_b, "chat-typing-stop").await;
        let Body::ChatTypingStop(payload) = stop.body else {
            panic!("expected chat-typing-stop");
        };
        assert_eq!(payload.sequence, Some(outcome.sequence + 1));

        let view = room.view().await.unwrap();
        assert!(view.typing.is_empty());
        assert_eq!(view.sequence, outcome.sequence + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_removes_silent_peer() {
        let (room, _) = spawn_room(RoomSettings::default());
        let (_, _rx_a) = join_with_sink(&room, alice(), "Alice").await;

        tokio::time::sleep(Duration::from_secs(66)).await;

        assert!(room.list_peers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_plane_peer_uses_idle_timeout() {
        let (room, _) = spawn_room(RoomSettings::default());
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();

        // Well past the heartbeat timeout, still inside the idle limit
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(room.list_peers().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(306)).await;
        assert!(room.list_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_only_slow_peer() {
        let settings = RoomSettings {
            outbound_capacity: 4,
            ..RoomSettings::default()
        };
        let (room, _) = spawn_room(settings);
        let (_, mut rx_a) = join_with_sink(&room, alice(), "Alice").await;

        // Bob's subscriber is never read.
        let (slow_sink, _slow_rx) = ChannelSink::new(1);
        room.join(JoinRequest::new(bob(), "Bob").with_transport(Box::new(slow_sink)))
            .await
            .unwrap();

        for i in 0..10 {
            let _ = room
                .publish(chat(&room, "user_alice", alice(), say(&format!("m{i}"))))
                .await;
            if room.peer_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let peers = room.list_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.first().unwrap().peer_id, "user_alice");

        let left = next_of(&mut rx_a, "participant-left").await;
        match left.body {
            Body::ParticipantLeft(payload) => {
                assert_eq!(payload.participant_id, "user_bob");
                assert_eq!(payload.reason, LeaveReason::Failed);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    struct BrokenStore;

    impl ChatStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn persist<'a>(
            &'a self,
            _record: &'a PersistRecord,
        ) -> BoxFuture<'a, Result<(), HubError>> {
            Box::pin(async { Err(HubError::Persistence("down".to_string())) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_persist_is_flagged_but_broadcast() {
        let (room, _task) = RoomActor::spawn(
            MeetingId::new(),
            RoomSettings::default(),
            Arc::new(BrokenStore),
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        let (_, mut rx) = join_with_sink(&room, alice(), "Alice").await;

        let outcome = room
            .publish(chat(&room, "user_alice", alice(), say("hi")))
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);
        next_of(&mut rx, "chat-message").await;

        tokio::time::sleep(Duration::from_secs(1)).await;

        let stats = room.stats().await.unwrap();
        assert_eq!(stats.pending_reconciliation, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_evict_waits_for_grace() {
        let settings = RoomSettings {
            grace_period: Duration::from_secs(10),
            ..RoomSettings::default()
        };
        let (room, _) = spawn_room(settings);
        room.join(JoinRequest::new(alice(), "Alice")).await.unwrap();
        room.leave("user_alice".to_string(), None, LeaveReason::Voluntary)
            .await
            .unwrap();

        assert!(!room.try_evict(Duration::from_secs(10)).await.unwrap());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(room.try_evict(Duration::from_secs(10)).await.unwrap());

        // The room has stopped; further requests report it closed.
        let err = room.list_peers().await.unwrap_err();
        assert!(matches!(err, HubError::RoomClosed(_)));
    }

    #[tokio::test]
    async fn test_cancellation_closes_connections() {
        let (room, _) = spawn_room(RoomSettings::default());
        let (_, mut rx) = join_with_sink(&room, alice(), "Alice").await;

        room.cancel();
        while rx.recv().await.is_some() {}
        assert!(room.is_cancelled());
    }
}
