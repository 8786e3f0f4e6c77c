//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The `RoomRegistryActor` is the top-level actor in the hub:
//!
//! - Singleton per hub instance
//! - Supervises N `RoomActor` instances, keyed by meeting id
//! - Creates rooms on first join and evicts them once idle past the grace period
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Eviction
//!
//! Every sweep the registry asks each room that has not been resolved within
//! the grace period whether it may go. The room itself decides, inside its own
//! message loop, so a join racing the sweep either lands before the room
//! answers (and the room stays) or finds the room closed and is retried
//! against a fresh one.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the registry:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all rooms and connections)
//! 3. Waits for rooms to stop, up to the deadline

use crate::errors::HubError;
use crate::persistence::ChatStore;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};

use chrono::{DateTime, Utc};
use common::types::MeetingId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How often idle rooms are considered for eviction.
pub const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Longest the sweep waits on one room's eviction answer.
const EVICT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for a removed room to finish cleanup.
const ROOM_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for interacting with the registry.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(
        hub_id: String,
        settings: RoomSettings,
        store: Arc<dyn ChatStore>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor::new(
            hub_id,
            settings,
            store,
            receiver,
            cancel_token.clone(),
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| HubError::Draining)?;
        rx.await.map_err(|_| HubError::Draining)
    }

    /// Get the room for a meeting, creating it if needed.
    ///
    /// # Errors
    ///
    /// `Draining` once shutdown has begun.
    pub async fn room(&self, room_id: MeetingId) -> Result<RoomActorHandle, HubError> {
        self.request(|respond_to| RegistryMessage::ResolveRoom {
            room_id,
            create: true,
            respond_to,
        })
        .await?
    }

    /// Get the room for a meeting without creating it.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` if the meeting has no live room.
    pub async fn existing_room(&self, room_id: MeetingId) -> Result<RoomActorHandle, HubError> {
        self.request(|respond_to| RegistryMessage::ResolveRoom {
            room_id,
            create: false,
            respond_to,
        })
        .await?
    }

    /// # Errors
    ///
    /// `Draining` if the registry has stopped.
    pub async fn status(&self) -> Result<RegistryStatus, HubError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Stop accepting rooms, cancel every room and wait up to `deadline`.
    ///
    /// # Errors
    ///
    /// `Draining` if the registry has already stopped.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), HubError> {
        self.request(|respond_to| RegistryMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token, cancelled when the hub shuts down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: DateTime<Utc>,
    /// Last time a caller asked for this room.
    last_resolved: Instant,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    hub_id: String,
    settings: RoomSettings,
    store: Arc<dyn ChatStore>,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Root cancellation token.
    cancel_token: CancellationToken,
    rooms: HashMap<MeetingId, ManagedRoom>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    fn new(
        hub_id: String,
        settings: RoomSettings,
        store: Arc<dyn ChatStore>,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Registry, &hub_id);

        Self {
            hub_id,
            settings,
            store,
            receiver,
            cancel_token,
            rooms: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "hub.actor.registry", fields(hub_id = %self.hub_id))]
    async fn run(mut self) {
        info!(
            target: "hub.actor.registry",
            hub_id = %self.hub_id,
            "RoomRegistryActor started"
        );

        let mut sweep = tokio::time::interval_at(
            Instant::now() + ROOM_SWEEP_INTERVAL,
            ROOM_SWEEP_INTERVAL,
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.registry",
                        hub_id = %self.hub_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown(Duration::from_secs(30)).await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep_idle_rooms().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RegistryMessage::Shutdown { deadline, respond_to }) => {
                            self.mailbox.record_enqueue();
                            self.graceful_shutdown(deadline).await;
                            self.mailbox.record_dequeue();
                            let _ = respond_to.send(Ok(()));
                            break;
                        }
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "hub.actor.registry",
                                hub_id = %self.hub_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown(Duration::from_secs(30)).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "hub.actor.registry",
            hub_id = %self.hub_id,
            rooms_remaining = self.rooms.len(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::ResolveRoom {
                room_id,
                create,
                respond_to,
            } => {
                let result = self.resolve_room(room_id, create);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            // Handled in the run loop, which stops after replying.
            RegistryMessage::Shutdown { respond_to, .. } => {
                let _ = respond_to.send(Err(HubError::Draining));
            }
        }
    }

    fn resolve_room(
        &mut self,
        room_id: MeetingId,
        create: bool,
    ) -> Result<RoomActorHandle, HubError> {
        if !self.accepting_new {
            return Err(HubError::Draining);
        }

        if let Some(managed) = self.rooms.get_mut(&room_id) {
            if !managed.handle.is_closed() {
                managed.last_resolved = Instant::now();
                return Ok(managed.handle.clone());
            }
        }

        if !create {
            return Err(HubError::RoomNotFound(room_id.to_string()));
        }

        // A closed room still in the map is replaced.
        if let Some(stale) = self.rooms.remove(&room_id) {
            self.retire(room_id, stale);
        }

        let (handle, task_handle) = RoomActor::spawn(
            room_id,
            self.settings.clone(),
            Arc::clone(&self.store),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id,
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: Utc::now(),
                last_resolved: Instant::now(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "hub.actor.registry",
            hub_id = %self.hub_id,
            meeting_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    /// Wait for a removed room in the background, so the loop never blocks
    /// on a room's teardown.
    fn retire(&self, room_id: MeetingId, managed: ManagedRoom) {
        self.metrics.room_removed();

        let hub_id = self.hub_id.clone();
        let lifetime = Utc::now() - managed.created_at;
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_CLEANUP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "hub.actor.registry",
                        hub_id = %hub_id,
                        meeting_id = %room_id,
                        lifetime_secs = lifetime.num_seconds(),
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "hub.actor.registry",
                        hub_id = %hub_id,
                        meeting_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "hub.actor.registry",
                        hub_id = %hub_id,
                        meeting_id = %room_id,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });
    }

    fn status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            peer_count: self.rooms.values().map(|r| r.handle.peer_count()).sum(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Evict rooms that have been empty and unrequested past the grace period.
    async fn sweep_idle_rooms(&mut self) {
        let grace = self.settings.grace_period;
        let candidates: Vec<(MeetingId, RoomActorHandle)> = self
            .rooms
            .iter()
            .filter(|(_, r)| r.handle.peer_count() == 0 && r.last_resolved.elapsed() >= grace)
            .map(|(id, r)| (*id, r.handle.clone()))
            .collect();

        for (room_id, handle) in candidates {
            let evicted =
                match tokio::time::timeout(EVICT_QUERY_TIMEOUT, handle.try_evict(grace)).await {
                    Ok(Ok(evicted)) => evicted,
                    // Already stopped; the health check reaps it.
                    Ok(Err(_)) => false,
                    Err(_) => {
                        warn!(
                            target: "hub.actor.registry",
                            hub_id = %self.hub_id,
                            meeting_id = %room_id,
                            "Room did not answer eviction query"
                        );
                        false
                    }
                };

            if evicted {
                if let Some(managed) = self.rooms.remove(&room_id) {
                    self.retire(room_id, managed);
                    info!(
                        target: "hub.actor.registry",
                        hub_id = %self.hub_id,
                        meeting_id = %room_id,
                        total_rooms = self.rooms.len(),
                        "Idle room evicted"
                    );
                }
            }
        }
    }

    /// Stop accepting rooms, cancel every room and wait for them.
    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "hub.actor.registry",
            hub_id = %self.hub_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;
        // Propagates to every room and connection.
        self.cancel_token.cancel();

        let started = Instant::now();
        for (room_id, managed) in self.rooms.drain() {
            let remaining = deadline.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "hub.actor.registry",
                        hub_id = %self.hub_id,
                        meeting_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "hub.actor.registry",
                        hub_id = %self.hub_id,
                        meeting_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "hub.actor.registry",
                        hub_id = %self.hub_id,
                        meeting_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "hub.actor.registry",
            hub_id = %self.hub_id,
            "Graceful shutdown complete"
        );
    }

    /// Reap room actors that stopped on their own.
    async fn check_room_health(&mut self) {
        let finished: Vec<MeetingId> = self
            .rooms
            .iter()
            .filter(|(_, r)| r.task_handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            let stranded_peers = managed.handle.peer_count();

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "hub.actor.registry",
                        hub_id = %self.hub_id,
                        meeting_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "hub.actor.registry",
                            hub_id = %self.hub_id,
                            meeting_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                        // Peers of a panicked room were never removed.
                        self.metrics.peers_left(stranded_peers);
                    }
                }
            }

            self.metrics.room_removed();
        }
    }
}
