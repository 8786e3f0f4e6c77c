//! `ChatPersister` - ordered background writer for one room's chat.
//!
//! The room hands every message, edit and delete to its persister after the
//! event has been sequenced. Records are written one at a time in sequence
//! order. A failed write is retried with exponential backoff; once the last
//! attempt fails the record is reported back as not durable and the room
//! flags its sequence for reconciliation. Fan-out never waits on storage.

use crate::observability::metrics;
use crate::persistence::{ChatStore, PersistRecord};

use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::MeetingId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Records waiting to be written before new ones are refused.
pub const PERSIST_QUEUE_CAPACITY: usize = 1024;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each further failure.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

/// Settled write, reported back to the room in sequence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOutcome {
    pub sequence: u64,
    pub durable: bool,
}

/// Handle to a `ChatPersister`.
#[derive(Clone, Debug)]
pub struct ChatPersisterHandle {
    sender: mpsc::Sender<PersistRecord>,
    cancel_token: CancellationToken,
}

impl ChatPersisterHandle {
    /// Queue a record without waiting.
    ///
    /// # Errors
    ///
    /// Returns the record when the queue is full or the persister has stopped.
    pub fn try_enqueue(&self, record: PersistRecord) -> Result<(), Box<PersistRecord>> {
        self.sender.try_send(record).map_err(|e| Box::new(e.into_inner()))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// The `ChatPersister` implementation.
pub struct ChatPersister {
    room_id: MeetingId,
    store: Arc<dyn ChatStore>,
    policy: RetryPolicy,
    receiver: mpsc::Receiver<PersistRecord>,
    outcomes: mpsc::Sender<PersistOutcome>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ChatPersister {
    /// Spawn a persister. Outcomes are sent on `outcomes`.
    pub fn spawn(
        room_id: MeetingId,
        store: Arc<dyn ChatStore>,
        policy: RetryPolicy,
        outcomes: mpsc::Sender<PersistOutcome>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ChatPersisterHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(PERSIST_QUEUE_CAPACITY);

        let actor = Self {
            room_id,
            store,
            policy,
            receiver,
            outcomes,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Persister, room_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        (
            ChatPersisterHandle {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    #[instrument(
        skip_all,
        name = "hub.actor.persister",
        fields(meeting_id = %self.room_id, store = self.store.name())
    )]
    async fn run(mut self) {
        debug!(
            target: "hub.chat.persist",
            meeting_id = %self.room_id,
            store = self.store.name(),
            "ChatPersister started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    self.flush_remaining().await;
                    break;
                }

                record = self.receiver.recv() => {
                    let Some(record) = record else {
                        break;
                    };

                    self.mailbox.record_enqueue();
                    self.mailbox.observe_backlog(self.receiver.len());
                    let durable = self.write_with_retry(&record).await;
                    self.mailbox.record_dequeue();
                    self.metrics.record_message_processed();

                    let outcome = PersistOutcome {
                        sequence: record.sequence,
                        durable,
                    };
                    if self.outcomes.send(outcome).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            target: "hub.chat.persist",
            meeting_id = %self.room_id,
            records_written = self.mailbox.messages_processed(),
            "ChatPersister stopped"
        );
    }

    /// Returns whether the record was stored.
    async fn write_with_retry(&self, record: &PersistRecord) -> bool {
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.store.persist(record).await {
                Ok(()) => {
                    debug!(
                        target: "hub.chat.persist",
                        meeting_id = %self.room_id,
                        sequence = record.sequence,
                        op = %record.op,
                        attempt = attempt,
                        "Chat record persisted"
                    );
                    return true;
                }
                Err(e) if attempt < attempts => {
                    let backoff = self.policy.backoff_after(attempt);
                    warn!(
                        target: "hub.chat.persist",
                        meeting_id = %self.room_id,
                        sequence = record.sequence,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Chat persist failed, retrying"
                    );
                    tokio::select! {
                        () = self.cancel_token.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    error!(
                        target: "hub.chat.persist",
                        meeting_id = %self.room_id,
                        sequence = record.sequence,
                        attempts = attempts,
                        error = %e,
                        "Chat persist failed, flagging for reconciliation"
                    );
                }
            }
        }

        metrics::record_persist_failure(self.store.name());
        false
    }

    /// One attempt per queued record on shutdown, no backoff.
    async fn flush_remaining(&mut self) {
        self.receiver.close();
        let mut lost = 0usize;
        while let Ok(record) = self.receiver.try_recv() {
            if let Err(e) = self.store.persist(&record).await {
                lost += 1;
                metrics::record_persist_failure(self.store.name());
                warn!(
                    target: "hub.chat.persist",
                    meeting_id = %self.room_id,
                    sequence = record.sequence,
                    error = %e,
                    "Chat persist failed during shutdown"
                );
            }
        }
        if lost > 0 {
            error!(
                target: "hub.chat.persist",
                meeting_id = %self.room_id,
                lost = lost,
                "Chat records not persisted at shutdown"
            );
        }
    }
}
