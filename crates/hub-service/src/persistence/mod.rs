//! Chat persistence collaborators.
//!
//! The hub never owns a chat storage schema. Durable chat fields (messages,
//! edits and deletes) are handed to a [`ChatStore`] through the per-room
//! persister actor (`actors::persister`), which orders and retries writes.
//! Reactions, read receipts and typing are never persisted.
//!
//! Two stores ship with the hub:
//!
//! - [`RedisChatStore`] writes each message as JSON into a per-room hash and
//!   indexes it by sequence in a sorted set.
//! - [`InMemoryChatStore`] keeps messages in process (single-node and tests).

pub mod memory;
pub mod redis;

pub use memory::InMemoryChatStore;
pub use self::redis::RedisChatStore;

use crate::chat::ChatMessage;
use crate::errors::HubError;

use futures_util::future::BoxFuture;
use serde::Serialize;
use std::fmt;

/// What happened to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistOp {
    Create,
    Edit,
    Delete,
}

impl PersistOp {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PersistOp::Create => "create",
            PersistOp::Edit => "edit",
            PersistOp::Delete => "delete",
        }
    }
}

impl fmt::Display for PersistOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable write, tagged with the room sequence of the event that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistRecord {
    pub sequence: u64,
    pub op: PersistOp,
    pub message: ChatMessage,
}

/// Durable storage for chat messages.
///
/// Writes for one room arrive in sequence order and must be idempotent:
/// a retried write may repeat one that actually succeeded.
pub trait ChatStore: Send + Sync + 'static {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Store the current state of `record.message`.
    fn persist<'a>(&'a self, record: &'a PersistRecord) -> BoxFuture<'a, Result<(), HubError>>;
}
