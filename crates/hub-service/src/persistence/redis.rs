//! Redis-backed chat store.
//!
//! # Key Patterns
//!
//! - `chat:{meeting_id}:messages` - message id -> message JSON (HASH)
//! - `chat:{meeting_id}:timeline` - message id scored by creation sequence (ZSET)
//!
//! Both keys expire [`CHAT_KEY_TTL_SECONDS`] after the last write; long-term
//! history belongs to the product's own storage.
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently,
//! so each write clones it instead of locking.

use super::{ChatStore, PersistOp, PersistRecord};
use crate::errors::HubError;

use common::secret::{ExposeSecret, SecretString};
use common::types::MeetingId;
use futures_util::future::BoxFuture;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::{debug, error, warn};

/// Retention for chat keys after the last write.
pub const CHAT_KEY_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Chat store writing to Redis.
#[derive(Clone)]
pub struct RedisChatStore {
    connection: MultiplexedConnection,
}

impl RedisChatStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Redis` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &SecretString) -> Result<Self, HubError> {
        // The URL may embed a password; it is never logged.
        let client = Client::open(redis_url.expose_secret()).map_err(|e| {
            error!(
                target: "hub.chat.persist",
                error = %e,
                "Failed to open Redis client"
            );
            HubError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "hub.chat.persist",
                    error = %e,
                    "Failed to connect to Redis"
                );
                HubError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }

    async fn write(&self, record: &PersistRecord) -> Result<(), HubError> {
        let room_id = record.message.room_id;
        let messages_key = messages_key(&room_id);
        let timeline_key = timeline_key(&room_id);
        let field = record.message.id.to_string();
        let json = serde_json::to_string(&record.message)
            .map_err(|e| HubError::Persistence(format!("Failed to encode message: {e}")))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&messages_key, &field, json)
            .ignore()
            .expire(&messages_key, CHAT_KEY_TTL_SECONDS)
            .ignore();
        if record.op == PersistOp::Create {
            pipe.zadd(&timeline_key, &field, record.sequence)
                .ignore()
                .expire(&timeline_key, CHAT_KEY_TTL_SECONDS)
                .ignore();
        }

        let mut conn = self.connection.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(|e| {
            warn!(
                target: "hub.chat.persist",
                error = %e,
                meeting_id = %room_id,
                sequence = record.sequence,
                op = %record.op,
                "Failed to write chat message"
            );
            HubError::Redis(format!("Failed to write chat message: {e}"))
        })?;

        debug!(
            target: "hub.chat.persist",
            meeting_id = %room_id,
            sequence = record.sequence,
            op = %record.op,
            "Wrote chat message"
        );
        Ok(())
    }
}

impl ChatStore for RedisChatStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn persist<'a>(&'a self, record: &'a PersistRecord) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(self.write(record))
    }
}

fn messages_key(room_id: &MeetingId) -> String {
    format!("chat:{room_id}:messages")
}

fn timeline_key(room_id: &MeetingId) -> String {
    format!("chat:{room_id}:timeline")
}
