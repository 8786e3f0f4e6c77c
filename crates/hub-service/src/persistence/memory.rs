//! In-process chat store.

use super::{ChatStore, PersistRecord};
use crate::chat::ChatMessage;
use crate::errors::HubError;

use common::types::MeetingId;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Chat store backed by a map. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    messages: RwLock<HashMap<Uuid, ChatMessage>>,
}

impl InMemoryChatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, message_id: &Uuid) -> Option<ChatMessage> {
        self.messages.read().await.get(message_id).cloned()
    }

    /// Messages of one room in sequence order.
    pub async fn room_messages(&self, room_id: &MeetingId) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| &m.room_id == room_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.sequence);
        messages
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

impl ChatStore for InMemoryChatStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn persist<'a>(&'a self, record: &'a PersistRecord) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            self.messages
                .write()
                .await
                .insert(record.message.id, record.message.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::persistence::PersistOp;
    use crate::protocol::MessageType;
    use chrono::Utc;
    use common::types::PeerIdentity;

    fn message(room_id: MeetingId, sequence: u64, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            author: PeerIdentity::User("alice".to_string()),
            author_peer_id: "user_alice".to_string(),
            message_type: MessageType::Text,
            content: content.to_string(),
            reply_to_id: None,
            attachment_url: None,
            attachment_type: None,
            attachment_name: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
            sequence,
        }
    }

    #[tokio::test]
    async fn test_persist_upserts_by_message_id() {
        let store = InMemoryChatStore::new();
        let room = MeetingId::new();
        let mut msg = message(room, 1, "first");

        let record = PersistRecord {
            sequence: 1,
            op: PersistOp::Create,
            message: msg.clone(),
        };
        store.persist(&record).await.unwrap();

        msg.content = "edited".to_string();
        msg.is_edited = true;
        let record = PersistRecord {
            sequence: 2,
            op: PersistOp::Edit,
            message: msg.clone(),
        };
        store.persist(&record).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&msg.id).await.unwrap().content, "edited");
    }

    #[tokio::test]
    async fn test_room_messages_are_isolated_and_ordered() {
        let store = InMemoryChatStore::new();
        let room_a = MeetingId::new();
        let room_b = MeetingId::new();

        for (room, seq) in [(room_a, 2), (room_b, 1), (room_a, 1)] {
            let record = PersistRecord {
                sequence: seq,
                op: PersistOp::Create,
                message: message(room, seq, "x"),
            };
            store.persist(&record).await.unwrap();
        }

        let a: Vec<u64> = store
            .room_messages(&room_a)
            .await
            .iter()
            .map(|m| m.sequence)
            .collect();
        assert_eq!(a, vec![1, 2]);
        assert_eq!(store.room_messages(&room_b).await.len(), 1);
    }
}
