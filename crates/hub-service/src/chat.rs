//! Chat state owned by a room actor.
//!
//! [`ChatLog`] holds the room's messages, reaction toggles and per-identity
//! read markers. [`TypingTracker`] holds the per-peer typing expiries. Both
//! are plain data; the room actor serializes access and assigns sequence
//! numbers.

use crate::errors::HubError;
use crate::protocol::{Body, ChatMessagePayload, Envelope, MessageType, ReactionAction};

use chrono::{DateTime, Utc};
use common::types::{MeetingId, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Maximum message length in characters (after trimming).
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Maximum reaction length in characters.
pub const MAX_REACTION_CHARS: usize = 10;

/// Content shown in place of a deleted message.
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Durable chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: MeetingId,
    pub author: PeerIdentity,
    pub author_peer_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_name: Option<String>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Sequence number assigned when the message was created.
    pub sequence: u64,
}

impl ChatMessage {
    /// Wire payload stamped with the sequence of the event carrying it.
    #[must_use]
    pub fn to_payload(&self, sequence: u64) -> ChatMessagePayload {
        ChatMessagePayload {
            message_id: Some(self.id),
            content: self.content.clone(),
            message_type: self.message_type,
            reply_to_id: self.reply_to_id,
            attachment_url: self.attachment_url.clone(),
            attachment_type: self.attachment_type.clone(),
            attachment_name: self.attachment_name.clone(),
            is_edited: self.is_edited,
            edited_at: self.edited_at,
            is_deleted: self.is_deleted,
            deleted_at: self.deleted_at,
            created_at: Some(self.created_at),
            sequence: Some(sequence),
            identity: Some(self.author.clone()),
        }
    }
}

/// Client-supplied fields of a new message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageDraft {
    pub message_id: Option<Uuid>,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<Uuid>,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<String>,
    pub attachment_name: Option<String>,
}

impl From<ChatMessagePayload> for MessageDraft {
    fn from(payload: ChatMessagePayload) -> Self {
        Self {
            message_id: payload.message_id,
            content: payload.content,
            message_type: payload.message_type,
            reply_to_id: payload.reply_to_id,
            attachment_url: payload.attachment_url,
            attachment_type: payload.attachment_type,
            attachment_name: payload.attachment_name,
        }
    }
}

/// Chat activity kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(MessageDraft),
    Edit { message_id: Uuid, content: String },
    Delete { message_id: Uuid },
    Reaction { message_id: Uuid, reaction: String },
    ReadReceipt { message_id: Uuid },
    TypingStart { user_name: Option<String> },
    TypingStop { user_name: Option<String> },
}

impl ChatEvent {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Message(_) => "message",
            ChatEvent::Edit { .. } => "edit",
            ChatEvent::Delete { .. } => "delete",
            ChatEvent::Reaction { .. } => "reaction",
            ChatEvent::ReadReceipt { .. } => "read_receipt",
            ChatEvent::TypingStart { .. } => "typing_start",
            ChatEvent::TypingStop { .. } => "typing_stop",
        }
    }

    /// Extract a chat event from an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Protocol` for non-chat frames and
    /// `HubError::Validation` when a required message id is missing.
    pub fn from_body(body: Body) -> Result<Self, HubError> {
        let event = match body {
            Body::ChatMessage(payload) => ChatEvent::Message(payload.into()),
            Body::ChatMessageEdit(payload) => ChatEvent::Edit {
                message_id: required_message_id(payload.message_id)?,
                content: payload.content,
            },
            Body::ChatMessageDelete(payload) => ChatEvent::Delete {
                message_id: required_message_id(payload.message_id)?,
            },
            Body::ChatReaction(payload) => ChatEvent::Reaction {
                message_id: payload.message_id,
                reaction: payload.reaction,
            },
            Body::ChatReadStatus(payload) => ChatEvent::ReadReceipt {
                message_id: payload.message_id,
            },
            Body::ChatTyping(payload) => ChatEvent::TypingStart {
                user_name: payload.user_name,
            },
            Body::ChatTypingStop(payload) => ChatEvent::TypingStop {
                user_name: payload.user_name,
            },
            other => {
                return Err(HubError::Protocol(format!(
                    "{} is not a chat message",
                    other.kind()
                )))
            }
        };
        Ok(event)
    }
}

fn required_message_id(id: Option<Uuid>) -> Result<Uuid, HubError> {
    id.ok_or_else(|| HubError::Validation("messageId is required".to_string()))
}

/// A chat event together with its origin.
///
/// `identity` and `peer_id` come from the connection, never from the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEnvelope {
    pub room_id: MeetingId,
    pub peer_id: String,
    pub identity: PeerIdentity,
    pub event: ChatEvent,
}

impl ChatEnvelope {
    /// # Errors
    ///
    /// See [`ChatEvent::from_body`].
    pub fn from_frame(
        frame: Envelope,
        peer_id: impl Into<String>,
        identity: PeerIdentity,
    ) -> Result<Self, HubError> {
        Ok(Self {
            room_id: frame.meeting_id,
            peer_id: peer_id.into(),
            identity,
            event: ChatEvent::from_body(frame.body)?,
        })
    }
}

/// Trim and bound message content.
///
/// # Errors
///
/// Returns `HubError::Validation` for empty or oversized content.
pub fn validate_content(content: &str, allow_empty: bool) -> Result<String, HubError> {
    let trimmed = content.trim();
    if trimmed.is_empty() && !allow_empty {
        return Err(HubError::Validation(
            "message content cannot be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(HubError::Validation(format!(
            "message content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// # Errors
///
/// Returns `HubError::Validation` for empty or oversized reactions.
pub fn validate_reaction(reaction: &str) -> Result<String, HubError> {
    let trimmed = reaction.trim();
    if trimmed.is_empty() {
        return Err(HubError::Validation("reaction cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_REACTION_CHARS {
        return Err(HubError::Validation(format!(
            "reaction exceeds {MAX_REACTION_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Messages, reactions and read markers for one room.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: HashMap<Uuid, ChatMessage>,
    reactions: HashSet<(Uuid, String, PeerIdentity)>,
    /// Creation sequence of the newest message each identity has read.
    read_markers: HashMap<PeerIdentity, u64>,
}

impl ChatLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a new message.
    ///
    /// # Errors
    ///
    /// `HubError::Validation` for invalid content, an unknown reply target or
    /// a reused message id.
    pub fn post(
        &mut self,
        room_id: MeetingId,
        author: &PeerIdentity,
        author_peer_id: &str,
        draft: MessageDraft,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, HubError> {
        let content = validate_content(&draft.content, draft.attachment_url.is_some())?;

        if let Some(reply_to) = draft.reply_to_id {
            if !self.messages.contains_key(&reply_to) {
                return Err(HubError::Validation(
                    "reply target is not a message in this room".to_string(),
                ));
            }
        }

        let id = draft.message_id.unwrap_or_else(Uuid::new_v4);
        if self.messages.contains_key(&id) {
            return Err(HubError::Validation("message id already used".to_string()));
        }

        let message = ChatMessage {
            id,
            room_id,
            author: author.clone(),
            author_peer_id: author_peer_id.to_string(),
            message_type: draft.message_type,
            content,
            reply_to_id: draft.reply_to_id,
            attachment_url: draft.attachment_url,
            attachment_type: draft.attachment_type,
            attachment_name: draft.attachment_name,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            sequence,
        };
        self.messages.insert(id, message.clone());
        Ok(message)
    }

    /// Replace a message's content. Author only.
    ///
    /// # Errors
    ///
    /// `MessageNotFound`, `PermissionDenied`, or `Validation` for deleted
    /// messages and invalid content.
    pub fn edit(
        &mut self,
        editor: &PeerIdentity,
        message_id: &Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, HubError> {
        let content = validate_content(content, false)?;
        let message = self.owned_message_mut(editor, message_id)?;
        message.content = content;
        message.is_edited = true;
        message.edited_at = Some(now);
        Ok(message.clone())
    }

    /// Soft delete: content becomes the tombstone placeholder. Author only.
    ///
    /// # Errors
    ///
    /// `MessageNotFound`, `PermissionDenied`, or `Validation` if already deleted.
    pub fn delete(
        &mut self,
        deleter: &PeerIdentity,
        message_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, HubError> {
        let message = self.owned_message_mut(deleter, message_id)?;
        message.content = DELETED_PLACEHOLDER.to_string();
        message.is_deleted = true;
        message.deleted_at = Some(now);
        Ok(message.clone())
    }

    fn owned_message_mut(
        &mut self,
        identity: &PeerIdentity,
        message_id: &Uuid,
    ) -> Result<&mut ChatMessage, HubError> {
        let message = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| HubError::MessageNotFound(message_id.to_string()))?;
        if message.is_deleted {
            return Err(HubError::Validation("message has been deleted".to_string()));
        }
        if &message.author != identity {
            return Err(HubError::PermissionDenied(
                "only the author may change a message".to_string(),
            ));
        }
        Ok(message)
    }

    /// Toggle `identity`'s reaction on a message.
    ///
    /// # Errors
    ///
    /// `Validation` for an invalid reaction or a deleted message,
    /// `MessageNotFound` for an unknown message.
    pub fn toggle_reaction(
        &mut self,
        identity: &PeerIdentity,
        message_id: &Uuid,
        reaction: &str,
    ) -> Result<(String, ReactionAction), HubError> {
        let reaction = validate_reaction(reaction)?;
        let message = self
            .messages
            .get(message_id)
            .ok_or_else(|| HubError::MessageNotFound(message_id.to_string()))?;
        if message.is_deleted {
            return Err(HubError::Validation("message has been deleted".to_string()));
        }

        let key = (*message_id, reaction.clone(), identity.clone());
        let action = if self.reactions.remove(&key) {
            ReactionAction::Remove
        } else {
            self.reactions.insert(key);
            ReactionAction::Add
        };
        Ok((reaction, action))
    }

    /// Record that `reader` has read up to and including `message_id`.
    /// Returns the message's author.
    ///
    /// # Errors
    ///
    /// `MessageNotFound` for an unknown message.
    pub fn mark_read(
        &mut self,
        reader: &PeerIdentity,
        message_id: &Uuid,
    ) -> Result<PeerIdentity, HubError> {
        let message = self
            .messages
            .get(message_id)
            .ok_or_else(|| HubError::MessageNotFound(message_id.to_string()))?;
        let marker = self.read_markers.entry(reader.clone()).or_insert(0);
        *marker = (*marker).max(message.sequence);
        Ok(message.author.clone())
    }

    /// Non-deleted messages by others that `identity` has not read.
    #[must_use]
    pub fn unread_count(&self, identity: &PeerIdentity) -> usize {
        let marker = self.read_markers.get(identity).copied().unwrap_or(0);
        self.messages
            .values()
            .filter(|m| !m.is_deleted && &m.author != identity && m.sequence > marker)
            .count()
    }
}

/// Typing indicator for one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingEntry {
    pub identity: PeerIdentity,
    pub user_name: Option<String>,
    pub expires_at: Instant,
}

/// Per-peer typing expiries.
#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    typing: HashMap<String, TypingEntry>,
}

impl TypingTracker {
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            typing: HashMap::new(),
        }
    }

    /// Start or refresh typing. Returns `true` if the peer was not already typing.
    pub fn start(
        &mut self,
        peer_id: &str,
        identity: &PeerIdentity,
        user_name: Option<String>,
        now: Instant,
    ) -> bool {
        let entry = TypingEntry {
            identity: identity.clone(),
            user_name,
            expires_at: now + self.expiry,
        };
        self.typing.insert(peer_id.to_string(), entry).is_none()
    }

    pub fn stop(&mut self, peer_id: &str) -> Option<TypingEntry> {
        self.typing.remove(peer_id)
    }

    /// Remove and return every entry whose expiry has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(String, TypingEntry)> {
        let expired: Vec<String> = self
            .typing
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|peer_id| self.typing.remove(&peer_id).map(|e| (peer_id, e)))
            .collect()
    }

    #[must_use]
    pub fn is_typing(&self, peer_id: &str) -> bool {
        self.typing.contains_key(peer_id)
    }

    #[must_use]
    pub fn identities(&self) -> Vec<PeerIdentity> {
        self.typing.values().map(|e| e.identity.clone()).collect()
    }
}
