//! Common data types for Dark Tower hub components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a meeting (one live room per meeting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(pub Uuid);

/// The supplied meeting identifier is not a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid meeting id")]
pub struct InvalidMeetingId;

impl MeetingId {
    /// Create a new random meeting ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a meeting ID from its textual (hyphenated UUID) form.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMeetingId`] if `s` is not a UUID.
    pub fn parse(s: &str) -> Result<Self, InvalidMeetingId> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| InvalidMeetingId)
    }
}

impl Default for MeetingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MeetingId {
    type Err = InvalidMeetingId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Who owns a live connection.
///
/// Exactly one of an authenticated user id or an anonymous (guest) session id.
/// Serialized as `{"userId": ".."}` or `{"sessionId": ".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerIdentity {
    /// Authenticated user.
    #[serde(rename = "userId")]
    User(String),
    /// Anonymous guest session.
    #[serde(rename = "sessionId")]
    Session(String),
}

impl PeerIdentity {
    /// Whether this identity belongs to an authenticated user.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// The raw user or session id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Session(id) => id,
        }
    }

    /// Peer id used when the caller does not supply one.
    ///
    /// Deterministic so that a reconnect from the same identity lands on the
    /// same peer id.
    #[must_use]
    pub fn default_peer_id(&self) -> String {
        match self {
            Self::User(id) => format!("user_{id}"),
            Self::Session(id) => format!("public_{id}"),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Session(id) => write!(f, "session:{id}"),
        }
    }
}
