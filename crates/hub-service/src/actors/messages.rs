//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::chat::ChatEnvelope;
use crate::errors::HubError;
use crate::protocol::{Envelope, LeaveReason, ParticipantPayload};
use crate::signaling::{PeerConnectionState, SignalingEnvelope};

use super::connection::FrameSink;
use super::room::RoomActorHandle;

use chrono::{DateTime, Utc};
use common::types::{MeetingId, PeerIdentity};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Resolve a room, creating it when `create` is set.
    ResolveRoom {
        room_id: MeetingId,
        create: bool,
        respond_to: oneshot::Sender<Result<RoomActorHandle, HubError>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms, cancel every room and wait up to `deadline`.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinResult, JoinRejected>>,
    },

    /// Remove a peer. With `connection_id` set, the leave only applies if the
    /// peer is still attached through that connection.
    Leave {
        peer_id: String,
        connection_id: Option<String>,
        reason: LeaveReason,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    GetView {
        respond_to: oneshot::Sender<RoomView>,
    },

    ListPeers {
        respond_to: oneshot::Sender<Vec<PeerInfo>>,
    },

    UpdateState {
        peer_id: String,
        state: PeerConnectionState,
        respond_to: oneshot::Sender<Result<PeerInfo, HubError>>,
    },

    /// Refresh a peer's last-seen time.
    Touch {
        peer_id: String,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    GetStats {
        respond_to: oneshot::Sender<RoomStats>,
    },

    Relay {
        envelope: SignalingEnvelope,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    Publish {
        envelope: ChatEnvelope,
        respond_to: oneshot::Sender<Result<PublishOutcome, HubError>>,
    },

    UnreadCount {
        identity: PeerIdentity,
        respond_to: oneshot::Sender<usize>,
    },

    FindPeer {
        identity: PeerIdentity,
        respond_to: oneshot::Sender<Option<PeerInfo>>,
    },

    /// Push a server frame to one peer (error replies).
    Notify { peer_id: String, frame: Envelope },

    /// Registry sweep. The room answers `true` and stops if it has been
    /// empty for at least `grace`.
    TryEvict {
        grace: Duration,
        respond_to: oneshot::Sender<bool>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write a frame to the peer's transport.
    Deliver { frame: Envelope },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// A peer asking to enter a room.
pub struct JoinRequest {
    /// Requested peer id; derived from the identity when absent.
    pub peer_id: Option<String>,
    pub identity: PeerIdentity,
    pub name: String,
    pub avatar_url: Option<String>,
    /// Outbound path for this peer. REST-only peers have none.
    pub transport: Option<Box<dyn FrameSink>>,
}

impl JoinRequest {
    #[must_use]
    pub fn new(identity: PeerIdentity, name: impl Into<String>) -> Self {
        Self {
            peer_id: None,
            identity,
            name: name.into(),
            avatar_url: None,
            transport: None,
        }
    }

    #[must_use]
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    #[must_use]
    pub fn with_avatar_url(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Box<dyn FrameSink>) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl fmt::Debug for JoinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinRequest")
            .field("peer_id", &self.peer_id)
            .field("identity", &self.identity)
            .field("name", &self.name)
            .field("avatar_url", &self.avatar_url)
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}

/// A failed join. The request comes back when the room never consumed it, so
/// the caller can retry or report the error over the same transport.
#[derive(Debug)]
pub struct JoinRejected {
    pub error: HubError,
    pub request: Option<JoinRequest>,
}

impl JoinRejected {
    #[must_use]
    pub fn new(error: HubError, request: Option<JoinRequest>) -> Self {
        Self { error, request }
    }

    /// Take back the transport, if any.
    #[must_use]
    pub fn into_transport(self) -> Option<Box<dyn FrameSink>> {
        self.request.and_then(|r| r.transport)
    }
}

impl From<JoinRejected> for HubError {
    fn from(rejected: JoinRejected) -> Self {
        rejected.error
    }
}

/// Public view of a peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    #[serde(rename = "participantId")]
    pub peer_id: String,
    pub identity: PeerIdentity,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub is_authenticated: bool,
    pub state: PeerConnectionState,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Whether an outbound transport is attached.
    pub connected: bool,
}

impl PeerInfo {
    /// `participant-joined` payload announcing this peer.
    #[must_use]
    pub fn to_participant(&self) -> ParticipantPayload {
        ParticipantPayload {
            participant_id: self.peer_id.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            is_authenticated: self.is_authenticated,
        }
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResult {
    #[serde(rename = "participant")]
    pub peer: PeerInfo,
    /// Set when a transport was attached.
    #[serde(skip)]
    pub connection_id: Option<String>,
    /// Peer id displaced by this join (same identity reconnecting).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced: Option<String>,
    /// Everyone else in the room.
    #[serde(rename = "participants")]
    pub peers: Vec<PeerInfo>,
}

/// Result of a published chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    /// Successful enqueues.
    pub delivered: usize,
    pub sequence: u64,
}

/// Snapshot of a room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub room_id: MeetingId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub peers: Vec<PeerInfo>,
    /// Last assigned chat sequence.
    pub sequence: u64,
    /// Highest sequence whose durable write has settled.
    pub durable_sequence: u64,
    /// Sequences whose write failed after every retry.
    pub pending_reconciliation: Vec<u64>,
    pub typing: Vec<PeerIdentity>,
}

/// Aggregate counters for a room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: MeetingId,
    pub exists: bool,
    pub peer_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    pub state_histogram: BTreeMap<PeerConnectionState, usize>,
    pub pending_reconciliation: Vec<u64>,
}

impl RoomStats {
    /// Stats for a meeting with no live room.
    #[must_use]
    pub fn absent(room_id: MeetingId) -> Self {
        Self {
            room_id,
            exists: false,
            peer_count: 0,
            created_at: None,
            last_activity: None,
            state_histogram: empty_histogram(),
            pending_reconciliation: Vec::new(),
        }
    }
}

/// Histogram with every state present at zero.
#[must_use]
pub fn empty_histogram() -> BTreeMap<PeerConnectionState, usize> {
    PeerConnectionState::ALL.iter().map(|s| (*s, 0)).collect()
}

/// Status of the `RoomRegistryActor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
