//! `Hub` - the in-process entry point used by the REST and WebSocket layers.
//!
//! Wraps the room registry and the credential issuer behind one cloneable
//! value. Every room operation resolves the room through the registry and
//! then talks to the room actor directly; the registry is never on the
//! per-message path.

use crate::actors::{
    ActorMetrics, JoinRejected, JoinRequest, JoinResult, PeerInfo, PublishOutcome,
    RegistryStatus, RoomActorHandle, RoomRegistryHandle, RoomSettings, RoomStats, RoomView,
};
use crate::chat::ChatEnvelope;
use crate::errors::HubError;
use crate::persistence::ChatStore;
use crate::protocol::{Envelope, LeaveReason};
use crate::signaling::{PeerConnectionState, SignalingEnvelope};
use crate::turn::{CredentialIssuer, IceServer, RelayCredential, TurnSettings};

use common::types::{MeetingId, PeerIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct Hub {
    registry: RoomRegistryHandle,
    credentials: Arc<CredentialIssuer>,
    metrics: Arc<ActorMetrics>,
}

impl Hub {
    /// Start the registry actor and build the issuer.
    #[must_use]
    pub fn new(
        hub_id: String,
        settings: RoomSettings,
        store: Arc<dyn ChatStore>,
        turn: TurnSettings,
    ) -> Self {
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(hub_id, settings, store, Arc::clone(&metrics));
        Self {
            registry,
            credentials: Arc::new(CredentialIssuer::new(turn)),
            metrics,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialIssuer> {
        &self.credentials
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    async fn room(&self, room_id: MeetingId) -> Result<RoomActorHandle, HubError> {
        self.registry.existing_room(room_id).await
    }

    /// Add a peer to a room, creating the room on first join.
    ///
    /// A room evicted between lookup and join is recreated once.
    ///
    /// # Errors
    ///
    /// `RoomFull`, `Conflict` or `Draining`. The transport comes back in the
    /// rejection whenever the join did not consume it.
    pub async fn join(
        &self,
        room_id: MeetingId,
        request: JoinRequest,
    ) -> Result<JoinResult, JoinRejected> {
        let mut request = request;
        for _ in 0..2 {
            let room = match self.registry.room(room_id).await {
                Ok(room) => room,
                Err(e) => return Err(JoinRejected::new(e, Some(request))),
            };
            match room.join(request).await {
                Err(JoinRejected {
                    error: HubError::RoomClosed(_),
                    request: Some(returned),
                }) => {
                    debug!(
                        target: "hub.api",
                        meeting_id = %room_id,
                        "Room closed during join, retrying on a fresh room"
                    );
                    request = returned;
                }
                other => return other,
            }
        }
        Err(JoinRejected::new(
            HubError::RoomClosed(room_id.to_string()),
            Some(request),
        ))
    }

    /// # Errors
    ///
    /// `RoomNotFound` or `PeerNotFound`.
    pub async fn leave(
        &self,
        room_id: MeetingId,
        peer_id: String,
        connection_id: Option<String>,
        reason: LeaveReason,
    ) -> Result<(), HubError> {
        self.room(room_id)
            .await?
            .leave(peer_id, connection_id, reason)
            .await
    }

    /// # Errors
    ///
    /// `RoomNotFound` if the meeting has no live room.
    pub async fn get(&self, room_id: MeetingId) -> Result<RoomView, HubError> {
        self.room(room_id).await?.view().await
    }

    /// # Errors
    ///
    /// `RoomNotFound` if the meeting has no live room.
    pub async fn list_peers(&self, room_id: MeetingId) -> Result<Vec<PeerInfo>, HubError> {
        self.room(room_id).await?.list_peers().await
    }

    /// # Errors
    ///
    /// `RoomNotFound`, `PeerNotFound` or `InvalidTransition`.
    pub async fn update_state(
        &self,
        room_id: MeetingId,
        peer_id: String,
        state: PeerConnectionState,
    ) -> Result<PeerInfo, HubError> {
        self.room(room_id)
            .await?
            .update_state(peer_id, state)
            .await
    }

    /// # Errors
    ///
    /// `RoomNotFound` or `PeerNotFound`.
    pub async fn touch(&self, room_id: MeetingId, peer_id: String) -> Result<(), HubError> {
        self.room(room_id).await?.touch(peer_id).await
    }

    /// Stats for a meeting. A meeting with no live room reports `exists: false`.
    ///
    /// # Errors
    ///
    /// `Draining` once shutdown has begun.
    pub async fn room_stats(&self, room_id: MeetingId) -> Result<RoomStats, HubError> {
        let room = match self.room(room_id).await {
            Ok(room) => room,
            Err(HubError::RoomNotFound(_)) => return Ok(RoomStats::absent(room_id)),
            Err(e) => return Err(e),
        };
        match room.stats().await {
            Err(HubError::RoomClosed(_)) => Ok(RoomStats::absent(room_id)),
            other => other,
        }
    }

    /// # Errors
    ///
    /// `RoomNotFound`, `PeerNotInRoom` or `Validation`.
    pub async fn relay(&self, envelope: SignalingEnvelope) -> Result<(), HubError> {
        self.room(envelope.room_id).await?.relay(envelope).await
    }

    /// # Errors
    ///
    /// `RoomNotFound`, `NotInMeeting` or a chat validation error.
    pub async fn publish(&self, envelope: ChatEnvelope) -> Result<PublishOutcome, HubError> {
        self.room(envelope.room_id).await?.publish(envelope).await
    }

    /// # Errors
    ///
    /// `RoomNotFound` if the meeting has no live room.
    pub async fn unread_count(
        &self,
        room_id: MeetingId,
        identity: PeerIdentity,
    ) -> Result<usize, HubError> {
        self.room(room_id).await?.unread_count(identity).await
    }

    /// The caller's peer in a room.
    ///
    /// # Errors
    ///
    /// `NotInMeeting` if the room does not exist or holds no peer for `identity`.
    pub async fn find_peer(
        &self,
        room_id: MeetingId,
        identity: PeerIdentity,
    ) -> Result<PeerInfo, HubError> {
        let room = match self.room(room_id).await {
            Ok(room) => room,
            Err(HubError::RoomNotFound(_)) => return Err(HubError::NotInMeeting),
            Err(e) => return Err(e),
        };
        room.find_peer(identity)
            .await?
            .ok_or(HubError::NotInMeeting)
    }

    /// Push a server frame to one peer, if it is still there.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` if the meeting has no live room.
    pub async fn notify(
        &self,
        room_id: MeetingId,
        peer_id: String,
        frame: Envelope,
    ) -> Result<(), HubError> {
        self.room(room_id).await?.notify(peer_id, frame).await
    }

    /// # Errors
    ///
    /// `Credential` if derivation fails.
    pub fn issue_credential(
        &self,
        identity: &PeerIdentity,
        room_id: MeetingId,
        ttl: Option<Duration>,
    ) -> Result<RelayCredential, HubError> {
        self.credentials.issue(identity, room_id, ttl)
    }

    /// STUN list plus a TURN entry with a credential for `identity`.
    ///
    /// # Errors
    ///
    /// `Credential` if derivation fails.
    pub fn ice_servers(
        &self,
        identity: &PeerIdentity,
        room_id: MeetingId,
    ) -> Result<Vec<IceServer>, HubError> {
        let credential = self.credentials.issue(identity, room_id, None)?;
        Ok(self.credentials.ice_servers(&credential))
    }

    /// # Errors
    ///
    /// `Draining` if the registry has stopped.
    pub async fn status(&self) -> Result<RegistryStatus, HubError> {
        self.registry.status().await
    }

    /// Close every connection and stop every room, waiting up to `deadline`.
    ///
    /// # Errors
    ///
    /// `Draining` if shutdown already completed.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), HubError> {
        self.registry.shutdown(deadline).await
    }

    /// Token cancelled when the hub shuts down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.registry.child_token()
    }
}
