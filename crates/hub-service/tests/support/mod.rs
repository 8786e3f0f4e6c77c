//! Shared fixtures for hub integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use common::secret::SecretString;
use common::types::{MeetingId, PeerIdentity};
use hub_service::actors::{ChannelSink, JoinRequest, RoomSettings};
use hub_service::hub::Hub;
use hub_service::persistence::InMemoryChatStore;
use hub_service::protocol::Envelope;
use hub_service::turn::TurnSettings;
use tokio::sync::mpsc;

pub const TURN_SERVER: &str = "turn.example.com";

pub fn turn_settings() -> TurnSettings {
    TurnSettings {
        shared_secret: SecretString::from("integration-turn-secret"),
        server: TURN_SERVER.to_string(),
        default_ttl: Duration::from_secs(86_400),
        max_ttl: Duration::from_secs(86_400),
        cache_ttl: Duration::from_secs(300),
    }
}

pub fn test_hub() -> Hub {
    test_hub_with(RoomSettings::default())
}

pub fn test_hub_with(settings: RoomSettings) -> Hub {
    Hub::new(
        "hub-it".to_string(),
        settings,
        Arc::new(InMemoryChatStore::new()),
        turn_settings(),
    )
}

pub fn user(id: &str) -> PeerIdentity {
    PeerIdentity::User(id.to_string())
}

/// Join with an in-process subscriber and consume the join ack.
pub async fn join_with_sink(
    hub: &Hub,
    room_id: MeetingId,
    identity: PeerIdentity,
    name: &str,
) -> (String, mpsc::Receiver<Envelope>) {
    let (sink, mut rx) = ChannelSink::new(64);
    let result = hub
        .join(
            room_id,
            JoinRequest::new(identity, name).with_transport(Box::new(sink)),
        )
        .await
        .expect("join should succeed");
    let ack = next_of(&mut rx, "join").await;
    assert_eq!(ack.from, result.peer.peer_id);
    (result.peer.peer_id, rx)
}

/// Next frame of `kind`, skipping anything else.
pub async fn next_of(rx: &mut mpsc::Receiver<Envelope>, kind: &str) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = rx.recv().await.expect("subscriber closed");
            if frame.body.kind() == kind {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} frame"))
}

/// Whether a frame of `kind` shows up within `wait`.
pub async fn receives(rx: &mut mpsc::Receiver<Envelope>, kind: &str, wait: Duration) -> bool {
    tokio::time::timeout(wait, async {
        while let Some(frame) = rx.recv().await {
            if frame.body.kind() == kind {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}
