//! End-to-end scenarios through the `Hub` facade.
//!
//! Peers attach in-process subscribers so every frame the hub would write to a
//! socket can be asserted on.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod support;

use std::time::Duration;

use common::types::MeetingId;
use futures_util::future::join_all;
use hub_service::actors::RoomSettings;
use hub_service::chat::{ChatEnvelope, ChatEvent, MessageDraft};
use hub_service::errors::HubError;
use hub_service::protocol::{Body, LeaveReason, SessionDescription};
use hub_service::signaling::{SignalPayload, SignalingEnvelope};
use support::{join_with_sink, next_of, receives, test_hub, test_hub_with, user};

fn say(content: &str) -> ChatEvent {
    ChatEvent::Message(MessageDraft {
        content: content.to_string(),
        ..MessageDraft::default()
    })
}

#[tokio::test]
async fn test_offer_reaches_target_once_from_sender() {
    let hub = test_hub();
    let room_id = MeetingId::new();
    let (a, mut rx_a) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;
    let (b, mut rx_b) = join_with_sink(&hub, room_id, user("bob"), "Bob").await;

    let offer = SignalingEnvelope::new(
        room_id,
        a.clone(),
        b.clone(),
        SignalPayload::Offer(SessionDescription {
            sdp: "v=0\r\no=- 1 1 IN IP4 0.0.0.0".to_string(),
            sdp_type: Some("offer".to_string()),
        }),
    )
    .unwrap();
    hub.relay(offer).await.unwrap();

    let frame = next_of(&mut rx_b, "offer").await;
    assert_eq!(frame.from, a);
    assert_eq!(frame.to.as_deref(), Some(b.as_str()));

    assert!(!receives(&mut rx_b, "offer", Duration::from_millis(100)).await);
    assert!(!receives(&mut rx_a, "offer", Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_offer_to_absent_peer_changes_nothing() {
    let hub = test_hub();
    let room_id = MeetingId::new();
    let (a, _rx_a) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;
    let before = hub.get(room_id).await.unwrap();

    let offer = SignalingEnvelope::new(
        room_id,
        a,
        "user_ghost",
        SignalPayload::Offer(SessionDescription {
            sdp: "v=0".to_string(),
            sdp_type: None,
        }),
    )
    .unwrap();
    let err = hub.relay(offer).await.unwrap_err();
    assert!(matches!(err, HubError::PeerNotInRoom(_)));

    let after = hub.get(room_id).await.unwrap();
    assert_eq!(before.peers, after.peers);
    assert_eq!(before.sequence, after.sequence);
}

#[tokio::test]
async fn test_chat_message_reaches_everyone_with_one_sequence() {
    let hub = test_hub();
    let room_id = MeetingId::new();
    let (a, mut rx_a) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;
    let (_b, mut rx_b) = join_with_sink(&hub, room_id, user("bob"), "Bob").await;

    let outcome = hub
        .publish(ChatEnvelope {
            room_id,
            peer_id: a,
            identity: user("alice"),
            event: say("hi"),
        })
        .await
        .unwrap();
    assert_eq!(outcome.sequence, 1);
    assert_eq!(outcome.delivered, 2);

    let mut ids = Vec::new();
    for rx in [&mut rx_a, &mut rx_b] {
        let frame = next_of(rx, "chat-message").await;
        let Body::ChatMessage(payload) = frame.body else {
            panic!("expected chat-message");
        };
        assert_eq!(payload.content, "hi");
        assert_eq!(payload.sequence, Some(1));
        assert_eq!(payload.identity, Some(user("alice")));
        ids.push(payload.message_id);
    }
    assert_eq!(ids.first(), ids.last());
}

#[tokio::test]
async fn test_concurrent_publishes_are_gap_free() {
    let hub = test_hub();
    let room_id = MeetingId::new();
    let (a, mut rx_a) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;
    let (b, _rx_b) = join_with_sink(&hub, room_id, user("bob"), "Bob").await;

    let publishes = (0..20).map(|i| {
        let hub = hub.clone();
        let (peer_id, identity) = if i % 2 == 0 {
            (a.clone(), user("alice"))
        } else {
            (b.clone(), user("bob"))
        };
        async move {
            hub.publish(ChatEnvelope {
                room_id,
                peer_id,
                identity,
                event: say(&format!("message {i}")),
            })
            .await
            .unwrap()
            .sequence
        }
    });
    let mut sequences = join_all(publishes).await;
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());

    let mut seen = Vec::new();
    for _ in 0..20 {
        let frame = next_of(&mut rx_a, "chat-message").await;
        let Body::ChatMessage(payload) = frame.body else {
            panic!("expected chat-message");
        };
        seen.push(payload.sequence.unwrap());
    }
    assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_read_receipt_reaches_only_the_author() {
    let hub = test_hub();
    let room_id = MeetingId::new();
    let (a, mut rx_a) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;
    let (b, mut rx_b) = join_with_sink(&hub, room_id, user("bob"), "Bob").await;
    let (_c, mut rx_c) = join_with_sink(&hub, room_id, user("carol"), "Carol").await;

    hub.publish(ChatEnvelope {
        room_id,
        peer_id: a,
        identity: user("alice"),
        event: say("please read"),
    })
    .await
    .unwrap();

    let frame = next_of(&mut rx_b, "chat-message").await;
    let Body::ChatMessage(payload) = frame.body else {
        panic!("expected chat-message");
    };
    let message_id = payload.message_id.unwrap();
    assert_eq!(hub.unread_count(room_id, user("bob")).await.unwrap(), 1);

    hub.publish(ChatEnvelope {
        room_id,
        peer_id: b,
        identity: user("bob"),
        event: ChatEvent::ReadReceipt { message_id },
    })
    .await
    .unwrap();

    let receipt = next_of(&mut rx_a, "chat-read-status").await;
    let Body::ChatReadStatus(payload) = receipt.body else {
        panic!("expected chat-read-status");
    };
    assert_eq!(payload.message_id, message_id);
    assert_eq!(payload.identity, Some(user("bob")));

    assert!(!receives(&mut rx_b, "chat-read-status", Duration::from_millis(100)).await);
    assert!(!receives(&mut rx_c, "chat-read-status", Duration::from_millis(100)).await);
    assert_eq!(hub.unread_count(room_id, user("bob")).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_announced_after_heartbeat_timeout() {
    let hub = test_hub_with(RoomSettings {
        heartbeat_timeout: Duration::from_secs(60),
        ..RoomSettings::default()
    });
    let room_id = MeetingId::new();
    let (a, mut rx_a) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;
    let (b, _rx_b) = join_with_sink(&hub, room_id, user("bob"), "Bob").await;

    // Alice keeps talking, Bob goes quiet
    for _ in 0..7 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        hub.touch(room_id, a.clone()).await.unwrap();
    }

    let left = next_of(&mut rx_a, "participant-left").await;
    let Body::ParticipantLeft(payload) = left.body else {
        panic!("expected participant-left");
    };
    assert_eq!(payload.participant_id, b);
    assert_eq!(payload.reason, LeaveReason::Timeout);

    let peers = hub.list_peers(room_id).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers.first().unwrap().peer_id, a);
}

#[tokio::test(start_paused = true)]
async fn test_turn_credentials_cached_within_ttl() {
    let hub = test_hub();
    let room_id = MeetingId::new();

    let first = hub.issue_credential(&user("alice"), room_id, None).unwrap();
    tokio::time::advance(Duration::from_secs(120)).await;
    let cached = hub.issue_credential(&user("alice"), room_id, None).unwrap();
    assert_eq!(first, cached);

    tokio::time::advance(Duration::from_secs(181)).await;
    let fresh = hub.issue_credential(&user("alice"), room_id, None).unwrap();
    assert_ne!(first.password, fresh.password);
    assert!(hub.credentials().verify(&fresh.username, &fresh.password));
}

#[tokio::test]
async fn test_rejoin_replaces_old_connection() {
    let hub = test_hub();
    let room_id = MeetingId::new();
    let (_a, mut rx_a_old) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;
    let (_b, mut rx_b) = join_with_sink(&hub, room_id, user("bob"), "Bob").await;

    let (a_new, _rx_a_new) = join_with_sink(&hub, room_id, user("alice"), "Alice").await;

    // The displaced subscriber is closed
    tokio::time::timeout(Duration::from_secs(5), async {
        while rx_a_old.recv().await.is_some() {}
    })
    .await
    .unwrap();

    let left = next_of(&mut rx_b, "participant-left").await;
    let Body::ParticipantLeft(payload) = left.body else {
        panic!("expected participant-left");
    };
    assert_eq!(payload.reason, LeaveReason::Replaced);
    let joined = next_of(&mut rx_b, "participant-joined").await;
    assert_eq!(joined.from, a_new);

    let peers = hub.list_peers(room_id).await.unwrap();
    assert_eq!(peers.len(), 2);
}
