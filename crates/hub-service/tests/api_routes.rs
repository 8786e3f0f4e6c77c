//! Control-plane routes driven through the router with `oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::types::MeetingId;
use http_body_util::BodyExt;
use hub_service::api::{build_routes, AppState};
use serde_json::{json, Value};
use support::test_hub;
use tower::ServiceExt;

fn app() -> Router {
    build_routes(Arc::new(AppState { hub: test_hub() }))
}

fn path(room_id: MeetingId, action: &str) -> String {
    format!("/api/v1/webrtc/meetings/{room_id}/{action}")
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header("x-user-id", user);
    }
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn join_as(app: &Router, room_id: MeetingId, user: &str) {
    let (status, _) = call(app, Method::POST, &path(room_id, "join"), Some(user), None).await;
    assert_eq!(status, StatusCode::OK);
}

async fn get_as(app: &Router, room_id: MeetingId, action: &str, user: &str) -> (StatusCode, Value) {
    call(app, Method::GET, &path(room_id, action), Some(user), None).await
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap()
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let app = app();
    let peers = path(MeetingId::new(), "peers");
    let (status, body) = call(&app, Method::GET, &peers, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "UNAUTHORIZED");
}

#[tokio::test]
async fn test_malformed_meeting_id_is_rejected() {
    let app = app();
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/webrtc/meetings/not-a-meeting/join",
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "INVALID_MEETING_ID");
}

#[tokio::test]
async fn test_join_marks_peer_connecting() {
    let app = app();
    let room_id = MeetingId::new();
    let (status, body) = call(
        &app,
        Method::POST,
        &path(room_id, "join"),
        Some("alice"),
        Some(json!({ "name": "Alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["participant"]["participantId"], "user_alice");
    assert_eq!(body["participant"]["state"], "connecting");
    assert_eq!(body["participant"]["name"], "Alice");

    let (status, body) = get_as(&app, room_id, "peers", "bob").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["participants"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_offer_from_outsider_is_not_in_meeting() {
    let app = app();
    let room_id = MeetingId::new();
    join_as(&app, room_id, "alice").await;

    let (status, body) = call(
        &app,
        Method::POST,
        &path(room_id, "offer"),
        Some("mallory"),
        Some(json!({ "to": "user_alice", "offer": { "sdp": "v=0", "type": "offer" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "NOT_IN_MEETING");
}

#[tokio::test]
async fn test_offer_to_absent_peer_fails() {
    let app = app();
    let room_id = MeetingId::new();
    join_as(&app, room_id, "alice").await;

    let (status, body) = call(
        &app,
        Method::POST,
        &path(room_id, "offer"),
        Some("alice"),
        Some(json!({ "to": "user_ghost", "offer": { "sdp": "v=0", "type": "offer" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "OFFER_FAILED");
}

#[tokio::test]
async fn test_offer_with_bad_body_fails() {
    let app = app();
    let room_id = MeetingId::new();
    join_as(&app, room_id, "alice").await;

    let (status, body) = call(
        &app,
        Method::POST,
        &path(room_id, "offer"),
        Some("alice"),
        Some(json!({ "target": "user_bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "OFFER_FAILED");
}

#[tokio::test]
async fn test_backwards_state_transition_fails() {
    let app = app();
    let room_id = MeetingId::new();
    join_as(&app, room_id, "alice").await;

    let (status, body) = call(
        &app,
        Method::PUT,
        &path(room_id, "peer-state"),
        Some("alice"),
        Some(json!({ "state": "connected" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "connected");

    let (status, body) = call(
        &app,
        Method::PUT,
        &path(room_id, "peer-state"),
        Some("alice"),
        Some(json!({ "state": "new" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "UPDATE_FAILED");
}

#[tokio::test]
async fn test_stats_for_unknown_room() {
    let app = app();
    let (status, body) = get_as(&app, MeetingId::new(), "stats", "alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exists"], false);
    assert_eq!(body["peerCount"], 0);
}

#[tokio::test]
async fn test_turn_credentials_honor_requested_ttl() {
    let app = app();
    let (status, body) = call(
        &app,
        Method::POST,
        &path(MeetingId::new(), "turn-credentials"),
        Some("alice"),
        Some(json!({ "ttl": 3600 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ttl"], 3600);
    assert!(body["username"].as_str().unwrap().contains(':'));
    assert!(!body["urls"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_ice_servers_include_stun_and_turn() {
    let app = app();
    let (status, body) = call(
        &app,
        Method::GET,
        &path(MeetingId::new(), "ice-servers"),
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let servers = body["iceServers"].as_array().unwrap();
    assert_eq!(servers.len(), 5);
    let turn = servers.last().unwrap();
    assert!(turn["username"].is_string());
    assert!(turn["credential"].is_string());
}

#[tokio::test]
async fn test_second_leave_is_not_in_meeting() {
    let app = app();
    let room_id = MeetingId::new();
    join_as(&app, room_id, "alice").await;

    let leave = path(room_id, "leave");
    let (status, body) = call(&app, Method::POST, &leave, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = call(&app, Method::POST, &leave, Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "NOT_IN_MEETING");
}

#[tokio::test]
async fn test_leave_for_another_peer_is_refused() {
    let app = app();
    let room_id = MeetingId::new();
    join_as(&app, room_id, "alice").await;
    join_as(&app, room_id, "bob").await;

    let (status, body) = call(
        &app,
        Method::POST,
        &path(room_id, "leave"),
        Some("alice"),
        Some(json!({ "peerId": "user_bob" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "LEAVE_FAILED");
}

#[tokio::test(start_paused = true)]
async fn test_connected_rest_peer_outlives_heartbeat_timeout() {
    let app = app();
    let room_id = MeetingId::new();
    join_as(&app, room_id, "alice").await;
    let (status, _) = call(
        &app,
        Method::PUT,
        &path(room_id, "peer-state"),
        Some("alice"),
        Some(json!({ "state": "connected" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Polling only, no signaling, for five minutes
    for _ in 0..15 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        let (status, body) = get_as(&app, room_id, "peers", "alice").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participants"].as_array().unwrap().len(), 1);
    }

    let (_, stats) = get_as(&app, room_id, "stats", "alice").await;
    assert_eq!(stats["peerCount"], 1);
}
