//! HTTP routes for the hub.
//!
//! Defines the Axum router and application state. The control plane lives
//! under `/api/v1/webrtc/meetings/:id`; the WebSocket transport under
//! `/api/v1/ws/meetings/:id`.

pub mod handlers;

use crate::hub::Hub;
use crate::transport;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Per-request timeout for control-plane calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub hub: Hub,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/api/v1/webrtc/meetings/:id/*` - REST control plane
/// - `/api/v1/ws/meetings/:id` - WebSocket transport
/// - TraceLayer for request logging
/// - 30 second request timeout on the control plane
pub fn build_routes(state: Arc<AppState>) -> Router {
    let control_plane = Router::new()
        .route(
            "/api/v1/webrtc/meetings/:id/peers",
            get(handlers::list_peers),
        )
        .route("/api/v1/webrtc/meetings/:id/join", post(handlers::join))
        .route("/api/v1/webrtc/meetings/:id/leave", post(handlers::leave))
        .route("/api/v1/webrtc/meetings/:id/offer", post(handlers::offer))
        .route("/api/v1/webrtc/meetings/:id/answer", post(handlers::answer))
        .route(
            "/api/v1/webrtc/meetings/:id/ice-candidate",
            post(handlers::ice_candidate),
        )
        .route(
            "/api/v1/webrtc/meetings/:id/peer-state",
            put(handlers::update_peer_state),
        )
        .route("/api/v1/webrtc/meetings/:id/stats", get(handlers::room_stats))
        .route(
            "/api/v1/webrtc/meetings/:id/turn-credentials",
            post(handlers::turn_credentials),
        )
        .route(
            "/api/v1/webrtc/meetings/:id/ice-servers",
            get(handlers::ice_servers),
        )
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(Arc::clone(&state));

    // Long-lived upgrades stay outside the request timeout
    let websocket = Router::new()
        .route("/api/v1/ws/meetings/:id", get(transport::ws::upgrade))
        .with_state(state);

    control_plane
        .merge(websocket)
        .layer(TraceLayer::new_for_http())
}
