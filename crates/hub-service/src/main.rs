//! Real-time communication hub
//!
//! Signaling relay, chat fan-out and TURN credential issuing for meetings.
//!
//! # Servers
//!
//! The hub runs two servers:
//! - HTTP server for the REST control plane and WebSocket upgrades (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Architecture
//!
//! Uses an actor model hierarchy:
//! - `RoomRegistryActor` (singleton): creates, sweeps and supervises rooms
//! - `RoomActor` (per meeting): owns peers, chat sequence and typing state
//! - `ConnectionActor` (per transport): bounded outbound queue for one peer
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Open the chat store (Redis when `REDIS_URL` is set, otherwise in memory)
//! 4. Initialize the hub (registry actor + credential issuer)
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start the API server
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hub_service::api::{build_routes, AppState};
use hub_service::config::Config;
use hub_service::hub::Hub;
use hub_service::observability::metrics::init_metrics_recorder;
use hub_service::observability::{health_router, HealthState};
use hub_service::persistence::{ChatStore, InMemoryChatStore, RedisChatStore};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// How long shutdown waits for rooms to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first: it decides the log format
    let config = Config::from_env();
    let log_json = config.as_ref().is_ok_and(|c| c.log_json);

    // Initialize tracing
    let fmt_layer = if log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hub_service=debug,tower_http=debug".into()),
        )
        .with(fmt_layer)
        .init();

    info!("Starting communication hub");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        hub_id = %config.hub_id,
        http_bind_address = %config.http_bind_address,
        health_bind_address = %config.health_bind_address,
        max_participants_per_room = config.max_participants_per_room,
        room_grace_period_seconds = config.room_grace_period_seconds,
        heartbeat_timeout_seconds = config.heartbeat_timeout_seconds,
        peer_idle_timeout_seconds = config.peer_idle_timeout_seconds,
        turn_server = %config.turn_server,
        redis = config.redis_url.is_some(),
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Initialize health state
    let health_state = Arc::new(HealthState::new(config.hub_id.clone()));

    // Open chat store
    let store: Arc<dyn ChatStore> = match &config.redis_url {
        Some(redis_url) => {
            info!("Connecting to Redis...");
            let store = RedisChatStore::connect(redis_url).await.map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
            info!("Redis connection established");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, chat history is kept in memory only");
            Arc::new(InMemoryChatStore::new())
        }
    };

    // Initialize actor system
    info!("Initializing actor system...");
    let hub = Hub::new(
        config.hub_id.clone(),
        config.room_settings(),
        store,
        config.turn_settings(),
    );
    info!("Actor system initialized");

    // Cancelled when the hub shuts down; stops both servers
    let shutdown_token = hub.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start API server
    let http_addr: SocketAddr = config.http_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.http_bind_address, "Invalid HTTP bind address");
        format!("Invalid HTTP bind address: {e}")
    })?;

    let app = build_routes(Arc::new(AppState { hub: hub.clone() }));

    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %http_addr, "Failed to bind API server");
            format!("Failed to bind API server to {http_addr}: {e}")
        })?;
    info!(addr = %http_addr, "API server bound successfully");

    let http_shutdown_token = shutdown_token.child_token();
    let http_task = tokio::spawn(async move {
        info!(addr = %http_addr, "API server starting");
        let server = axum::serve(http_listener, app).with_graceful_shutdown(async move {
            http_shutdown_token.cancelled().await;
            info!("API server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "API server failed");
        }
    });

    health_state.set_ready();

    // Wait for shutdown signal
    info!("Hub running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Closes every connection, cancels every room and the servers' tokens
    if let Err(e) = hub.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    for (name, task) in [("API", http_task), ("Health", health_task)] {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!(server = name, "Server did not stop in time");
        }
    }

    info!("Hub shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
