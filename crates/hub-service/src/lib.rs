//! Real-time communication hub library
//!
//! This library provides the core functionality of the hub - a stateful
//! service that lets peers in a meeting find each other and talk:
//!
//! - Room registry: one live room per meeting, created on first join and
//!   evicted after an idle grace period
//! - Signaling relay: SDP offers/answers and ICE candidates routed peer to peer
//! - Chat broadcast: sequenced chat events fanned out to the room and handed
//!   to a durable store
//! - TURN credentials: time-limited HMAC credentials for a coturn relay
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton per hub instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live meeting)
//!         ├── ChatPersister
//!         └── supervises N ConnectionActors
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`api`] - REST control plane
//! - [`transport`] - WebSocket transport
//! - [`hub`] - Entry point shared by both surfaces
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire codes and HTTP statuses

pub mod actors;
pub mod api;
pub mod chat;
pub mod config;
pub mod errors;
pub mod hub;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod signaling;
pub mod transport;
pub mod turn;
