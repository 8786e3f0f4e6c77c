//! Actor model implementation for the communication hub.
//!
//! ```text
//! RoomRegistryActor (singleton per hub instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live meeting)
//!         ├── owns peers, chat sequence, chat log and typing state
//!         ├── ChatPersister (ordered durable writes, retried with backoff)
//!         └── supervises N ConnectionActors
//!             └── ConnectionActor (one per attached transport)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One writer per room**: every mutation and fan-out runs in the room's message loop
//! - **CancellationToken propagation**: Parent actors pass child tokens for graceful shutdown
//! - **Non-blocking fan-out**: bounded per-peer outbound queues; a full queue drops that peer
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that creates and evicts rooms
//! - [`room`] - `RoomActor` per live meeting
//! - [`connection`] - `ConnectionActor` per attached transport
//! - [`persister`] - `ChatPersister` per room
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod persister;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ChannelSink, ConnectionActor, ConnectionActorHandle, FrameSink};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorMetricsSnapshot, ActorType, MailboxMonitor};
pub use persister::{ChatPersister, ChatPersisterHandle, RetryPolicy};
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle, RoomSettings};
