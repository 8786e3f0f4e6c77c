//! Client transports.
//!
//! - [`ws`] - WebSocket connections carrying JSON envelopes

pub mod ws;
