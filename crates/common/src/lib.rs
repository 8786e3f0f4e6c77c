//! Common utilities and types shared across Dark Tower hub components.

#![warn(clippy::pedantic)]

/// Module for identifier and identity types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
