//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] crate. The hub keeps two values behind these
//! wrappers: the TURN shared secret and the Redis URL (which may embed a
//! password). Both only ever leave the wrapper through an explicit
//! `expose_secret()` call at the point of use.
//!
//! `SecretString` implements `Debug` with redaction, so a config struct that
//! derives or hand-writes `Debug` cannot leak the value through `{:?}` or a
//! tracing field. Values are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let turn_secret = SecretString::from("coturn-static-auth-secret");
//! assert!(!format!("{turn_secret:?}").contains("coturn"));
//! assert_eq!(turn_secret.expose_secret().len(), 25);
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
