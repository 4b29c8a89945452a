//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for TURN credentials and any other
//! value that must not show up in `{:?}` output or tracing fields.
//!
//! `SecretString` implements `Debug` with redaction, so a config struct that
//! derives or hand-writes `Debug` stays safe to log. The value is zeroized on
//! drop and must be read through [`ExposeSecret::expose_secret`].
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let credential = SecretString::from("turn-password");
//! assert!(!format!("{credential:?}").contains("turn-password"));
//! assert_eq!(credential.expose_secret(), "turn-password");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
