//! Secret types for tenant and server shared secrets.
//!
//! Re-exports [`secrecy`] so that every struct holding a checksum secret gets
//! a redacted `Debug` for free. Tenants, servers and the upload signer all
//! carry their secrets as [`SecretString`].
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct Server {
//!     id: String,
//!     secret: SecretString,
//! }
//!
//! let server = Server { id: "bbb1".to_string(), secret: SecretString::from("s3cr3t") };
//! assert!(!format!("{server:?}").contains("s3cr3t"));
//! assert_eq!(server.secret.expose_secret(), "s3cr3t");
//! ```
//!
//! `SecretString` deliberately does not implement `Serialize`. Cluster state
//! exports need the raw value, so they opt in per field with
//! [`serialize_exposed`].

use serde::Serializer;

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Serialize a secret as its plain value.
///
/// Only for administrative exports whose whole point is to carry secrets,
/// e.g. `#[serde(serialize_with = "common::secret::serialize_exposed")]`.
///
/// # Errors
///
/// Propagates serializer errors.
pub fn serialize_exposed<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Compare two secrets for equality in constant time.
#[must_use]
pub fn secrets_equal(a: &SecretString, b: &SecretString) -> bool {
    let a = a.expose_secret().as_bytes();
    let b = b.expose_secret().as_bytes();
    a.len() == b.len() && ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}
