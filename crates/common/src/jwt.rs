//! Recording upload token primitives.
//!
//! Upload tokens are HS256 JWTs minted with a backend server's shared secret.
//! The header `kid` and the `sub` claim both name the server, so the
//! verifier can pick the right secret before checking the signature.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - `extract_kid` does not verify anything; the token must still be verified
//! - Error messages are generic, details are logged at debug level

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted token size in bytes (8KB).
///
/// Upload tokens are around 300 bytes. Anything this large is rejected before
/// base64 decoding or signature checks.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Lifetime of an upload token.
pub const UPLOAD_TOKEN_LIFETIME: Duration = Duration::from_secs(600);

/// Scope an upload token must carry.
pub const UPLOAD_SCOPE: &str = "rec:upload";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    #[error("The upload token is invalid or expired")]
    TokenTooLarge,

    #[error("The upload token is invalid or expired")]
    MalformedToken,

    #[error("The upload token is invalid or expired")]
    MissingKid,
}

/// Claims carried by a recording upload token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadClaims {
    /// Server identity. Must equal the header `kid`.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,

    /// Space-separated scopes.
    pub scope: String,

    /// Meeting whose recording may be uploaded.
    pub meeting: Uuid,
}

impl UploadClaims {
    /// Claims for `server_id` uploading `meeting`, valid from `iat`.
    #[must_use]
    pub fn new(server_id: &str, meeting: Uuid, iat: i64) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let lifetime = UPLOAD_TOKEN_LIFETIME.as_secs() as i64;
        Self {
            sub: server_id.to_string(),
            exp: iat + lifetime,
            iat,
            scope: UPLOAD_SCOPE.to_string(),
            meeting,
        }
    }

    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }
}

/// Extract the `kid` from a JWT header without verifying the signature.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` on wrong structure, bad base64 or invalid JSON
/// - `MissingKid` if the header has no non-empty string `kid`
pub fn extract_kid(token: &str) -> Result<String, JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    let (Some(header_part), Some(_), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT header base64");
        JwtValidationError::MalformedToken
    })?;

    let header: serde_json::Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT header JSON");
        JwtValidationError::MalformedToken
    })?;

    header
        .get("kid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingKid)
}
