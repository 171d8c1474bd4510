//! Recording upload tokens.
//!
//! A backend server authorizes an upload of one meeting's recording with an
//! HS256 JWT signed by its own shared secret. The header `kid` and the `sub`
//! claim both carry the server id; verification looks the secret up by `kid`
//! and requires `sub == kid`, so one server cannot upload as another.
//!
//! All verification failures surface as the same generic `Auth` error. The
//! specific reason is logged at debug level.

use chrono::Utc;
use common::jwt::{extract_kid, UploadClaims, UPLOAD_SCOPE};
use common::secret::{ExposeSecret, SecretString};
use common::types::MeetingUuid;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::errors::LbError;
use crate::registry::servers::ServerRegistry;

const INVALID_TOKEN: &str = "The upload token is invalid or expired";

/// What a verified upload token permits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadGrant {
    pub server_id: String,
    pub meeting: MeetingUuid,
}

/// Sign an upload token for `meeting` as `server_id`, issued at `iat`.
///
/// Used by the issuer below and by the backend-side upload client, which
/// holds its own server secret.
pub fn sign_upload_token(
    server_id: &str,
    secret: &SecretString,
    meeting: MeetingUuid,
    iat: i64,
) -> Result<String, LbError> {
    let claims = UploadClaims::new(server_id, meeting.0, iat);

    let mut header = Header::new(Algorithm::HS256);
    header.typ = Some("JWT".to_string());
    header.kid = Some(server_id.to_string());

    let key = EncodingKey::from_secret(secret.expose_secret().as_bytes());
    encode(&header, &claims, &key)
        .map_err(|e| LbError::Internal(format!("Upload token signing failed: {e}")))
}

#[derive(Debug, Clone)]
pub struct RecordingHandoff {
    servers: Arc<ServerRegistry>,
}

impl RecordingHandoff {
    pub fn new(servers: Arc<ServerRegistry>) -> Self {
        Self { servers }
    }

    /// Issue a token authorizing `server_id` to upload `meeting`'s recording.
    ///
    /// Valid for ten minutes from now.
    pub fn issue_upload_token(&self, server_id: &str, meeting: MeetingUuid) -> Result<String, LbError> {
        self.issue_upload_token_at(server_id, meeting, Utc::now().timestamp())
    }

    /// Same as [`Self::issue_upload_token`] with an explicit issue time.
    pub fn issue_upload_token_at(
        &self,
        server_id: &str,
        meeting: MeetingUuid,
        iat: i64,
    ) -> Result<String, LbError> {
        let server = self.servers.get(server_id)?;
        let token = sign_upload_token(&server.server_id, &server.secret, meeting, iat)?;
        debug!(target: "lb.handoff", server_id = %server_id, meeting = %meeting, "Upload token issued");
        Ok(token)
    }

    /// Verify an upload token and return the server and meeting it names.
    ///
    /// Fails with `Auth` on oversized or malformed tokens, unknown `kid`,
    /// bad signature, expiry (no leeway), missing `rec:upload` scope, or
    /// `sub` differing from `kid`.
    #[instrument(skip_all)]
    pub fn verify_upload_token(&self, token: &str) -> Result<UploadGrant, LbError> {
        let invalid = || LbError::Auth(INVALID_TOKEN.to_string());

        let kid = extract_kid(token).map_err(|e| {
            debug!(target: "lb.handoff", error = ?e, "Upload token header rejected");
            invalid()
        })?;

        let server = self.servers.get(&kid).map_err(|_| {
            debug!(target: "lb.handoff", kid = %kid, "Upload token names an unknown server");
            invalid()
        })?;

        let key = DecodingKey::from_secret(server.secret.expose_secret().as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        let data = decode::<UploadClaims>(token, &key, &validation).map_err(|e| {
            debug!(target: "lb.handoff", kid = %kid, error = %e, "Upload token verification failed");
            invalid()
        })?;
        let claims = data.claims;

        if !claims.has_scope(UPLOAD_SCOPE) {
            debug!(target: "lb.handoff", kid = %kid, scope = %claims.scope, "Upload token lacks upload scope");
            return Err(invalid());
        }

        if claims.sub != kid {
            debug!(target: "lb.handoff", kid = %kid, sub = %claims.sub, "Upload token subject does not match kid");
            return Err(invalid());
        }

        Ok(UploadGrant {
            server_id: kid,
            meeting: MeetingUuid(claims.meeting),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::registry::servers::ServerSpec;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use std::time::Duration;

    fn handoff() -> RecordingHandoff {
        let servers = Arc::new(ServerRegistry::new());
        for (id, secret) in [("bbb1", "secret-one"), ("bbb2", "secret-two")] {
            servers
                .create(ServerSpec {
                    server_id: id.to_string(),
                    base_url: format!("https://{id}.example.com/bigbluebutton/api"),
                    secret: SecretString::from(secret),
                    poll_interval: Duration::from_secs(10),
                    enabled: true,
                })
                .unwrap();
        }
        RecordingHandoff::new(servers)
    }

    #[test]
    fn test_round_trip() {
        let handoff = handoff();
        let meeting = MeetingUuid::new();

        let token = handoff.issue_upload_token("bbb1", meeting).unwrap();
        let grant = handoff.verify_upload_token(&token).unwrap();

        assert_eq!(grant.server_id, "bbb1");
        assert_eq!(grant.meeting, meeting);
    }

    #[test]
    fn test_expired_token_rejected() {
        let handoff = handoff();
        let issued = Utc::now().timestamp() - 601;
        let token = handoff
            .issue_upload_token_at("bbb1", MeetingUuid::new(), issued)
            .unwrap();

        assert!(matches!(handoff.verify_upload_token(&token), Err(LbError::Auth(_))));
    }

    #[test]
    fn test_token_near_expiry_still_valid() {
        let handoff = handoff();
        let issued = Utc::now().timestamp() - 590;
        let token = handoff
            .issue_upload_token_at("bbb1", MeetingUuid::new(), issued)
            .unwrap();

        assert!(handoff.verify_upload_token(&token).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let handoff = handoff();
        // Claims to be bbb1 but signed with bbb2's secret.
        let token = sign_upload_token(
            "bbb1",
            &SecretString::from("secret-two"),
            MeetingUuid::new(),
            Utc::now().timestamp(),
        )
        .unwrap();

        assert!(matches!(handoff.verify_upload_token(&token), Err(LbError::Auth(_))));
    }

    #[test]
    fn test_unknown_kid_rejected() {
        let handoff = handoff();
        let token = sign_upload_token(
            "bbb9",
            &SecretString::from("secret-one"),
            MeetingUuid::new(),
            Utc::now().timestamp(),
        )
        .unwrap();

        assert!(matches!(handoff.verify_upload_token(&token), Err(LbError::Auth(_))));
    }

    #[test]
    fn test_unknown_server_cannot_be_issued_for() {
        let handoff = handoff();
        assert!(matches!(
            handoff.issue_upload_token("bbb9", MeetingUuid::new()),
            Err(LbError::NotFound(_))
        ));
    }

    #[test]
    fn test_subject_must_match_kid() {
        let handoff = handoff();
        let claims = UploadClaims::new("bbb2", MeetingUuid::new().0, Utc::now().timestamp());

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("bbb1".to_string());
        let token = encode(&header, &claims, &EncodingKey::from_secret(b"secret-one")).unwrap();

        assert!(matches!(handoff.verify_upload_token(&token), Err(LbError::Auth(_))));
    }

    #[test]
    fn test_missing_scope_rejected() {
        let handoff = handoff();
        let mut claims = UploadClaims::new("bbb1", MeetingUuid::new().0, Utc::now().timestamp());
        claims.scope = "rec:read".to_string();

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("bbb1".to_string());
        let token = encode(&header, &claims, &EncodingKey::from_secret(b"secret-one")).unwrap();

        assert!(matches!(handoff.verify_upload_token(&token), Err(LbError::Auth(_))));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let handoff = handoff();
        let token = handoff.issue_upload_token("bbb1", MeetingUuid::new()).unwrap();

        let mut parts: Vec<String> = token.split('.').map(ToString::to_string).collect();
        let payload = URL_SAFE_NO_PAD.decode(&parts[1]).unwrap();
        let mut claims: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        claims["meeting"] = serde_json::json!(MeetingUuid::new().0);
        parts[1] = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let tampered = parts.join(".");

        assert!(matches!(handoff.verify_upload_token(&tampered), Err(LbError::Auth(_))));
    }

    #[test]
    fn test_oversized_and_garbage_tokens_rejected() {
        let handoff = handoff();
        let oversized = "a".repeat(common::jwt::MAX_JWT_SIZE_BYTES + 1);
        assert!(matches!(handoff.verify_upload_token(&oversized), Err(LbError::Auth(_))));
        assert!(matches!(handoff.verify_upload_token("not-a-jwt"), Err(LbError::Auth(_))));
    }

    #[test]
    fn test_token_header_names_server() {
        let handoff = handoff();
        let token = handoff.issue_upload_token("bbb2", MeetingUuid::new()).unwrap();
        assert_eq!(extract_kid(&token).unwrap(), "bbb2");
    }
}
