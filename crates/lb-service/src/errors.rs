//! Load balancer error types.
//!
//! `LbError` covers the whole orchestration engine. It maps to HTTP status
//! codes via `IntoResponse` for the JSON endpoints; the BBB API handlers wrap
//! it in the XML error envelope instead (see `handlers::bbb_api`).
//! Database and internal details are logged server-side, never returned.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Load balancer error type.
///
/// - Auth: 401 (bad checksum, invalid/expired/misdirected token)
/// - NotFound: 404 (unknown tenant, server or meeting)
/// - NoServerAvailable: 503 (empty candidate set)
/// - Validation: 400 (malformed request or override value)
/// - TransientBackend: 502 (backend call failed, may be retried)
/// - Configuration: 409 (administrative change would break an invariant)
/// - UnsupportedMediaType: 415
/// - PayloadTooLarge: 413
/// - Database, Internal: 500
#[derive(Debug, Error)]
pub enum LbError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No suitable server available")]
    NoServerAvailable,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    TransientBackend(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl LbError {
    /// HTTP status code for this error (also used as a metrics label).
    pub fn status_code(&self) -> u16 {
        match self {
            LbError::Auth(_) => 401,
            LbError::NotFound(_) => 404,
            LbError::NoServerAvailable => 503,
            LbError::Validation(_) => 400,
            LbError::TransientBackend(_) => 502,
            LbError::Configuration(_) => 409,
            LbError::UnsupportedMediaType(_) => 415,
            LbError::PayloadTooLarge => 413,
            LbError::Database(_) | LbError::Internal(_) => 500,
        }
    }

    /// Bounded label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LbError::Auth(_) => "auth",
            LbError::NotFound(_) => "not_found",
            LbError::NoServerAvailable => "no_server_available",
            LbError::Validation(_) => "validation",
            LbError::TransientBackend(_) => "transient_backend",
            LbError::Configuration(_) => "configuration",
            LbError::UnsupportedMediaType(_) => "unsupported_media_type",
            LbError::PayloadTooLarge => "payload_too_large",
            LbError::Database(_) => "database",
            LbError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for LbError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            LbError::Auth(reason) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", reason.clone()),
            LbError::NotFound(resource) => (StatusCode::NOT_FOUND, "NOT_FOUND", resource.clone()),
            LbError::NoServerAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NO_SERVER_AVAILABLE",
                "No suitable server available".to_string(),
            ),
            LbError::Validation(reason) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", reason.clone()),
            LbError::TransientBackend(reason) => {
                tracing::warn!(target: "lb.http", reason = %reason, "Backend call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "BACKEND_ERROR",
                    "Backend server did not respond".to_string(),
                )
            }
            LbError::Configuration(reason) => (StatusCode::CONFLICT, "CONFIGURATION_ERROR", reason.clone()),
            LbError::UnsupportedMediaType(reason) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA_TYPE",
                reason.clone(),
            ),
            LbError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "Request body exceeds the configured limit".to_string(),
            ),
            LbError::Database(err) => {
                tracing::error!(target: "lb.store", error = %err, "Database operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "An internal database error occurred".to_string(),
                )
            }
            LbError::Internal(err) => {
                tracing::error!(target: "lb.http", error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        let mut response = (status, Json(error_response)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) = "Bearer realm=\"bbblb\", error=\"invalid_token\"".parse() {
                response.headers_mut().insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}

impl From<sqlx::Error> for LbError {
    fn from(err: sqlx::Error) -> Self {
        LbError::Database(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn read_body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_display() {
        assert_eq!(
            LbError::Auth("bad checksum".to_string()).to_string(),
            "Authentication failed: bad checksum"
        );
        assert_eq!(LbError::NoServerAvailable.to_string(), "No suitable server available");
        assert_eq!(
            LbError::Configuration("realm taken".to_string()).to_string(),
            "Configuration error: realm taken"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(LbError::Auth("x".to_string()).status_code(), 401);
        assert_eq!(LbError::NotFound("x".to_string()).status_code(), 404);
        assert_eq!(LbError::NoServerAvailable.status_code(), 503);
        assert_eq!(LbError::Validation("x".to_string()).status_code(), 400);
        assert_eq!(LbError::TransientBackend("x".to_string()).status_code(), 502);
        assert_eq!(LbError::Configuration("x".to_string()).status_code(), 409);
        assert_eq!(LbError::UnsupportedMediaType("x".to_string()).status_code(), 415);
        assert_eq!(LbError::PayloadTooLarge.status_code(), 413);
        assert_eq!(LbError::Database("x".to_string()).status_code(), 500);
        assert_eq!(LbError::Internal("x".to_string()).status_code(), 500);
    }

    #[tokio::test]
    async fn test_into_response_auth_sets_www_authenticate() {
        let response = LbError::Auth("token expired".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let www_auth = response.headers().get("WWW-Authenticate").unwrap();
        assert!(www_auth.to_str().unwrap().contains("Bearer realm=\"bbblb\""));

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
        assert_eq!(body["error"]["message"], "token expired");
    }

    #[tokio::test]
    async fn test_into_response_hides_database_detail() {
        let response = LbError::Database("password authentication failed".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "DATABASE_ERROR");
        assert_eq!(body["error"]["message"], "An internal database error occurred");
    }

    #[tokio::test]
    async fn test_into_response_backend_error_is_generic() {
        let response = LbError::TransientBackend("connect refused 10.0.0.3".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "BACKEND_ERROR");
        assert!(!body["error"]["message"].as_str().unwrap().contains("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_into_response_unsupported_media_type() {
        let response = LbError::UnsupportedMediaType("expected application/x-tar".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let body = read_body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "UNSUPPORTED_MEDIA_TYPE");
    }
}
