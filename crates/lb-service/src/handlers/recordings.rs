//! Recording upload handler.
//!
//! `POST /bbblb/api/v1/recordings/upload?format=<name>` accepts a tar
//! archive holding one published format of a recording. The caller
//! authenticates with an upload token minted from its own server secret.

use crate::errors::LbError;
use crate::observability::metrics;
use crate::routes::AppState;
use crate::services::recording_upload::ARCHIVE_CONTENT_TYPE;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{
        header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    /// Published format contained in the archive, e.g. `presentation`.
    pub format: Option<String>,
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, LbError> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::debug!(target: "lb.handoff", "Missing Authorization header");
            LbError::Auth("Missing Authorization header".to_string())
        })?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            tracing::debug!(target: "lb.handoff", "Invalid Authorization header format");
            LbError::Auth("Invalid Authorization header format".to_string())
        })
}

fn check_content_type(headers: &HeaderMap) -> Result<(), LbError> {
    let ctype = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let media_type = ctype.split(';').next().unwrap_or_default().trim();
    if media_type.eq_ignore_ascii_case(ARCHIVE_CONTENT_TYPE) {
        Ok(())
    } else {
        Err(LbError::UnsupportedMediaType(format!(
            "Expected {ARCHIVE_CONTENT_TYPE}, got '{ctype}'"
        )))
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn rejection(err: LbError) -> Response {
    metrics::record_recording_upload(err.kind());
    let unsupported = matches!(err, LbError::UnsupportedMediaType(_));
    let mut response = err.into_response();
    if unsupported {
        response
            .headers_mut()
            .insert("Accept-Post", HeaderValue::from_static(ARCHIVE_CONTENT_TYPE));
    }
    response
}

/// Handler for POST /bbblb/api/v1/recordings/upload
///
/// Checks run in order: bearer token present (401), content type (415),
/// declared length (413), format given (400). The token and the format name
/// are verified by the importer before any byte is written.
#[tracing::instrument(skip_all, name = "lb.recordings.upload")]
pub async fn upload_recording(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let token = match extract_bearer_token(&headers) {
        Ok(token) => token,
        Err(e) => return rejection(e),
    };
    if let Err(e) = check_content_type(&headers) {
        return rejection(e);
    }
    if declared_length(&headers).is_some_and(|len| len > state.importer.max_bytes()) {
        return rejection(LbError::PayloadTooLarge);
    }
    let Some(format) = params.format else {
        return rejection(LbError::Validation("Missing 'format' parameter".to_string()));
    };

    match state.importer.import(token, &format, body).await {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(e) => e.into_response(),
    }
}
