//! BBB-compatible API handlers.
//!
//! - `GET /bigbluebutton/api` - API index document
//! - `GET|POST /bigbluebutton/api/create` - Routed meeting creation
//!
//! Responses are XML. Errors use the BBB envelope
//! `<response><returncode>FAILED</returncode><messageKey/><message/></response>`.
//! Client errors are answered with HTTP 200 like a BBB server does; server
//! side failures keep their 5xx status.

use crate::errors::LbError;
use crate::routes::AppState;
use crate::services::meeting_service::CreateRequest;
use axum::{
    body::Bytes,
    extract::{Host, RawQuery, State},
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use quick_xml::escape::escape;
use std::sync::Arc;

/// Content type of every BBB API response.
pub const XML_CONTENT_TYPE: &str = "application/xml;charset=utf-8";

/// API version reported by the index document.
const API_VERSION: &str = "2.0";

fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, XML_CONTENT_TYPE)], body).into_response()
}

/// Render a `FAILED` envelope.
pub fn error_document(message_key: &str, message: &str) -> String {
    format!(
        "<response><returncode>FAILED</returncode><messageKey>{}</messageKey><message>{}</message></response>",
        escape(message_key),
        escape(message)
    )
}

/// HTTP status, message key and caller-facing message for an error.
///
/// Backend, database and internal details are logged and replaced with a
/// generic message.
fn error_parts(err: &LbError) -> (StatusCode, &'static str, String) {
    match err {
        LbError::Auth(reason) => (StatusCode::OK, "checksumError", reason.clone()),
        LbError::NotFound(what) => (StatusCode::OK, "notFound", format!("{what} not found")),
        LbError::Validation(reason) => (StatusCode::OK, "validationError", reason.clone()),
        LbError::Configuration(_) | LbError::UnsupportedMediaType(_) | LbError::PayloadTooLarge => {
            (StatusCode::OK, "validationError", err.to_string())
        }
        LbError::NoServerAvailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            "noServerAvailable",
            "No suitable server available".to_string(),
        ),
        LbError::TransientBackend(reason) => {
            tracing::warn!(target: "lb.http", reason = %reason, "Backend call failed");
            (
                StatusCode::BAD_GATEWAY,
                "internalError",
                "Backend server did not respond".to_string(),
            )
        }
        LbError::Database(detail) | LbError::Internal(detail) => {
            tracing::error!(target: "lb.http", kind = err.kind(), error = %detail, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internalError",
                "An internal error occurred".to_string(),
            )
        }
    }
}

/// Wrap an error in the BBB XML envelope.
pub fn bbb_error(err: &LbError) -> Response {
    let (status, key, message) = error_parts(err);
    xml_response(status, error_document(key, &message))
}

/// Handler for GET /bigbluebutton/api
pub async fn api_index() -> Response {
    xml_response(
        StatusCode::OK,
        format!(
            "<response><returncode>SUCCESS</returncode><version>{API_VERSION}</version>\
             <info>Served by bbblb</info></response>"
        ),
    )
}

/// Media type without parameters, lowercased.
fn media_type(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Handler for GET|POST /bigbluebutton/api/create
///
/// A POST with an empty query string may carry its parameters as a form
/// body. A POST with an XML body carries a pre-upload document, which is
/// forwarded to the backend unchanged. Bodies above
/// `Config::max_create_body_bytes` are refused with 413 by the router.
#[tracing::instrument(skip_all, name = "lb.bbb.create")]
pub async fn create_meeting(
    State(state): State<Arc<AppState>>,
    Host(host): Host,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let mut query = query.unwrap_or_default();
    let mut document = None;

    if method == Method::POST && !body.is_empty() {
        match media_type(&headers).as_str() {
            "application/x-www-form-urlencoded" if query.is_empty() => match std::str::from_utf8(&body) {
                Ok(form) => query = form.to_string(),
                Err(_) => {
                    return bbb_error(&LbError::Validation(
                        "Request body is not valid UTF-8".to_string(),
                    ))
                }
            },
            "application/xml" | "text/xml" => document = Some(body),
            _ => {}
        }
    }

    let request = CreateRequest {
        host,
        query,
        body: document,
    };
    match state.meeting_service.create(request).await {
        Ok(outcome) => xml_response(
            StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK),
            outcome.body,
        ),
        Err(e) => bbb_error(&e),
    }
}
