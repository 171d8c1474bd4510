//! Backend-side recording upload client.
//!
//! Runs on a backend server after a recording has been processed. Every
//! archive carries one published format, named by the `format` query
//! parameter. Each attempt signs a fresh upload token with the server's own
//! secret and posts the archive to the load balancer. Non-2xx answers and
//! transport errors are retried with linear backoff.

use bytes::Bytes;
use chrono::Utc;
use common::retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
use common::secret::SecretString;
use common::types::MeetingUuid;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::models::UploadAccepted;
use crate::services::recording_handoff::sign_upload_token;
use crate::services::recording_import::validate_format;

/// Path of the ingestion endpoint below the load balancer's base URL.
pub const UPLOAD_PATH: &str = "/bbblb/api/v1/recordings/upload";

/// Content type of uploaded archives.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-tar";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Cannot read archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid recording format '{0}'")]
    Format(String),

    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("Upload failed after {attempts} attempt(s), last status {status:?}: {body}")]
    Exhausted {
        attempts: u32,
        /// `None` when the last attempt never got a response.
        status: Option<u16>,
        body: String,
    },
}

/// A successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub attempts: u32,
    pub status: u16,
    /// Present when the load balancer answered with an import receipt.
    pub import_id: Option<String>,
}

#[derive(Debug)]
enum AttemptError {
    Status { status: u16, body: String },
    Transport(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
            AttemptError::Transport(reason) => write!(f, "{reason}"),
        }
    }
}

pub struct RecordingUploader {
    client: Client,
    endpoint: String,
    server_id: String,
    secret: SecretString,
    policy: RetryPolicy,
}

impl RecordingUploader {
    /// Build an uploader posting to `lb_url` as `server_id`.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::Client` if the HTTP client cannot be built.
    pub fn new(
        lb_url: &str,
        server_id: &str,
        secret: SecretString,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| UploadError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}{UPLOAD_PATH}", lb_url.trim_end_matches('/')),
            server_id: server_id.to_string(),
            secret,
            policy,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Read `path` and upload it as the recording of `meeting`.
    ///
    /// The format is the file name without extension, so
    /// `presentation.tar` uploads the `presentation` format.
    pub async fn upload_file(&self, meeting: MeetingUuid, path: &Path) -> Result<UploadReceipt, UploadError> {
        let format = format_of(path)?;
        let archive = tokio::fs::read(path).await.map_err(|source| UploadError::Archive {
            path: path.to_path_buf(),
            source,
        })?;
        self.upload(meeting, &format, Bytes::from(archive)).await
    }

    #[instrument(skip_all, fields(meeting = %meeting, format, bytes = archive.len()))]
    pub async fn upload(
        &self,
        meeting: MeetingUuid,
        format: &str,
        archive: Bytes,
    ) -> Result<UploadReceipt, UploadError> {
        if validate_format(format).is_err() {
            return Err(UploadError::Format(format.to_string()));
        }

        let result = retry_with_backoff(self.policy, |attempt| {
            let body = archive.clone();
            async move { self.attempt(meeting, format, body, attempt).await }
        })
        .await;

        match result {
            Ok(receipt) => {
                info!(
                    target: "lb.upload",
                    meeting = %meeting,
                    format,
                    attempts = receipt.attempts,
                    import_id = receipt.import_id.as_deref().unwrap_or("-"),
                    "Recording uploaded"
                );
                Ok(receipt)
            }
            Err(RetryExhausted { attempts, last }) => {
                warn!(target: "lb.upload", meeting = %meeting, format, attempts, error = %last, "Recording upload gave up");
                let (status, body) = match last {
                    AttemptError::Status { status, body } => (Some(status), body),
                    AttemptError::Transport(reason) => (None, reason),
                };
                Err(UploadError::Exhausted { attempts, status, body })
            }
        }
    }

    async fn attempt(
        &self,
        meeting: MeetingUuid,
        format: &str,
        body: Bytes,
        attempt: u32,
    ) -> Result<UploadReceipt, AttemptError> {
        let token = sign_upload_token(&self.server_id, &self.secret, meeting, Utc::now().timestamp())
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        debug!(target: "lb.upload", attempt, endpoint = %self.endpoint, "Posting recording archive");
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("format", format)])
            .bearer_auth(token)
            .header(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(AttemptError::Status { status, body: text });
        }

        let import_id = serde_json::from_str::<UploadAccepted>(&text)
            .ok()
            .map(|accepted| accepted.import_id);
        Ok(UploadReceipt {
            attempts: attempt,
            status,
            import_id,
        })
    }
}

/// Format name of an archive file: its file name without extension.
pub fn format_of(path: &Path) -> Result<String, UploadError> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    validate_format(stem)
        .map(|()| stem.to_string())
        .map_err(|_| UploadError::Format(path.display().to_string()))
}
