//! Ingestion of recording archives pushed by backend servers.
//!
//! Each archive holds one published format of a meeting's recording and is
//! stored as `{recordings_dir}/{meeting}/{format}.tar`. The archive is
//! streamed to a temporary file next to its final location and renamed into
//! place once complete, so readers never see a partial archive and a retried
//! upload replaces the earlier copy of the same format only.

use axum::body::Body;
use chrono::Utc;
use common::types::MeetingUuid;
use http_body_util::BodyExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::errors::LbError;
use crate::models::{Meeting, MeetingState, UploadAccepted};
use crate::observability::metrics;
use crate::registry::meetings::MeetingRegistry;
use crate::repositories::ClusterStore;
use crate::services::recording_handoff::{RecordingHandoff, UploadGrant};

pub struct RecordingImporter {
    handoff: RecordingHandoff,
    meetings: Arc<MeetingRegistry>,
    store: Arc<dyn ClusterStore>,
    recordings_dir: PathBuf,
    max_bytes: u64,
}

/// Longest accepted format name.
pub const MAX_FORMAT_LEN: usize = 64;

/// Check that `format` is usable as a file name: 1 to 64 ASCII letters,
/// digits, `-` or `_`.
pub fn validate_format(format: &str) -> Result<(), LbError> {
    let valid = !format.is_empty()
        && format.len() <= MAX_FORMAT_LEN
        && format
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(LbError::Validation(format!("Invalid recording format '{format}'")))
    }
}

fn io_error(context: &str, e: std::io::Error) -> LbError {
    LbError::Internal(format!("{context}: {e}"))
}

impl RecordingImporter {
    pub fn new(
        handoff: RecordingHandoff,
        meetings: Arc<MeetingRegistry>,
        store: Arc<dyn ClusterStore>,
        recordings_dir: PathBuf,
        max_bytes: u64,
    ) -> Self {
        Self {
            handoff,
            meetings,
            store,
            recordings_dir,
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Directory holding all archives of a meeting.
    pub fn meeting_dir(&self, meeting: MeetingUuid) -> PathBuf {
        self.recordings_dir.join(meeting.to_string())
    }

    /// Final location of one format of a meeting's recording.
    pub fn archive_path(&self, meeting: MeetingUuid, format: &str) -> PathBuf {
        self.meeting_dir(meeting).join(format!("{format}.tar"))
    }

    /// Verify `token` and find the meeting it names.
    ///
    /// Meetings already evicted from memory are looked up in the store.
    pub async fn authorize(&self, token: &str) -> Result<(UploadGrant, Meeting), LbError> {
        let grant = self.handoff.verify_upload_token(token)?;

        let meeting = match self.meetings.get(grant.meeting) {
            Some(meeting) => meeting,
            None => self
                .store
                .load_meeting(grant.meeting)
                .await?
                .ok_or_else(|| LbError::NotFound(format!("Meeting '{}'", grant.meeting)))?,
        };

        if meeting.server_id != grant.server_id {
            warn!(
                target: "lb.handoff",
                meeting_uuid = %meeting.uuid,
                token_server = %grant.server_id,
                meeting_server = %meeting.server_id,
                "Upload token names a meeting of another server"
            );
            return Err(LbError::Auth(
                "The upload token is not valid for this meeting".to_string(),
            ));
        }

        Ok((grant, meeting))
    }

    /// Store an uploaded archive and mark its meeting as published.
    #[instrument(skip_all)]
    pub async fn import(&self, token: &str, format: &str, body: Body) -> Result<UploadAccepted, LbError> {
        let result = self.import_inner(token, format, body).await;
        match &result {
            Ok(_) => metrics::record_recording_upload("accepted"),
            Err(e) => metrics::record_recording_upload(e.kind()),
        }
        result
    }

    async fn import_inner(&self, token: &str, format: &str, body: Body) -> Result<UploadAccepted, LbError> {
        let (grant, meeting) = self.authorize(token).await?;
        validate_format(format)?;
        let import_id = Uuid::new_v4();

        let written = self
            .write_archive(meeting.uuid, format, import_id, body)
            .await?;
        info!(
            target: "lb.handoff",
            meeting_uuid = %meeting.uuid,
            server_id = %grant.server_id,
            format,
            import_id = %import_id,
            bytes = written,
            "Recording archive stored"
        );

        self.publish(meeting).await;

        Ok(UploadAccepted {
            message: "Import accepted".to_string(),
            import_id: import_id.to_string(),
        })
    }

    async fn write_archive(
        &self,
        meeting: MeetingUuid,
        format: &str,
        import_id: Uuid,
        body: Body,
    ) -> Result<u64, LbError> {
        let dir = self.meeting_dir(meeting);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("Cannot create recordings directory", e))?;

        let target = self.archive_path(meeting, format);
        let temp = dir.join(format!(".{format}.{}.part", import_id.simple()));

        let written = match self.stream_to_file(&temp, body).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error("Cannot move archive into place", e));
        }
        Ok(written)
    }

    async fn stream_to_file(&self, path: &Path, mut body: Body) -> Result<u64, LbError> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| io_error("Cannot create archive file", e))?;
        let mut written: u64 = 0;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| LbError::Validation(format!("Upload interrupted: {e}")))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };

            written = written.saturating_add(u64::try_from(data.len()).unwrap_or(u64::MAX));
            if written > self.max_bytes {
                warn!(target: "lb.handoff", limit = self.max_bytes, "Recording archive too large");
                return Err(LbError::PayloadTooLarge);
            }
            file.write_all(&data)
                .await
                .map_err(|e| io_error("Cannot write archive", e))?;
        }

        file.sync_all()
            .await
            .map_err(|e| io_error("Cannot flush archive", e))?;
        Ok(written)
    }

    /// Move the meeting to `RecordingPublished` and persist it.
    async fn publish(&self, meeting: Meeting) {
        let uuid = meeting.uuid;
        let updated = match self.meetings.advance(uuid, MeetingState::RecordingPublished) {
            Ok(changed) => changed,
            Err(_) => {
                let mut meeting = meeting;
                meeting
                    .advance(MeetingState::RecordingPublished, Utc::now())
                    .then_some(meeting)
            }
        };

        if let Some(meeting) = updated {
            if let Err(e) = self.store.save_meeting(&meeting).await {
                error!(target: "lb.handoff", meeting_uuid = %uuid, error = %e, "Failed to persist published meeting");
            }
        }
    }
}
