//! Request and data fixtures.

use common::checksum::{sign_query, ChecksumAlgorithm};
use common::secret::SecretString;
use common::types::MeetingUuid;
use lb_service::models::BackendMeeting;
use lb_service::services::recording_handoff::sign_upload_token;

/// Build a signed BBB query string for `call` (SHA-256 checksum).
pub fn signed_query(call: &str, params: &[(&str, &str)], secret: &str) -> String {
    sign_query(
        ChecksumAlgorithm::Sha256,
        call,
        params.iter().copied(),
        &SecretString::from(secret),
    )
}

/// Secret the harness registers for backend `server_id`.
pub fn server_secret(server_id: &str) -> String {
    format!("{server_id}-backend-secret")
}

/// Base URL the harness registers for backend `server_id`.
///
/// Never contacted; the harness uses a mock backend client.
pub fn backend_url(server_id: &str) -> String {
    format!("http://{server_id}.backend.test/bigbluebutton/")
}

/// A running meeting as a backend would report it.
pub fn backend_meeting(meeting_id: &str, users: u32) -> BackendMeeting {
    BackendMeeting {
        meeting_id: meeting_id.to_string(),
        internal_meeting_id: format!("{meeting_id}-internal"),
        users,
        voice: 0,
        video: 0,
    }
}

/// Upload token `server_id` would mint for `meeting` right now.
///
/// # Panics
/// Panics if signing fails.
pub fn upload_token(server_id: &str, meeting: MeetingUuid) -> String {
    sign_upload_token(
        server_id,
        &SecretString::from(server_secret(server_id)),
        meeting,
        chrono::Utc::now().timestamp(),
    )
    .expect("upload token signing should succeed")
}

/// A minimal tar-like payload. The load balancer does not inspect archives.
pub fn archive_bytes(marker: &str) -> Vec<u8> {
    let mut bytes = marker.as_bytes().to_vec();
    bytes.resize(1024, 0);
    bytes
}
