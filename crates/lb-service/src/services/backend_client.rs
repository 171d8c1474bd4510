//! HTTP client for the backend conferencing API.
//!
//! Backend calls are signed with the server's secret using the configured
//! checksum algorithm and answered with BBB-style XML documents. Two calls
//! are used: `getMeetings` for health polling and `create` for routed
//! meeting creation.
//!
//! The [`BackendClient`] trait is the seam between the service and the
//! network; tests use [`mock::MockBackendClient`] or a wiremock server.

use async_trait::async_trait;
use bytes::Bytes;
use common::checksum::{sign_query, ChecksumAlgorithm};
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::errors::LbError;
use crate::models::{BackendMeeting, Params};
use crate::registry::servers::ServerEntry;

const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Outcome of a forwarded `create` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    /// `returncode` was `SUCCESS`.
    pub success: bool,
    /// HTTP status returned by the backend.
    pub status: u16,
    /// Raw XML body, passed back to the caller.
    pub body: String,
    pub internal_meeting_id: Option<String>,
    pub message_key: Option<String>,
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Fetch the meetings currently running on `server`.
    ///
    /// Any transport error, timeout, non-2xx status, unparseable body or
    /// `returncode` other than `SUCCESS` is an error.
    async fn get_meetings(&self, server: &ServerEntry) -> Result<Vec<BackendMeeting>, LbError>;

    /// Forward a `create` call to `server`.
    ///
    /// A response with `returncode` `FAILED` is not an error; only transport
    /// failures and unparseable responses are.
    async fn create(
        &self,
        server: &ServerEntry,
        params: &Params,
        body: Option<Bytes>,
    ) -> Result<CreateResponse, LbError>;
}

// ============================================================================
// XML documents
// ============================================================================

#[derive(Debug, Deserialize)]
struct GetMeetingsXml {
    returncode: String,
    #[serde(default)]
    meetings: Option<MeetingsXml>,
    #[serde(rename = "messageKey", default)]
    message_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MeetingsXml {
    #[serde(default)]
    meeting: Vec<MeetingXml>,
}

#[derive(Debug, Deserialize)]
struct MeetingXml {
    #[serde(rename = "meetingID")]
    meeting_id: String,
    #[serde(rename = "internalMeetingID", default)]
    internal_meeting_id: String,
    #[serde(rename = "participantCount", default)]
    participant_count: u32,
    #[serde(rename = "voiceParticipantCount", default)]
    voice_participant_count: u32,
    #[serde(rename = "videoCount", default)]
    video_count: u32,
    #[serde(rename = "endTime", default)]
    end_time: u64,
}

#[derive(Debug, Deserialize)]
struct CreateXml {
    returncode: String,
    #[serde(rename = "internalMeetingID", default)]
    internal_meeting_id: Option<String>,
    #[serde(rename = "messageKey", default)]
    message_key: Option<String>,
}

/// Parse a `getMeetings` response into the meetings still running.
///
/// Entries with a non-zero `endTime` have ended and are skipped.
pub fn parse_get_meetings(xml: &str) -> Result<Vec<BackendMeeting>, LbError> {
    let doc: GetMeetingsXml = quick_xml::de::from_str(xml)
        .map_err(|e| LbError::TransientBackend(format!("Unparseable getMeetings response: {e}")))?;

    if doc.returncode != "SUCCESS" {
        return Err(LbError::TransientBackend(format!(
            "getMeetings returned {} ({})",
            doc.returncode,
            doc.message_key.as_deref().unwrap_or("no messageKey")
        )));
    }

    Ok(doc
        .meetings
        .unwrap_or_default()
        .meeting
        .into_iter()
        .filter(|m| m.end_time == 0)
        .map(|m| BackendMeeting {
            meeting_id: m.meeting_id,
            internal_meeting_id: m.internal_meeting_id,
            users: m.participant_count,
            voice: m.voice_participant_count,
            video: m.video_count,
        })
        .collect())
}

/// Parse a `create` response body.
pub fn parse_create(status: u16, xml: String) -> Result<CreateResponse, LbError> {
    let doc: CreateXml = quick_xml::de::from_str(&xml)
        .map_err(|e| LbError::TransientBackend(format!("Unparseable create response: {e}")))?;

    Ok(CreateResponse {
        success: doc.returncode == "SUCCESS",
        status,
        body: xml,
        internal_meeting_id: doc.internal_meeting_id,
        message_key: doc.message_key,
    })
}

/// Replace the text of `meetingID` elements equal to `search` with `replace`.
///
/// Everything else in the document is written back unchanged.
pub fn rewrite_meeting_id(xml: &str, search: &str, replace: &str) -> Result<String, LbError> {
    let xml_error = |e: &dyn std::fmt::Display| LbError::Internal(format!("XML rewrite failed: {e}"));

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut in_meeting_id = false;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(&e))?;
        match event {
            Event::Eof => break,
            Event::Start(start) => {
                in_meeting_id = matches!(start.name().as_ref(), b"meetingID" | b"meetingId");
                writer.write_event(Event::Start(start)).map_err(|e| xml_error(&e))?;
            }
            Event::End(end) => {
                in_meeting_id = false;
                writer.write_event(Event::End(end)).map_err(|e| xml_error(&e))?;
            }
            Event::Text(text) if in_meeting_id => {
                let matches = text.unescape().map_err(|e| xml_error(&e))? == search;
                if matches {
                    writer
                        .write_event(Event::Text(BytesText::new(replace)))
                        .map_err(|e| xml_error(&e))?;
                } else {
                    writer.write_event(Event::Text(text)).map_err(|e| xml_error(&e))?;
                }
            }
            other => writer.write_event(other).map_err(|e| xml_error(&e))?,
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|e| xml_error(&e))
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    client: Client,
    checksum: ChecksumAlgorithm,
}

impl HttpBackendClient {
    /// Build a client signing calls with `checksum` and giving up after
    /// `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Internal` if the HTTP client cannot be built.
    pub fn new(checksum: ChecksumAlgorithm, request_timeout: Duration) -> Result<Self, LbError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(request_timeout))
            .build()
            .map_err(|e| {
                error!(target: "lb.backend", error = %e, "Failed to build HTTP client");
                LbError::Internal(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, checksum })
    }

    fn call_url(&self, server: &ServerEntry, call: &str, params: &Params) -> String {
        let query = sign_query(
            self.checksum,
            call,
            params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &server.secret,
        );
        format!("{}/{call}?{query}", server.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    #[instrument(skip_all, fields(server_id = %server.server_id))]
    async fn get_meetings(&self, server: &ServerEntry) -> Result<Vec<BackendMeeting>, LbError> {
        let url = self.call_url(server, "getMeetings", &Params::new());

        let response = self.client.get(&url).send().await.map_err(|e| {
            debug!(target: "lb.backend", server_id = %server.server_id, error = %e, "getMeetings request failed");
            LbError::TransientBackend(format!("getMeetings request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LbError::TransientBackend(format!(
                "getMeetings returned HTTP {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LbError::TransientBackend(format!("getMeetings body read failed: {e}")))?;

        parse_get_meetings(&body)
    }

    #[instrument(skip_all, fields(server_id = %server.server_id))]
    async fn create(
        &self,
        server: &ServerEntry,
        params: &Params,
        body: Option<Bytes>,
    ) -> Result<CreateResponse, LbError> {
        let url = self.call_url(server, "create", params);

        let request = match body {
            Some(body) => self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(body),
            None => self.client.get(&url),
        };

        let response = request.send().await.map_err(|e| {
            warn!(target: "lb.backend", server_id = %server.server_id, error = %e, "create request failed");
            LbError::TransientBackend(format!("create request failed: {e}"))
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| LbError::TransientBackend(format!("create body read failed: {e}")))?;

        parse_create(status, text)
    }
}

// ============================================================================
// Mock implementation
// ============================================================================

pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    enum CreateBehavior {
        Succeed,
        Fail(String),
        Unreachable,
    }

    /// Scriptable backend for unit and integration tests.
    ///
    /// `getMeetings` answers from a per-server table (servers without an
    /// entry report no meetings, servers marked down fail). `create` answers
    /// according to the configured behavior and remembers every call.
    #[derive(Debug)]
    pub struct MockBackendClient {
        create_behavior: CreateBehavior,
        meetings: Mutex<HashMap<String, Vec<BackendMeeting>>>,
        down: Mutex<Vec<String>>,
        created: Mutex<Vec<(String, Params)>>,
        document_sizes: Mutex<Vec<Option<usize>>>,
        poll_count: AtomicUsize,
        create_count: AtomicUsize,
    }

    impl MockBackendClient {
        fn with_behavior(create_behavior: CreateBehavior) -> Self {
            Self {
                create_behavior,
                meetings: Mutex::new(HashMap::new()),
                down: Mutex::new(Vec::new()),
                created: Mutex::new(Vec::new()),
                document_sizes: Mutex::new(Vec::new()),
                poll_count: AtomicUsize::new(0),
                create_count: AtomicUsize::new(0),
            }
        }

        /// Every create succeeds.
        pub fn accepting() -> Self {
            Self::with_behavior(CreateBehavior::Succeed)
        }

        /// Every create returns `FAILED` with `message_key`.
        pub fn rejecting(message_key: &str) -> Self {
            Self::with_behavior(CreateBehavior::Fail(message_key.to_string()))
        }

        /// Every create fails at the transport level.
        pub fn unreachable() -> Self {
            Self::with_behavior(CreateBehavior::Unreachable)
        }

        pub fn set_meetings(&self, server_id: &str, meetings: Vec<BackendMeeting>) {
            self.meetings.lock().insert(server_id.to_string(), meetings);
        }

        pub fn set_down(&self, server_id: &str, down: bool) {
            let mut list = self.down.lock();
            list.retain(|id| id != server_id);
            if down {
                list.push(server_id.to_string());
            }
        }

        pub fn poll_count(&self) -> usize {
            self.poll_count.load(Ordering::SeqCst)
        }

        pub fn create_count(&self) -> usize {
            self.create_count.load(Ordering::SeqCst)
        }

        /// `(server_id, params)` of every create call, in order.
        pub fn created(&self) -> Vec<(String, Params)> {
            self.created.lock().clone()
        }

        /// Size of the forwarded pre-upload document of every create call.
        pub fn document_sizes(&self) -> Vec<Option<usize>> {
            self.document_sizes.lock().clone()
        }
    }

    #[async_trait]
    impl BackendClient for MockBackendClient {
        async fn get_meetings(&self, server: &ServerEntry) -> Result<Vec<BackendMeeting>, LbError> {
            self.poll_count.fetch_add(1, Ordering::SeqCst);

            if self.down.lock().contains(&server.server_id) {
                return Err(LbError::TransientBackend("Mock server is down".to_string()));
            }

            Ok(self
                .meetings
                .lock()
                .get(&server.server_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn create(
            &self,
            server: &ServerEntry,
            params: &Params,
            body: Option<Bytes>,
        ) -> Result<CreateResponse, LbError> {
            self.create_count.fetch_add(1, Ordering::SeqCst);
            self.document_sizes.lock().push(body.as_ref().map(Bytes::len));
            self.created
                .lock()
                .push((server.server_id.clone(), params.clone()));

            let meeting_id = params.get("meetingID").cloned().unwrap_or_default();
            match &self.create_behavior {
                CreateBehavior::Succeed => {
                    let internal = uuid::Uuid::new_v4().simple().to_string();
                    let body = format!(
                        "<response><returncode>SUCCESS</returncode><meetingID>{}</meetingID>\
                         <internalMeetingID>{}</internalMeetingID></response>",
                        quick_xml::escape::escape(meeting_id.as_str()),
                        quick_xml::escape::escape(internal.as_str()),
                    );
                    parse_create(200, body)
                }
                CreateBehavior::Fail(key) => {
                    let body = format!(
                        "<response><returncode>FAILED</returncode><messageKey>{}</messageKey>\
                         <message>Mock rejection</message></response>",
                        quick_xml::escape::escape(key.as_str()),
                    );
                    parse_create(200, body)
                }
                CreateBehavior::Unreachable => {
                    Err(LbError::TransientBackend("Mock create unreachable".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::secret::SecretString;
    use wiremock::matchers::{method, path, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GET_MEETINGS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<response>
  <returncode>SUCCESS</returncode>
  <meetings>
    <meeting>
      <meetingName>Daily</meetingName>
      <meetingID>daily*acme</meetingID>
      <internalMeetingID>f1e2d3-1700000000000</internalMeetingID>
      <participantCount>7</participantCount>
      <voiceParticipantCount>2</voiceParticipantCount>
      <videoCount>3</videoCount>
      <endTime>0</endTime>
      <attendees><attendee><userID>u1</userID></attendee></attendees>
      <metadata><bbblb-tenant>acme</bbblb-tenant></metadata>
    </meeting>
    <meeting>
      <meetingID>old*acme</meetingID>
      <internalMeetingID>aa11-1600000000000</internalMeetingID>
      <participantCount>0</participantCount>
      <endTime>1700000100000</endTime>
    </meeting>
  </meetings>
</response>"#;

    fn server(base_url: &str) -> ServerEntry {
        ServerEntry::new(crate::registry::servers::ServerSpec {
            server_id: "bbb1".to_string(),
            base_url: base_url.to_string(),
            secret: SecretString::from("server-secret"),
            poll_interval: Duration::from_secs(10),
            enabled: true,
        })
    }

    #[test]
    fn test_parse_get_meetings_skips_ended() {
        let meetings = parse_get_meetings(GET_MEETINGS).unwrap();
        assert_eq!(meetings.len(), 1);
        assert_eq!(meetings[0].meeting_id, "daily*acme");
        assert_eq!(meetings[0].internal_meeting_id, "f1e2d3-1700000000000");
        assert_eq!(meetings[0].users, 7);
        assert_eq!(meetings[0].voice, 2);
        assert_eq!(meetings[0].video, 3);
    }

    #[test]
    fn test_parse_get_meetings_empty() {
        let xml = "<response><returncode>SUCCESS</returncode><meetings/>\
                   <messageKey>noMeetings</messageKey><message>no meetings</message></response>";
        assert!(parse_get_meetings(xml).unwrap().is_empty());
    }

    #[test]
    fn test_parse_get_meetings_failed_returncode() {
        let xml = "<response><returncode>FAILED</returncode>\
                   <messageKey>checksumError</messageKey><message>bad</message></response>";
        assert!(matches!(parse_get_meetings(xml), Err(LbError::TransientBackend(_))));
        assert!(matches!(parse_get_meetings("<html>"), Err(LbError::TransientBackend(_))));
    }

    #[test]
    fn test_parse_create() {
        let xml = "<response><returncode>SUCCESS</returncode><meetingID>daily*acme</meetingID>\
                   <internalMeetingID>abc-1</internalMeetingID><messageKey>duplicateWarning</messageKey>\
                   </response>"
            .to_string();
        let response = parse_create(200, xml).unwrap();
        assert!(response.success);
        assert_eq!(response.internal_meeting_id.as_deref(), Some("abc-1"));
        assert_eq!(response.message_key.as_deref(), Some("duplicateWarning"));
    }

    #[test]
    fn test_rewrite_meeting_id() {
        let xml = "<response><returncode>SUCCESS</returncode><meetingID>daily*acme</meetingID>\
                   <internalMeetingID>daily*acme</internalMeetingID></response>";
        let out = rewrite_meeting_id(xml, "daily*acme", "daily").unwrap();
        assert_eq!(
            out,
            "<response><returncode>SUCCESS</returncode><meetingID>daily</meetingID>\
             <internalMeetingID>daily*acme</internalMeetingID></response>"
        );
    }

    #[test]
    fn test_rewrite_meeting_id_escapes_replacement() {
        let xml = "<response><meetingID>a&amp;b*acme</meetingID></response>";
        let out = rewrite_meeting_id(xml, "a&b*acme", "a&b").unwrap();
        assert_eq!(out, "<response><meetingID>a&amp;b</meetingID></response>");
    }

    #[test]
    fn test_rewrite_leaves_other_ids_alone() {
        let xml = "<response><meetingID>other*acme</meetingID></response>";
        assert_eq!(rewrite_meeting_id(xml, "daily*acme", "daily").unwrap(), xml);
    }

    #[tokio::test]
    async fn test_http_get_meetings_signs_request() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigbluebutton/api/getMeetings"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GET_MEETINGS))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = HttpBackendClient::new(ChecksumAlgorithm::Sha256, Duration::from_secs(2)).unwrap();
        let entry = server(&format!("{}/bigbluebutton/api/", mock_server.uri()));
        let meetings = client.get_meetings(&entry).await.unwrap();
        assert_eq!(meetings.len(), 1);

        let requests = mock_server.received_requests().await.unwrap();
        let query = requests[0].url.query().unwrap_or_default().to_string();
        let expected = common::checksum::compute(
            ChecksumAlgorithm::Sha256,
            "getMeetings",
            "",
            &SecretString::from("server-secret"),
        );
        assert_eq!(query, format!("checksum={expected}"));
    }

    #[tokio::test]
    async fn test_http_get_meetings_error_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let client = HttpBackendClient::new(ChecksumAlgorithm::Sha1, Duration::from_secs(2)).unwrap();
        let entry = server(&format!("{}/bigbluebutton/api", mock_server.uri()));
        assert!(matches!(
            client.get_meetings(&entry).await,
            Err(LbError::TransientBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_http_create_forwards_params() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigbluebutton/api/create"))
            .and(query_param_is_missing("record"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<response><returncode>SUCCESS</returncode><meetingID>daily*acme</meetingID>\
                 <internalMeetingID>abc-1</internalMeetingID></response>",
            ))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = HttpBackendClient::new(ChecksumAlgorithm::Sha256, Duration::from_secs(2)).unwrap();
        let entry = server(&format!("{}/bigbluebutton/api", mock_server.uri()));
        let mut params = Params::new();
        params.insert("meetingID".to_string(), "daily*acme".to_string());
        params.insert("name".to_string(), "Daily Standup".to_string());

        let response = client.create(&entry, &params, None).await.unwrap();
        assert!(response.success);
        assert_eq!(response.internal_meeting_id.as_deref(), Some("abc-1"));
    }

    #[tokio::test]
    async fn test_http_create_unreachable() {
        let client = HttpBackendClient::new(ChecksumAlgorithm::Sha256, Duration::from_secs(1)).unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let entry = server("http://127.0.0.1:9/bigbluebutton/api");
        assert!(matches!(
            client.create(&entry, &Params::new(), None).await,
            Err(LbError::TransientBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_backend() {
        let mock = mock::MockBackendClient::rejecting("idNotUnique");
        let entry = server("http://unused");
        let response = mock.create(&entry, &Params::new(), None).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.message_key.as_deref(), Some("idNotUnique"));
        assert_eq!(mock.create_count(), 1);

        mock.set_down("bbb1", true);
        assert!(mock.get_meetings(&entry).await.is_err());
        mock.set_down("bbb1", false);
        assert!(mock.get_meetings(&entry).await.unwrap().is_empty());
        assert_eq!(mock.poll_count(), 2);
    }
}
