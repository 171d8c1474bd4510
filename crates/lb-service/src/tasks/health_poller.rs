//! Backend health polling.
//!
//! Every enabled server gets its own task that calls `getMeetings` on the
//! server's poll interval. A poll is bounded by the configured timeout,
//! which is always shorter than any interval, and at most one poll per
//! server is in flight. Results feed the server registry (health, load,
//! reservations) and the meeting registry (running and ended meetings).
//!
//! [`PollSupervisor`] owns the tasks. Each task has a child token of the
//! supervisor's root token, so disabling a server stops its task and
//! shutdown stops all of them.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::errors::LbError;
use crate::models::{BackendMeeting, LoadSnapshot, ServerHealth};
use crate::observability::metrics;
use crate::registry::meetings::MeetingRegistry;
use crate::registry::servers::{HealthTransition, PollOutcome, ServerEntry, ServerRegistry};
use crate::repositories::ClusterStore;
use crate::services::backend_client::BackendClient;

/// Poll behavior shared by all servers.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub timeout: Duration,
    pub fail_threshold: u32,
}

/// What one call to [`HealthPoller::poll_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReport {
    /// Another poll of this server was still running.
    Skipped,
    Succeeded {
        active_meetings: u32,
        transition: Option<HealthTransition>,
    },
    Failed {
        reason: String,
        transition: Option<HealthTransition>,
    },
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn summarize(running: &[BackendMeeting]) -> LoadSnapshot {
    running.iter().fold(
        LoadSnapshot {
            active_meetings: saturating_u32(running.len()),
            ..LoadSnapshot::default()
        },
        |mut load, m| {
            load.users = load.users.saturating_add(m.users);
            load.voice = load.voice.saturating_add(m.voice);
            load.video = load.video.saturating_add(m.video);
            load
        },
    )
}

pub struct HealthPoller {
    servers: Arc<ServerRegistry>,
    meetings: Arc<MeetingRegistry>,
    backend: Arc<dyn BackendClient>,
    store: Arc<dyn ClusterStore>,
    settings: PollSettings,
}

impl HealthPoller {
    pub fn new(
        servers: Arc<ServerRegistry>,
        meetings: Arc<MeetingRegistry>,
        backend: Arc<dyn BackendClient>,
        store: Arc<dyn ClusterStore>,
        settings: PollSettings,
    ) -> Self {
        Self {
            servers,
            meetings,
            backend,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Poll `server` once and apply the result.
    pub async fn poll_once(&self, server: &ServerEntry) -> PollReport {
        let Some(_guard) = server.try_begin_poll() else {
            debug!(target: "lb.poller", server_id = %server.server_id, "Previous poll still running");
            return PollReport::Skipped;
        };

        // Reservations committed before this point are part of the snapshot.
        let absorbed = server.committed();
        let poll_started = Utc::now();
        let start = Instant::now();

        let result = match tokio::time::timeout(self.settings.timeout, self.backend.get_meetings(server)).await {
            Ok(result) => result,
            Err(_) => Err(LbError::TransientBackend(format!(
                "Poll timed out after {}ms",
                self.settings.timeout.as_millis()
            ))),
        };

        let report = match result {
            Ok(running) => {
                metrics::record_poll("success", start.elapsed());
                let load = summarize(&running);
                let transition = self.servers.record_poll_result(
                    server,
                    PollOutcome::Success(load),
                    self.settings.fail_threshold,
                    absorbed,
                );

                if server.is_enabled() {
                    let changed = self
                        .meetings
                        .apply_snapshot(&server.server_id, &running, poll_started);
                    for meeting in &changed {
                        if let Err(e) = self.store.save_meeting(meeting).await {
                            error!(
                                target: "lb.poller",
                                meeting_uuid = %meeting.uuid,
                                error = %e,
                                "Failed to persist meeting update"
                            );
                        }
                    }
                }

                debug!(
                    target: "lb.poller",
                    server_id = %server.server_id,
                    active_meetings = load.active_meetings,
                    users = load.users,
                    "Poll succeeded"
                );
                PollReport::Succeeded {
                    active_meetings: load.active_meetings,
                    transition,
                }
            }
            Err(e) => {
                metrics::record_poll("failure", start.elapsed());
                let reason = e.to_string();
                let transition = self.servers.record_poll_result(
                    server,
                    PollOutcome::Failure(reason.clone()),
                    self.settings.fail_threshold,
                    0,
                );
                PollReport::Failed { reason, transition }
            }
        };

        self.refresh_gauges();
        report
    }

    fn refresh_gauges(&self) {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for status in self.servers.list() {
            let label = if status.enabled {
                status.health.as_str()
            } else {
                "disabled"
            };
            *counts.entry(label).or_default() += 1;
        }
        for label in [
            ServerHealth::Unknown.as_str(),
            ServerHealth::Healthy.as_str(),
            ServerHealth::Unreachable.as_str(),
            "disabled",
        ] {
            metrics::set_servers(label, counts.get(label).copied().unwrap_or(0));
        }
    }
}

/// Run the poll loop for one server until `cancel_token` fires.
///
/// The first poll runs immediately.
pub async fn run_server_poller(poller: Arc<HealthPoller>, server: Arc<ServerEntry>, cancel_token: CancellationToken) {
    let mut interval = tokio::time::interval(server.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(target: "lb.poller", server_id = %server.server_id, "Poller started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let PollReport::Failed { reason, .. } = poller.poll_once(&server).await {
                    warn!(target: "lb.poller", server_id = %server.server_id, reason = %reason, "Poll failed");
                }
            }
            _ = cancel_token.cancelled() => {
                info!(target: "lb.poller", server_id = %server.server_id, "Poller received shutdown signal, exiting");
                break;
            }
        }
    }
}

/// Starts and stops per-server poll tasks.
pub struct PollSupervisor {
    poller: Arc<HealthPoller>,
    root: CancellationToken,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl PollSupervisor {
    pub fn new(poller: Arc<HealthPoller>, root: CancellationToken) -> Self {
        Self {
            poller,
            root,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn poller(&self) -> &Arc<HealthPoller> {
        &self.poller
    }

    /// Start polling `server`, replacing any task already running for its id.
    ///
    /// Disabled servers are not polled.
    pub fn start(&self, server: Arc<ServerEntry>) {
        if !server.is_enabled() {
            self.stop(&server.server_id);
            return;
        }

        let token = self.root.child_token();
        if let Some(previous) = self
            .tasks
            .lock()
            .insert(server.server_id.clone(), token.clone())
        {
            previous.cancel();
        }

        let span = tracing::info_span!("server_poller", server_id = %server.server_id);
        tokio::spawn(run_server_poller(self.poller.clone(), server, token).instrument(span));
    }

    /// Stop polling `server_id`. Returns whether a task was running.
    pub fn stop(&self, server_id: &str) -> bool {
        match self.tasks.lock().remove(server_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Start tasks for every enabled server in `servers`.
    pub fn start_all(&self, servers: &ServerRegistry) {
        for server in servers.entries() {
            self.start(server);
        }
    }

    pub fn is_polling(&self, server_id: &str) -> bool {
        self.tasks
            .lock()
            .get(server_id)
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Stop every task.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.tasks.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::models::{Meeting, MeetingLoad, MeetingState, Params};
    use crate::registry::servers::ServerSpec;
    use crate::repositories::MemoryStore;
    use crate::services::backend_client::mock::MockBackendClient;
    use crate::services::backend_client::CreateResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use common::secret::SecretString;
    use common::types::MeetingUuid;

    struct Fixture {
        poller: Arc<HealthPoller>,
        backend: Arc<MockBackendClient>,
        servers: Arc<ServerRegistry>,
        meetings: Arc<MeetingRegistry>,
        store: Arc<MemoryStore>,
    }

    fn spec(id: &str) -> ServerSpec {
        ServerSpec {
            server_id: id.to_string(),
            base_url: format!("https://{id}.test/bigbluebutton/api"),
            secret: SecretString::from(format!("{id}-secret")),
            poll_interval: Duration::from_secs(10),
            enabled: true,
        }
    }

    fn fixture(threshold: u32) -> Fixture {
        let backend = Arc::new(MockBackendClient::accepting());
        let servers = Arc::new(ServerRegistry::new());
        let meetings = Arc::new(MeetingRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let poller = Arc::new(HealthPoller::new(
            servers.clone(),
            meetings.clone(),
            backend.clone(),
            store.clone(),
            PollSettings {
                timeout: Duration::from_secs(5),
                fail_threshold: threshold,
            },
        ));
        Fixture {
            poller,
            backend,
            servers,
            meetings,
            store,
        }
    }

    fn running(meeting_id: &str, users: u32) -> BackendMeeting {
        BackendMeeting {
            meeting_id: meeting_id.to_string(),
            internal_meeting_id: format!("{meeting_id}-internal"),
            users,
            voice: 1,
            video: 0,
        }
    }

    fn open_meeting(server_id: &str, external: &str, created_ago: chrono::Duration) -> Meeting {
        Meeting {
            uuid: MeetingUuid::new(),
            external_id: external.to_string(),
            tenant: "acme".to_string(),
            server_id: server_id.to_string(),
            backend_meeting_id: format!("{external}*acme"),
            internal_meeting_id: None,
            state: MeetingState::Created,
            created_at: Utc::now() - created_ago,
            ended_at: None,
            load: MeetingLoad::default(),
        }
    }

    #[tokio::test]
    async fn test_successful_poll_marks_healthy_with_load() {
        let f = fixture(3);
        let server = f.servers.create(spec("bbb1")).unwrap();
        f.backend
            .set_meetings("bbb1", vec![running("a*acme", 4), running("b*acme", 2)]);

        let report = f.poller.poll_once(&server).await;
        assert!(matches!(
            report,
            PollReport::Succeeded {
                active_meetings: 2,
                transition: Some(HealthTransition {
                    from: ServerHealth::Unknown,
                    to: ServerHealth::Healthy
                })
            }
        ));

        let load = server.load();
        assert_eq!(load.users, 6);
        assert_eq!(load.voice, 2);
        assert_eq!(server.health(), ServerHealth::Healthy);
    }

    #[tokio::test]
    async fn test_failures_reach_threshold() {
        let f = fixture(3);
        let server = f.servers.create(spec("bbb1")).unwrap();
        f.poller.poll_once(&server).await;
        assert_eq!(server.health(), ServerHealth::Healthy);

        f.backend.set_down("bbb1", true);
        f.poller.poll_once(&server).await;
        f.poller.poll_once(&server).await;
        assert_eq!(server.health(), ServerHealth::Healthy);
        assert_eq!(server.status().consecutive_failures, 2);

        f.poller.poll_once(&server).await;
        assert_eq!(server.health(), ServerHealth::Unreachable);

        f.backend.set_down("bbb1", false);
        f.poller.poll_once(&server).await;
        assert_eq!(server.health(), ServerHealth::Healthy);
        assert_eq!(server.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_poll_updates_meetings() {
        let f = fixture(3);
        let server = f.servers.create(spec("bbb1")).unwrap();
        let seen = open_meeting("bbb1", "seen", chrono::Duration::seconds(30));
        let gone = open_meeting("bbb1", "gone", chrono::Duration::seconds(30));
        let fresh = open_meeting("bbb1", "fresh", chrono::Duration::seconds(-30));
        for m in [&seen, &gone, &fresh] {
            f.meetings.restore(m.clone());
        }
        f.backend.set_meetings("bbb1", vec![running("seen*acme", 7)]);

        f.poller.poll_once(&server).await;

        let seen_now = f.meetings.get(seen.uuid).unwrap();
        assert_eq!(seen_now.state, MeetingState::Running);
        assert_eq!(seen_now.load.users, 7);
        assert_eq!(seen_now.internal_meeting_id.as_deref(), Some("seen*acme-internal"));

        assert_eq!(f.meetings.get(gone.uuid).unwrap().state, MeetingState::Ended);
        // Created after the poll started, so not ended by it.
        assert_eq!(f.meetings.get(fresh.uuid).unwrap().state, MeetingState::Created);

        assert_eq!(f.store.meeting(seen.uuid).unwrap().state, MeetingState::Running);
        assert_eq!(f.store.meeting(gone.uuid).unwrap().state, MeetingState::Ended);
        assert!(f.store.meeting(fresh.uuid).is_none());
    }

    #[tokio::test]
    async fn test_failed_poll_leaves_meetings_alone() {
        let f = fixture(3);
        let server = f.servers.create(spec("bbb1")).unwrap();
        let m = open_meeting("bbb1", "daily", chrono::Duration::seconds(30));
        f.meetings.restore(m.clone());
        f.backend.set_down("bbb1", true);

        let report = f.poller.poll_once(&server).await;
        assert!(matches!(report, PollReport::Failed { .. }));
        assert_eq!(f.meetings.get(m.uuid).unwrap().state, MeetingState::Created);
    }

    #[tokio::test]
    async fn test_disabled_server_result_is_dropped() {
        let f = fixture(3);
        let server = f.servers.create(spec("bbb1")).unwrap();
        let m = open_meeting("bbb1", "daily", chrono::Duration::seconds(30));
        f.meetings.restore(m.clone());
        f.servers.set_enabled("bbb1", false).unwrap();

        f.poller.poll_once(&server).await;
        assert_eq!(server.health(), ServerHealth::Unknown);
        assert_eq!(f.meetings.get(m.uuid).unwrap().state, MeetingState::Created);
    }

    /// Backend whose `getMeetings` never answers.
    struct HangingBackend;

    #[async_trait]
    impl BackendClient for HangingBackend {
        async fn get_meetings(&self, _server: &ServerEntry) -> Result<Vec<BackendMeeting>, LbError> {
            std::future::pending().await
        }

        async fn create(
            &self,
            _server: &ServerEntry,
            _params: &Params,
            _body: Option<Bytes>,
        ) -> Result<CreateResponse, LbError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let servers = Arc::new(ServerRegistry::new());
        let poller = HealthPoller::new(
            servers.clone(),
            Arc::new(MeetingRegistry::new()),
            Arc::new(HangingBackend),
            Arc::new(MemoryStore::new()),
            PollSettings {
                timeout: Duration::from_secs(2),
                fail_threshold: 1,
            },
        );
        let server = servers.create(spec("bbb1")).unwrap();

        let report = poller.poll_once(&server).await;
        match report {
            PollReport::Failed { reason, transition } => {
                assert!(reason.contains("timed out"));
                assert_eq!(transition.unwrap().to, ServerHealth::Unreachable);
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_poll_is_skipped() {
        let servers = Arc::new(ServerRegistry::new());
        let poller = Arc::new(HealthPoller::new(
            servers.clone(),
            Arc::new(MeetingRegistry::new()),
            Arc::new(HangingBackend),
            Arc::new(MemoryStore::new()),
            PollSettings {
                timeout: Duration::from_secs(2),
                fail_threshold: 5,
            },
        ));
        let server = servers.create(spec("bbb1")).unwrap();

        let first = {
            let poller = poller.clone();
            let server = server.clone();
            tokio::spawn(async move { poller.poll_once(&server).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(poller.poll_once(&server).await, PollReport::Skipped);
        assert!(matches!(first.await.unwrap(), PollReport::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_starts_and_stops_tasks() {
        let f = fixture(3);
        let supervisor = PollSupervisor::new(f.poller.clone(), CancellationToken::new());
        let server = f.servers.create(spec("bbb1")).unwrap();

        supervisor.start(server.clone());
        assert!(supervisor.is_polling("bbb1"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.backend.poll_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.backend.poll_count(), 2);

        assert!(supervisor.stop("bbb1"));
        assert!(!supervisor.is_polling("bbb1"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.backend.poll_count(), 2);
    }

    #[tokio::test]
    async fn test_supervisor_ignores_disabled_server() {
        let f = fixture(3);
        let supervisor = PollSupervisor::new(f.poller.clone(), CancellationToken::new());
        let mut disabled = spec("bbb1");
        disabled.enabled = false;
        let server = f.servers.create(disabled).unwrap();

        supervisor.start(server);
        assert!(!supervisor.is_polling("bbb1"));
    }
}
