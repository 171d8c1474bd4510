//! Stale meeting cleanup background task.
//!
//! Periodically ends meetings that were accepted by a backend but never
//! showed up in its polls, and evicts closed meetings from memory once
//! their retention period is over. Evicted meetings stay in the store.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::observability::metrics;
use crate::registry::meetings::{CleanupReport, MeetingRegistry};
use crate::repositories::ClusterStore;

/// Default interval between cleanup runs in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct MeetingCleanupConfig {
    pub interval: Duration,
    /// `CREATED` meetings older than this are ended.
    pub grace: Duration,
    /// Closed meetings are evicted this long after they ended.
    pub retention: Duration,
}

/// Run one cleanup pass and persist the meetings it ended.
pub async fn run_cleanup_once(
    meetings: &MeetingRegistry,
    store: &dyn ClusterStore,
    config: &MeetingCleanupConfig,
) -> CleanupReport {
    let report = meetings.cleanup(Utc::now(), config.grace, config.retention);
    for meeting in &report.ended {
        if let Err(e) = store.save_meeting(meeting).await {
            error!(
                target: "lb.meetings",
                meeting_uuid = %meeting.uuid,
                error = %e,
                "Failed to persist stale meeting"
            );
        }
    }
    metrics::set_open_meetings(meetings.open_count());
    report
}

/// Run the cleanup loop until `cancel_token` fires.
pub async fn start_meeting_cleanup(
    meetings: Arc<MeetingRegistry>,
    store: Arc<dyn ClusterStore>,
    config: MeetingCleanupConfig,
    cancel_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.interval);

    info!(
        target: "lb.meetings",
        interval_seconds = config.interval.as_secs(),
        grace_seconds = config.grace.as_secs(),
        "Meeting cleanup task started"
    );
    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_cleanup_once(&meetings, store.as_ref(), &config).await;
            }
            _ = cancel_token.cancelled() => {
                info!(target: "lb.meetings", "Meeting cleanup task received shutdown signal, exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::models::{Meeting, MeetingLoad, MeetingState};
    use crate::repositories::MemoryStore;
    use common::types::MeetingUuid;

    fn config() -> MeetingCleanupConfig {
        MeetingCleanupConfig {
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
        }
    }

    fn meeting(external: &str, state: MeetingState, age: chrono::Duration) -> Meeting {
        let created_at = Utc::now() - age;
        Meeting {
            uuid: MeetingUuid::new(),
            external_id: external.to_string(),
            tenant: "acme".to_string(),
            server_id: "bbb1".to_string(),
            backend_meeting_id: format!("{external}*acme"),
            internal_meeting_id: None,
            state,
            created_at,
            ended_at: (!state.is_open()).then_some(created_at),
            load: MeetingLoad::default(),
        }
    }

    #[tokio::test]
    async fn test_cleanup_ends_stale_and_evicts_expired() {
        let meetings = MeetingRegistry::new();
        let store = MemoryStore::new();

        let stale = meeting("stale", MeetingState::Created, chrono::Duration::minutes(10));
        let young = meeting("young", MeetingState::Created, chrono::Duration::minutes(1));
        let running = meeting("running", MeetingState::Running, chrono::Duration::hours(5));
        let expired = meeting("expired", MeetingState::Ended, chrono::Duration::hours(2));
        for m in [&stale, &young, &running, &expired] {
            meetings.restore(m.clone());
        }

        let report = run_cleanup_once(&meetings, &store, &config()).await;

        assert_eq!(report.ended.len(), 1);
        assert_eq!(report.ended[0].uuid, stale.uuid);
        assert_eq!(report.evicted, 1);

        assert_eq!(meetings.get(stale.uuid).unwrap().state, MeetingState::Ended);
        assert_eq!(meetings.get(young.uuid).unwrap().state, MeetingState::Created);
        assert_eq!(meetings.get(running.uuid).unwrap().state, MeetingState::Running);
        assert!(meetings.get(expired.uuid).is_none());
        assert!(meetings.find_open("acme", "stale").is_none());

        assert_eq!(store.meeting(stale.uuid).unwrap().state, MeetingState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_exits_on_cancel() {
        let token = CancellationToken::new();
        let handle = tokio::spawn(start_meeting_cleanup(
            Arc::new(MeetingRegistry::new()),
            Arc::new(MemoryStore::new()),
            config(),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
