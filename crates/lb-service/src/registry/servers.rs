//! Backend server registry.
//!
//! Each server is an `Arc<ServerEntry>` in a sharded map. Health and load
//! live behind a per-server `parking_lot::Mutex`; the in-flight reservation
//! counter is a plain atomic so selection never takes a lock. Polls are
//! serialized per server through an async guard held for the duration of
//! the backend call.
//!
//! State machine: `Unknown -> Healthy <-> Unreachable`. The `enabled` flag
//! is orthogonal: a disabled server is never a candidate, poll results that
//! arrive while it is disabled are dropped, and re-enabling starts over at
//! `Unknown`.

use chrono::{DateTime, Utc};
use common::secret::{secrets_equal, SecretString};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::LbError;
use crate::models::{LoadSnapshot, ServerHealth, ServerStatus};
use crate::observability::metrics;

/// Static description of a server, as created by an administrator.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub server_id: String,
    /// API base, e.g. `https://bbb1.example.com/bigbluebutton/api`.
    pub base_url: String,
    pub secret: SecretString,
    pub poll_interval: Duration,
    pub enabled: bool,
}

#[derive(Debug)]
struct ServerState {
    enabled: bool,
    health: ServerHealth,
    consecutive_failures: u32,
    last_poll_at: Option<DateTime<Utc>>,
    load: LoadSnapshot,
}

/// Result of one poll, as seen by the registry.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Success(LoadSnapshot),
    Failure(String),
}

/// A health transition caused by a poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: ServerHealth,
    pub to: ServerHealth,
}

#[derive(Debug)]
pub struct ServerEntry {
    pub server_id: String,
    pub base_url: String,
    pub secret: SecretString,
    pub poll_interval: Duration,
    state: Mutex<ServerState>,
    /// Reservations not yet reflected by a poll.
    in_flight: AtomicU32,
    /// Committed reservations not yet absorbed by a poll.
    committed: AtomicU32,
    poll_guard: tokio::sync::Mutex<()>,
}

impl ServerEntry {
    /// A standalone entry. Registries build theirs through `ServerRegistry::create`.
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            server_id: spec.server_id,
            base_url: spec.base_url,
            secret: spec.secret,
            poll_interval: spec.poll_interval,
            state: Mutex::new(ServerState {
                enabled: spec.enabled,
                health: ServerHealth::Unknown,
                consecutive_failures: 0,
                last_poll_at: None,
                load: LoadSnapshot::default(),
            }),
            in_flight: AtomicU32::new(0),
            committed: AtomicU32::new(0),
            poll_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn health(&self) -> ServerHealth {
        self.state.lock().health
    }

    pub fn load(&self) -> LoadSnapshot {
        self.state.lock().load
    }

    pub fn is_candidate(&self) -> bool {
        let state = self.state.lock();
        state.enabled && state.health == ServerHealth::Healthy
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ServerStatus {
        let state = self.state.lock();
        ServerStatus {
            server_id: self.server_id.clone(),
            base_url: self.base_url.clone(),
            enabled: state.enabled,
            health: state.health,
            consecutive_failures: state.consecutive_failures,
            last_poll_at: state.last_poll_at,
            load: state.load,
            in_flight: self.in_flight(),
            poll_interval_seconds: self.poll_interval.as_secs(),
        }
    }

    pub fn spec(&self) -> ServerSpec {
        ServerSpec {
            server_id: self.server_id.clone(),
            base_url: self.base_url.clone(),
            secret: self.secret.clone(),
            poll_interval: self.poll_interval,
            enabled: self.is_enabled(),
        }
    }

    /// Take one reservation if the counter still equals `expected`.
    pub(crate) fn try_reserve(&self, expected: u32) -> bool {
        self.in_flight
            .compare_exchange(expected, expected.saturating_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop an uncommitted reservation.
    pub(crate) fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// Mark a reservation as backed by a real meeting on the backend.
    pub(crate) fn commit(&self) {
        self.committed.fetch_add(1, Ordering::AcqRel);
    }

    /// Committed reservations a poll starting now will observe.
    pub(crate) fn committed(&self) -> u32 {
        self.committed.load(Ordering::Acquire)
    }

    fn absorb(&self, count: u32) {
        if count == 0 {
            return;
        }
        let _ = self
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(count)));
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(count)));
    }

    /// Acquire the per-server poll guard without waiting.
    ///
    /// Returns `None` while another poll of this server is in flight.
    pub(crate) fn try_begin_poll(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.poll_guard.try_lock().ok()
    }
}

#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<ServerEntry>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server. Ids and secrets must be unique.
    pub fn create(&self, spec: ServerSpec) -> Result<Arc<ServerEntry>, LbError> {
        if spec.server_id.is_empty() {
            return Err(LbError::Validation("Server id must not be empty".to_string()));
        }
        self.ensure_unique_secret(&spec.server_id, &spec.secret)?;

        match self.servers.entry(spec.server_id.clone()) {
            Entry::Occupied(_) => Err(LbError::Configuration(format!(
                "Server '{}' already exists",
                spec.server_id
            ))),
            Entry::Vacant(slot) => {
                let entry = Arc::new(ServerEntry::new(spec));
                slot.insert(entry.clone());
                info!(
                    target: "lb.servers",
                    server_id = %entry.server_id,
                    base_url = %entry.base_url,
                    enabled = entry.is_enabled(),
                    "Server registered"
                );
                Ok(entry)
            }
        }
    }

    /// Replace a server's static description. Health starts over at `Unknown`.
    pub fn replace(&self, spec: ServerSpec) -> Result<Arc<ServerEntry>, LbError> {
        self.ensure_unique_secret(&spec.server_id, &spec.secret)?;
        let entry = Arc::new(ServerEntry::new(spec));
        self.servers.insert(entry.server_id.clone(), entry.clone());
        info!(target: "lb.servers", server_id = %entry.server_id, "Server updated");
        Ok(entry)
    }

    /// Fail if another server already uses `secret`.
    pub fn ensure_unique_secret(&self, server_id: &str, secret: &SecretString) -> Result<(), LbError> {
        let clash = self
            .servers
            .iter()
            .any(|s| s.key() != server_id && secrets_equal(&s.value().secret, secret));
        if clash {
            return Err(LbError::Configuration(format!(
                "Secret of server '{server_id}' is already used by another server"
            )));
        }
        Ok(())
    }

    pub fn remove(&self, server_id: &str) -> Result<Arc<ServerEntry>, LbError> {
        let (_, entry) = self
            .servers
            .remove(server_id)
            .ok_or_else(|| LbError::NotFound(format!("Server '{server_id}'")))?;
        info!(target: "lb.servers", server_id, "Server removed");
        Ok(entry)
    }

    pub fn get(&self, server_id: &str) -> Result<Arc<ServerEntry>, LbError> {
        self.servers
            .get(server_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| LbError::NotFound(format!("Server '{server_id}'")))
    }

    /// All servers, ordered by id.
    pub fn entries(&self) -> Vec<Arc<ServerEntry>> {
        let mut entries: Vec<_> = self.servers.iter().map(|s| s.value().clone()).collect();
        entries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        entries
    }

    pub fn list(&self) -> Vec<ServerStatus> {
        self.entries().iter().map(|s| s.status()).collect()
    }

    /// Enabled and healthy servers, ordered by id.
    pub fn list_candidates(&self) -> Vec<Arc<ServerEntry>> {
        self.entries().into_iter().filter(|s| s.is_candidate()).collect()
    }

    /// Set the administrative flag. Returns whether it changed.
    ///
    /// Enabling a disabled server resets it to `Unknown` with a clean
    /// failure counter.
    pub fn set_enabled(&self, server_id: &str, enabled: bool) -> Result<bool, LbError> {
        let entry = self.get(server_id)?;
        let mut state = entry.state.lock();
        if state.enabled == enabled {
            return Ok(false);
        }

        state.enabled = enabled;
        if enabled {
            state.health = ServerHealth::Unknown;
            state.consecutive_failures = 0;
        }
        drop(state);

        info!(target: "lb.servers", server_id, enabled, "Server enabled flag changed");
        Ok(true)
    }

    /// Apply one poll result. Only the poller calls this.
    ///
    /// `absorbed` is the committed-reservation count read when the poll
    /// started; those meetings are part of the new snapshot.
    pub(crate) fn record_poll_result(
        &self,
        server: &ServerEntry,
        outcome: PollOutcome,
        fail_threshold: u32,
        absorbed: u32,
    ) -> Option<HealthTransition> {
        let mut state = server.state.lock();
        if !state.enabled {
            debug!(target: "lb.servers", server_id = %server.server_id, "Dropping poll result for disabled server");
            return None;
        }

        let from = state.health;
        match outcome {
            PollOutcome::Success(load) => {
                state.load = load;
                state.consecutive_failures = 0;
                state.health = ServerHealth::Healthy;
                state.last_poll_at = Some(Utc::now());
                server.absorb(absorbed);
            }
            PollOutcome::Failure(reason) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_poll_at = Some(Utc::now());
                if state.consecutive_failures >= fail_threshold {
                    state.health = ServerHealth::Unreachable;
                }
                debug!(
                    target: "lb.servers",
                    server_id = %server.server_id,
                    failures = state.consecutive_failures,
                    reason = %reason,
                    "Poll failed"
                );
            }
        }

        let to = state.health;
        drop(state);

        if from == to {
            return None;
        }

        match to {
            ServerHealth::Unreachable => warn!(
                target: "lb.servers",
                server_id = %server.server_id,
                from = from.as_str(),
                "Server unreachable"
            ),
            _ => info!(
                target: "lb.servers",
                server_id = %server.server_id,
                from = from.as_str(),
                to = to.as_str(),
                "Server health changed"
            ),
        }
        metrics::record_health_transition(to.as_str());
        Some(HealthTransition { from, to })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn spec(id: &str) -> ServerSpec {
        ServerSpec {
            server_id: id.to_string(),
            base_url: format!("https://{id}.example.com/bigbluebutton/api"),
            secret: SecretString::from(format!("{id}-secret")),
            poll_interval: Duration::from_secs(10),
            enabled: true,
        }
    }

    fn healthy(registry: &ServerRegistry, id: &str, active: u32) -> Arc<ServerEntry> {
        let entry = registry.create(spec(id)).unwrap();
        let load = LoadSnapshot {
            active_meetings: active,
            ..Default::default()
        };
        registry.record_poll_result(&entry, PollOutcome::Success(load), 5, 0);
        entry
    }

    fn fail(registry: &ServerRegistry, entry: &ServerEntry) -> Option<HealthTransition> {
        registry.record_poll_result(entry, PollOutcome::Failure("timeout".to_string()), 5, 0)
    }

    #[test]
    fn test_new_server_is_unknown_and_not_candidate() {
        let registry = ServerRegistry::new();
        let entry = registry.create(spec("bbb1")).unwrap();
        assert_eq!(entry.health(), ServerHealth::Unknown);
        assert!(registry.list_candidates().is_empty());
    }

    #[test]
    fn test_duplicate_id_or_secret_rejected() {
        let registry = ServerRegistry::new();
        registry.create(spec("bbb1")).unwrap();
        assert!(matches!(registry.create(spec("bbb1")), Err(LbError::Configuration(_))));

        let mut clone = spec("bbb2");
        clone.secret = SecretString::from("bbb1-secret");
        assert!(matches!(registry.create(clone), Err(LbError::Configuration(_))));
    }

    #[test]
    fn test_threshold_marks_unreachable_and_success_recovers() {
        let registry = ServerRegistry::new();
        let entry = healthy(&registry, "bbb1", 0);
        assert_eq!(registry.list_candidates().len(), 1);

        for _ in 0..4 {
            assert!(fail(&registry, &entry).is_none());
            assert_eq!(entry.health(), ServerHealth::Healthy);
        }

        let transition = fail(&registry, &entry).unwrap();
        assert_eq!(transition.to, ServerHealth::Unreachable);
        assert!(registry.list_candidates().is_empty());
        assert_eq!(entry.status().consecutive_failures, 5);

        let transition = registry
            .record_poll_result(&entry, PollOutcome::Success(LoadSnapshot::default()), 5, 0)
            .unwrap();
        assert_eq!(transition.to, ServerHealth::Healthy);
        assert_eq!(entry.status().consecutive_failures, 0);
        assert_eq!(registry.list_candidates().len(), 1);
    }

    #[test]
    fn test_failures_keep_stale_load() {
        let registry = ServerRegistry::new();
        let entry = healthy(&registry, "bbb1", 7);
        fail(&registry, &entry);
        assert_eq!(entry.load().active_meetings, 7);
    }

    #[test]
    fn test_disabled_server_is_never_candidate_and_ignores_polls() {
        let registry = ServerRegistry::new();
        let entry = healthy(&registry, "bbb1", 0);

        assert!(registry.set_enabled("bbb1", false).unwrap());
        assert_eq!(entry.health(), ServerHealth::Healthy);
        assert!(registry.list_candidates().is_empty());

        // A poll that was in flight when the server got disabled is dropped.
        assert!(fail(&registry, &entry).is_none());
        assert_eq!(entry.status().consecutive_failures, 0);

        assert!(registry.set_enabled("bbb1", true).unwrap());
        assert_eq!(entry.health(), ServerHealth::Unknown);
        assert!(registry.list_candidates().is_empty());
        assert!(!registry.set_enabled("bbb1", true).unwrap());
    }

    #[test]
    fn test_set_enabled_unknown_server() {
        let registry = ServerRegistry::new();
        assert!(matches!(registry.set_enabled("nope", true), Err(LbError::NotFound(_))));
    }

    #[test]
    fn test_reservation_counters() {
        let registry = ServerRegistry::new();
        let entry = healthy(&registry, "bbb1", 0);

        assert!(entry.try_reserve(0));
        assert!(!entry.try_reserve(0));
        assert!(entry.try_reserve(1));
        assert_eq!(entry.in_flight(), 2);

        entry.release();
        entry.commit();
        assert_eq!(entry.in_flight(), 1);

        // A poll that started after the commit absorbs it.
        let absorbed = entry.committed();
        registry.record_poll_result(&entry, PollOutcome::Success(LoadSnapshot::default()), 5, absorbed);
        assert_eq!(entry.in_flight(), 0);
        assert_eq!(entry.committed(), 0);

        entry.release();
        assert_eq!(entry.in_flight(), 0);
    }

    #[test]
    fn test_pending_reservations_survive_poll() {
        let registry = ServerRegistry::new();
        let entry = healthy(&registry, "bbb1", 0);

        assert!(entry.try_reserve(0));
        registry.record_poll_result(&entry, PollOutcome::Success(LoadSnapshot::default()), 5, 0);
        assert_eq!(entry.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_poll_guard_allows_one_poll_at_a_time() {
        let registry = ServerRegistry::new();
        let entry = registry.create(spec("bbb1")).unwrap();

        let guard = entry.try_begin_poll();
        assert!(guard.is_some());
        assert!(entry.try_begin_poll().is_none());
        drop(guard);
        assert!(entry.try_begin_poll().is_some());
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ServerRegistry::new();
        for id in ["bbb3", "bbb1", "bbb2"] {
            registry.create(spec(id)).unwrap();
        }
        let ids: Vec<String> = registry.list().into_iter().map(|s| s.server_id).collect();
        assert_eq!(ids, vec!["bbb1", "bbb2", "bbb3"]);
    }
}
