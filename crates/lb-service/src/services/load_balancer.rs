//! Server selection for new meetings.
//!
//! Picks the enabled, healthy server with the lowest effective load
//! (`active_meetings` from the last poll plus in-flight reservations), ties
//! broken by ascending server id.
//!
//! The reservation is taken with a compare-and-swap on the chosen server's
//! in-flight counter against the value the decision was based on. If another
//! request reserved that server in the meantime the swap fails and selection
//! starts over with fresh numbers, so concurrent creates spread out instead of
//! piling onto the same server. No lock is held and nothing here awaits.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::errors::LbError;
use crate::models::Tenant;
use crate::observability::metrics;
use crate::registry::servers::{ServerEntry, ServerRegistry};

/// An in-flight load increment on a selected server.
///
/// Dropping it without [`Reservation::commit`] gives the increment back.
#[derive(Debug)]
pub struct Reservation {
    server: Arc<ServerEntry>,
    committed: bool,
}

impl Reservation {
    pub fn server(&self) -> &Arc<ServerEntry> {
        &self.server
    }

    /// Keep the increment until the next poll accounts for the new meeting.
    pub fn commit(mut self) {
        self.server.commit();
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.server.release();
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    servers: Arc<ServerRegistry>,
}

impl LoadBalancer {
    pub fn new(servers: Arc<ServerRegistry>) -> Self {
        Self { servers }
    }

    /// Select a server for a new meeting of `tenant` and reserve capacity on it.
    pub fn select(&self, tenant: &Tenant) -> Result<Reservation, LbError> {
        let start = Instant::now();
        let mut contended = 0u32;

        loop {
            let best = self
                .servers
                .list_candidates()
                .into_iter()
                .map(|server| {
                    let in_flight = server.in_flight();
                    let load = u64::from(server.load().active_meetings) + u64::from(in_flight);
                    (server, in_flight, load)
                })
                .min_by(|(a, _, a_load), (b, _, b_load)| {
                    a_load.cmp(b_load).then_with(|| a.server_id.cmp(&b.server_id))
                });

            let Some((server, observed, load)) = best else {
                warn!(target: "lb.balancer", tenant = %tenant.name, "No healthy server available");
                metrics::record_selection("no_server", start.elapsed());
                return Err(LbError::NoServerAvailable);
            };

            if server.try_reserve(observed) {
                debug!(
                    target: "lb.balancer",
                    tenant = %tenant.name,
                    server_id = %server.server_id,
                    load,
                    contended,
                    "Server selected"
                );
                metrics::record_selection("success", start.elapsed());
                return Ok(Reservation {
                    server,
                    committed: false,
                });
            }

            contended += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::LoadSnapshot;
    use crate::registry::servers::{PollOutcome, ServerSpec};
    use common::secret::SecretString;
    use std::collections::HashSet;
    use std::time::Duration;

    fn tenant() -> Tenant {
        Tenant {
            name: "acme".to_string(),
            display_name: "Acme".to_string(),
            secret: SecretString::from("acme-secret"),
            realms: vec!["bbb.acme.test".to_string()],
            overrides: Vec::new(),
            enabled: true,
        }
    }

    fn add_server(registry: &ServerRegistry, id: &str, active: u32) -> Arc<ServerEntry> {
        let entry = registry
            .create(ServerSpec {
                server_id: id.to_string(),
                base_url: format!("https://{id}/bigbluebutton/api"),
                secret: SecretString::from(format!("{id}-secret")),
                poll_interval: Duration::from_secs(10),
                enabled: true,
            })
            .unwrap();
        let load = LoadSnapshot {
            active_meetings: active,
            ..Default::default()
        };
        registry.record_poll_result(&entry, PollOutcome::Success(load), 5, 0);
        entry
    }

    #[test]
    fn test_empty_candidate_set() {
        let registry = Arc::new(ServerRegistry::new());
        let balancer = LoadBalancer::new(registry.clone());
        assert!(matches!(balancer.select(&tenant()), Err(LbError::NoServerAvailable)));

        // Unknown health is not good enough.
        registry
            .create(ServerSpec {
                server_id: "fresh".to_string(),
                base_url: "https://fresh/bigbluebutton/api".to_string(),
                secret: SecretString::from("fresh-secret"),
                poll_interval: Duration::from_secs(10),
                enabled: true,
            })
            .unwrap();
        assert!(matches!(balancer.select(&tenant()), Err(LbError::NoServerAvailable)));
    }

    #[test]
    fn test_picks_lowest_load() {
        let registry = Arc::new(ServerRegistry::new());
        add_server(&registry, "bbb1", 5);
        add_server(&registry, "bbb2", 2);
        add_server(&registry, "bbb3", 9);

        let balancer = LoadBalancer::new(registry);
        let reservation = balancer.select(&tenant()).unwrap();
        assert_eq!(reservation.server().server_id, "bbb2");
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let registry = Arc::new(ServerRegistry::new());
        add_server(&registry, "bbb2", 1);
        add_server(&registry, "bbb1", 1);

        let balancer = LoadBalancer::new(registry);
        assert_eq!(balancer.select(&tenant()).unwrap().server().server_id, "bbb1");
    }

    #[test]
    fn test_n_selections_spread_over_n_servers() {
        let registry = Arc::new(ServerRegistry::new());
        for id in ["bbb1", "bbb2", "bbb3", "bbb4"] {
            add_server(&registry, id, 0);
        }

        let balancer = LoadBalancer::new(registry);
        let mut chosen = Vec::new();
        for _ in 0..4 {
            let reservation = balancer.select(&tenant()).unwrap();
            chosen.push(reservation.server().server_id.clone());
            reservation.commit();
        }
        assert_eq!(chosen, vec!["bbb1", "bbb2", "bbb3", "bbb4"]);
    }

    #[test]
    fn test_dropped_reservation_is_released() {
        let registry = Arc::new(ServerRegistry::new());
        let bbb1 = add_server(&registry, "bbb1", 0);
        add_server(&registry, "bbb2", 0);

        let balancer = LoadBalancer::new(registry);
        let reservation = balancer.select(&tenant()).unwrap();
        assert_eq!(bbb1.in_flight(), 1);
        drop(reservation);
        assert_eq!(bbb1.in_flight(), 0);

        // bbb1 is the least loaded again.
        assert_eq!(balancer.select(&tenant()).unwrap().server().server_id, "bbb1");
    }

    #[test]
    fn test_disabled_server_never_selected() {
        let registry = Arc::new(ServerRegistry::new());
        add_server(&registry, "bbb1", 0);
        add_server(&registry, "bbb2", 50);
        registry.set_enabled("bbb1", false).unwrap();

        let balancer = LoadBalancer::new(registry);
        for _ in 0..3 {
            let reservation = balancer.select(&tenant()).unwrap();
            assert_eq!(reservation.server().server_id, "bbb2");
            reservation.commit();
        }
    }

    #[test]
    fn test_concurrent_selections_pick_distinct_servers() {
        let registry = Arc::new(ServerRegistry::new());
        for i in 0..8 {
            add_server(&registry, &format!("bbb{i}"), 0);
        }
        let balancer = Arc::new(LoadBalancer::new(registry));
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let balancer = balancer.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let reservation = balancer.select(&tenant()).unwrap();
                    let id = reservation.server().server_id.clone();
                    reservation.commit();
                    id
                })
            })
            .collect();

        let chosen: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(chosen.len(), 8);
    }
}
