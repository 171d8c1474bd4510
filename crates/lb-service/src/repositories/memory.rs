//! In-memory store used when no database is configured, and in tests.
//!
//! State lives only as long as the process. The secret-uniqueness rule of
//! the `servers` table is enforced here as well.

use async_trait::async_trait;
use common::secret::secrets_equal;
use common::types::MeetingUuid;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ClusterStore;
use crate::errors::LbError;
use crate::models::{Meeting, Tenant};
use crate::registry::servers::ServerSpec;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tenants: DashMap<String, Tenant>,
    servers: DashMap<String, ServerSpec>,
    meetings: DashMap<MeetingUuid, Meeting>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Database`, to exercise error paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LbError::Database("Store unavailable".to_string()));
        }
        Ok(())
    }

    /// Snapshot of a stored meeting, for assertions.
    pub fn meeting(&self, uuid: MeetingUuid) -> Option<Meeting> {
        self.meetings.get(&uuid).map(|m| m.value().clone())
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), LbError> {
        self.check()
    }

    async fn load_tenants(&self) -> Result<Vec<Tenant>, LbError> {
        self.check()?;
        let mut tenants: Vec<Tenant> = self.tenants.iter().map(|t| t.value().clone()).collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tenants)
    }

    async fn save_tenant(&self, tenant: &Tenant) -> Result<(), LbError> {
        self.check()?;
        self.tenants.insert(tenant.name.clone(), tenant.clone());
        Ok(())
    }

    async fn delete_tenant(&self, name: &str) -> Result<bool, LbError> {
        self.check()?;
        self.meetings.retain(|_, m| m.tenant != name);
        Ok(self.tenants.remove(name).is_some())
    }

    async fn load_servers(&self) -> Result<Vec<ServerSpec>, LbError> {
        self.check()?;
        let mut servers: Vec<ServerSpec> = self.servers.iter().map(|s| s.value().clone()).collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(servers)
    }

    async fn save_server(&self, server: &ServerSpec) -> Result<(), LbError> {
        self.check()?;
        let clash = self
            .servers
            .iter()
            .any(|s| s.key() != &server.server_id && secrets_equal(&s.value().secret, &server.secret));
        if clash {
            return Err(LbError::Configuration(
                "Another server already uses this secret".to_string(),
            ));
        }
        self.servers.insert(server.server_id.clone(), server.clone());
        Ok(())
    }

    async fn delete_server(&self, server_id: &str) -> Result<bool, LbError> {
        self.check()?;
        Ok(self.servers.remove(server_id).is_some())
    }

    async fn load_open_meetings(&self) -> Result<Vec<Meeting>, LbError> {
        self.check()?;
        let mut meetings: Vec<Meeting> = self
            .meetings
            .iter()
            .filter(|m| m.value().state.is_open())
            .map(|m| m.value().clone())
            .collect();
        meetings.sort_by_key(|m| m.created_at);
        Ok(meetings)
    }

    async fn load_meeting(&self, uuid: MeetingUuid) -> Result<Option<Meeting>, LbError> {
        self.check()?;
        Ok(self.meeting(uuid))
    }

    async fn save_meeting(&self, meeting: &Meeting) -> Result<(), LbError> {
        self.check()?;
        self.meetings
            .entry(meeting.uuid)
            .and_modify(|stored| {
                // State never moves backwards, same as the SQL upsert.
                let mut updated = meeting.clone();
                if stored.state > updated.state {
                    updated.state = stored.state;
                }
                updated.ended_at = stored.ended_at.or(updated.ended_at);
                updated.internal_meeting_id = updated
                    .internal_meeting_id
                    .take()
                    .or_else(|| stored.internal_meeting_id.clone());
                *stored = updated;
            })
            .or_insert_with(|| meeting.clone());
        Ok(())
    }

    async fn delete_meeting(&self, uuid: MeetingUuid) -> Result<bool, LbError> {
        self.check()?;
        Ok(self.meetings.remove(&uuid).is_some())
    }
}
