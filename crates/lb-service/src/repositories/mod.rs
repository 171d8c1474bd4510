//! Persistence for tenants, servers and meetings.
//!
//! The registries are authoritative at runtime; the store keeps the
//! administrative configuration and meeting records across restarts.
//! [`ClusterStore`] is implemented by [`PgClusterStore`] (PostgreSQL via
//! sqlx) and [`MemoryStore`] (no database configured, and tests).
//!
//! Server health and load are never stored; they are re-derived by the
//! poller after startup.

pub mod meetings;
pub mod memory;
pub mod servers;
pub mod tenants;

use async_trait::async_trait;
use common::types::MeetingUuid;
use sqlx::PgPool;

use crate::errors::LbError;
use crate::models::{Meeting, Tenant};
use crate::registry::servers::ServerSpec;

pub use meetings::MeetingsRepository;
pub use memory::MemoryStore;
pub use servers::ServersRepository;
pub use tenants::TenantsRepository;

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Short name for readiness output and logs.
    fn kind(&self) -> &'static str;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), LbError>;

    async fn load_tenants(&self) -> Result<Vec<Tenant>, LbError>;
    async fn save_tenant(&self, tenant: &Tenant) -> Result<(), LbError>;
    async fn delete_tenant(&self, name: &str) -> Result<bool, LbError>;

    async fn load_servers(&self) -> Result<Vec<ServerSpec>, LbError>;
    async fn save_server(&self, server: &ServerSpec) -> Result<(), LbError>;
    async fn delete_server(&self, server_id: &str) -> Result<bool, LbError>;

    /// Meetings in `created` or `running` state.
    async fn load_open_meetings(&self) -> Result<Vec<Meeting>, LbError>;
    async fn load_meeting(&self, uuid: MeetingUuid) -> Result<Option<Meeting>, LbError>;
    async fn save_meeting(&self, meeting: &Meeting) -> Result<(), LbError>;
    async fn delete_meeting(&self, uuid: MeetingUuid) -> Result<bool, LbError>;
}

/// PostgreSQL-backed store delegating to the repositories.
#[derive(Debug, Clone)]
pub struct PgClusterStore {
    pool: PgPool,
}

impl PgClusterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ClusterStore for PgClusterStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), LbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load_tenants(&self) -> Result<Vec<Tenant>, LbError> {
        TenantsRepository::list(&self.pool).await
    }

    async fn save_tenant(&self, tenant: &Tenant) -> Result<(), LbError> {
        TenantsRepository::upsert(&self.pool, tenant).await
    }

    async fn delete_tenant(&self, name: &str) -> Result<bool, LbError> {
        TenantsRepository::delete(&self.pool, name).await
    }

    async fn load_servers(&self) -> Result<Vec<ServerSpec>, LbError> {
        ServersRepository::list(&self.pool).await
    }

    async fn save_server(&self, server: &ServerSpec) -> Result<(), LbError> {
        ServersRepository::upsert(&self.pool, server).await
    }

    async fn delete_server(&self, server_id: &str) -> Result<bool, LbError> {
        ServersRepository::delete(&self.pool, server_id).await
    }

    async fn load_open_meetings(&self) -> Result<Vec<Meeting>, LbError> {
        MeetingsRepository::list_open(&self.pool).await
    }

    async fn load_meeting(&self, uuid: MeetingUuid) -> Result<Option<Meeting>, LbError> {
        MeetingsRepository::get(&self.pool, uuid).await
    }

    async fn save_meeting(&self, meeting: &Meeting) -> Result<(), LbError> {
        MeetingsRepository::upsert(&self.pool, meeting).await
    }

    async fn delete_meeting(&self, uuid: MeetingUuid) -> Result<bool, LbError> {
        MeetingsRepository::delete(&self.pool, uuid).await
    }
}

/// Record the outcome of one query and pass the result through.
pub(crate) fn observe<T>(
    operation: &str,
    start: std::time::Instant,
    result: Result<T, sqlx::Error>,
) -> Result<T, LbError> {
    let status = if result.is_ok() { "success" } else { "error" };
    crate::observability::metrics::record_db_query(operation, status, start.elapsed());
    result.map_err(|e| {
        tracing::error!(target: "lb.store", operation, error = %e, "Query failed");
        LbError::from(e)
    })
}
