//! Administrative operations on tenants and servers.
//!
//! Every change is applied to the in-memory registry first and then
//! persisted; a failed write to the store rolls back newly created
//! entries. Server changes also start or stop the server's poll task.

use common::secret::{secrets_equal, SecretString};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::errors::LbError;
use crate::models::{
    ClusterState, OverrideOp, OverrideRule, ServerState, ServerStatus, Tenant, TenantState,
};
use crate::registry::meetings::MeetingRegistry;
use crate::registry::servers::{ServerEntry, ServerRegistry, ServerSpec};
use crate::registry::tenants::TenantRegistry;
use crate::repositories::ClusterStore;
use crate::tasks::health_poller::PollSupervisor;

/// Length of generated tenant secrets, in random bytes.
const GENERATED_SECRET_BYTES: usize = 32;

/// A tenant to create.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub name: String,
    pub display_name: Option<String>,
    /// Generated when absent.
    pub secret: Option<SecretString>,
    pub realms: Vec<String>,
}

/// A server to create.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub server_id: String,
    pub base_url: String,
    pub secret: SecretString,
    pub enabled: bool,
    /// Defaults to the configured poll interval.
    pub poll_interval: Option<Duration>,
}

/// Counts of what an import changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub tenants: usize,
    pub servers: usize,
    pub removed_tenants: usize,
    pub removed_servers: usize,
}

/// Generate a random tenant secret (32 bytes, hex encoded).
pub fn generate_secret() -> Result<SecretString, LbError> {
    let mut bytes = [0u8; GENERATED_SECRET_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|e| LbError::Internal(format!("Random secret generation failed: {e}")))?;
    Ok(SecretString::from(hex::encode(bytes)))
}

/// Tenant names become part of backend meeting ids.
fn validate_tenant_name(name: &str) -> Result<(), LbError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(LbError::Validation(format!(
            "Invalid tenant name '{name}' (expected lowercase letters, digits, '-' or '_')"
        )))
    }
}

fn same_spec(a: &ServerSpec, b: &ServerSpec) -> bool {
    a.server_id == b.server_id
        && a.base_url == b.base_url
        && a.poll_interval == b.poll_interval
        && a.enabled == b.enabled
        && secrets_equal(&a.secret, &b.secret)
}

pub struct ClusterAdmin {
    tenants: Arc<TenantRegistry>,
    servers: Arc<ServerRegistry>,
    meetings: Arc<MeetingRegistry>,
    store: Arc<dyn ClusterStore>,
    supervisor: Arc<PollSupervisor>,
    default_poll_interval: Duration,
    poll_timeout: Duration,
}

impl ClusterAdmin {
    pub fn new(
        tenants: Arc<TenantRegistry>,
        servers: Arc<ServerRegistry>,
        meetings: Arc<MeetingRegistry>,
        store: Arc<dyn ClusterStore>,
        supervisor: Arc<PollSupervisor>,
        default_poll_interval: Duration,
    ) -> Self {
        let poll_timeout = supervisor.poller().settings().timeout;
        Self {
            tenants,
            servers,
            meetings,
            store,
            supervisor,
            default_poll_interval,
            poll_timeout,
        }
    }

    /// Load tenants, servers and open meetings from the store and start
    /// polling the enabled servers.
    #[instrument(skip_all)]
    pub async fn load_state(&self) -> Result<(), LbError> {
        let tenants = self.store.load_tenants().await?;
        let servers = self.store.load_servers().await?;
        let meetings = self.store.load_open_meetings().await?;
        let (tenant_count, server_count, meeting_count) = (tenants.len(), servers.len(), meetings.len());

        for tenant in tenants {
            self.tenants.upsert(tenant)?;
        }
        for spec in servers {
            let entry = self.servers.replace(spec)?;
            self.supervisor.start(entry);
        }
        for meeting in meetings {
            self.meetings.restore(meeting);
        }

        info!(
            target: "lb.admin",
            store = self.store.kind(),
            tenants = tenant_count,
            servers = server_count,
            meetings = meeting_count,
            "Cluster state loaded"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tenants
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(tenant = %new.name))]
    pub async fn create_tenant(&self, new: NewTenant) -> Result<Arc<Tenant>, LbError> {
        validate_tenant_name(&new.name)?;
        let secret = match new.secret {
            Some(secret) => secret,
            None => generate_secret()?,
        };

        let tenant = self.tenants.register(Tenant {
            display_name: new.display_name.unwrap_or_else(|| new.name.clone()),
            name: new.name,
            secret,
            realms: new.realms,
            overrides: Vec::new(),
            enabled: true,
        })?;

        if let Err(e) = self.store.save_tenant(&tenant).await {
            let _ = self.tenants.remove(&tenant.name);
            return Err(e);
        }

        info!(target: "lb.admin", tenant = %tenant.name, realms = ?tenant.realms, "Tenant created");
        Ok(tenant)
    }

    pub async fn set_tenant_enabled(&self, name: &str, enabled: bool) -> Result<Arc<Tenant>, LbError> {
        let tenant = self.tenants.set_enabled(name, enabled)?;
        self.store.save_tenant(&tenant).await?;
        info!(target: "lb.admin", tenant = %name, enabled, "Tenant enabled flag changed");
        Ok(tenant)
    }

    pub async fn remove_tenant(&self, name: &str) -> Result<(), LbError> {
        self.tenants.remove(name)?;
        self.store.delete_tenant(name).await?;
        info!(target: "lb.admin", tenant = %name, "Tenant removed");
        Ok(())
    }

    pub fn list_tenants(&self) -> Vec<Arc<Tenant>> {
        self.tenants.list()
    }

    /// Add a rule given in `name<op>value` form.
    pub async fn set_override(&self, tenant: &str, rule: &str) -> Result<Arc<Tenant>, LbError> {
        let rule: OverrideRule = rule.parse()?;
        let updated = self.tenants.add_override_rule(tenant, rule)?;
        self.store.save_tenant(&updated).await?;
        Ok(updated)
    }

    /// Remove the rules for `parameter`, for one operator or all of them.
    pub async fn unset_override(
        &self,
        tenant: &str,
        parameter: &str,
        op: Option<OverrideOp>,
    ) -> Result<usize, LbError> {
        let removed = self.tenants.remove_override_rule(tenant, parameter, op)?;
        if removed > 0 {
            let updated = self.tenants.get(tenant)?;
            self.store.save_tenant(&updated).await?;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Servers
    // ------------------------------------------------------------------

    fn validate_server(&self, spec: &ServerSpec) -> Result<(), LbError> {
        if spec.server_id.is_empty() {
            return Err(LbError::Validation("Server id must not be empty".to_string()));
        }
        let url = url::Url::parse(&spec.base_url)
            .map_err(|e| LbError::Validation(format!("Invalid base URL '{}': {e}", spec.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LbError::Validation(format!(
                "Base URL '{}' must use http or https",
                spec.base_url
            )));
        }
        if spec.poll_interval <= self.poll_timeout {
            return Err(LbError::Configuration(format!(
                "Poll interval of server '{}' ({}s) must be longer than the poll timeout ({}s)",
                spec.server_id,
                spec.poll_interval.as_secs(),
                self.poll_timeout.as_secs()
            )));
        }
        Ok(())
    }

    fn spec_from(&self, new: NewServer) -> ServerSpec {
        ServerSpec {
            server_id: new.server_id,
            base_url: new.base_url,
            secret: new.secret,
            poll_interval: new.poll_interval.unwrap_or(self.default_poll_interval),
            enabled: new.enabled,
        }
    }

    #[instrument(skip_all, fields(server_id = %new.server_id))]
    pub async fn create_server(&self, new: NewServer) -> Result<Arc<ServerEntry>, LbError> {
        let spec = self.spec_from(new);
        self.validate_server(&spec)?;

        let entry = self.servers.create(spec)?;
        if let Err(e) = self.store.save_server(&entry.spec()).await {
            let _ = self.servers.remove(&entry.server_id);
            return Err(e);
        }

        self.supervisor.start(entry.clone());
        info!(target: "lb.admin", server_id = %entry.server_id, enabled = entry.is_enabled(), "Server created");
        Ok(entry)
    }

    /// Enable or disable a server. Returns whether the flag changed.
    pub async fn set_server_enabled(&self, server_id: &str, enabled: bool) -> Result<bool, LbError> {
        let changed = self.servers.set_enabled(server_id, enabled)?;
        let entry = self.servers.get(server_id)?;

        if enabled {
            if changed || !self.supervisor.is_polling(server_id) {
                self.supervisor.start(entry.clone());
            }
        } else {
            self.supervisor.stop(server_id);
        }

        if changed {
            self.store.save_server(&entry.spec()).await?;
            info!(target: "lb.admin", server_id, enabled, "Server enabled flag changed");
        }
        Ok(changed)
    }

    /// Remove a server. Rejected while it still hosts open meetings.
    pub async fn remove_server(&self, server_id: &str) -> Result<(), LbError> {
        self.servers.get(server_id)?;

        let open = self.meetings.open_on_server(server_id);
        if !open.is_empty() {
            return Err(LbError::Configuration(format!(
                "Server '{server_id}' still hosts {} open meeting(s)",
                open.len()
            )));
        }

        self.supervisor.stop(server_id);
        self.servers.remove(server_id)?;
        self.store.delete_server(server_id).await?;
        info!(target: "lb.admin", server_id, "Server removed");
        Ok(())
    }

    pub fn list_servers(&self) -> Vec<ServerStatus> {
        self.servers.list()
    }

    // ------------------------------------------------------------------
    // State export / import
    // ------------------------------------------------------------------

    /// Snapshot of all tenants and servers, secrets included.
    pub fn export_state(&self) -> ClusterState {
        let tenants = self
            .tenants
            .list()
            .iter()
            .map(|t| TenantState {
                name: t.name.clone(),
                display_name: Some(t.display_name.clone()),
                secret: t.secret.clone(),
                realms: t.realms.clone(),
                overrides: t.overrides.iter().map(ToString::to_string).collect(),
                enabled: t.enabled,
            })
            .collect();

        let servers = self
            .servers
            .entries()
            .iter()
            .map(|s| ServerState {
                server_id: s.server_id.clone(),
                base_url: s.base_url.clone(),
                secret: s.secret.clone(),
                enabled: s.is_enabled(),
                poll_interval_seconds: Some(s.poll_interval.as_secs()),
            })
            .collect();

        ClusterState { tenants, servers }
    }

    /// Reject an import whose realms or server secrets clash with each other
    /// or with tenants and servers already registered.
    ///
    /// Mirrors the checks `TenantRegistry::upsert` and `ServerRegistry`
    /// apply one entry at a time, so an import that passes here cannot fail
    /// halfway on a conflict.
    fn check_import_conflicts(&self, tenants: &[Tenant], specs: &[ServerSpec]) -> Result<(), LbError> {
        let mut realm_owners: HashMap<&str, &str> = HashMap::new();
        for tenant in tenants {
            self.tenants.check_realms(&tenant.name, &tenant.realms)?;
            for realm in &tenant.realms {
                match realm_owners.insert(realm, &tenant.name) {
                    Some(other) if other != tenant.name => {
                        return Err(LbError::Configuration(format!(
                            "Realm '{realm}' is claimed by tenants '{other}' and '{}'",
                            tenant.name
                        )));
                    }
                    _ => {}
                }
            }
        }

        for (i, spec) in specs.iter().enumerate() {
            self.servers.ensure_unique_secret(&spec.server_id, &spec.secret)?;
            let clash = specs
                .iter()
                .skip(i + 1)
                .any(|other| other.server_id != spec.server_id && secrets_equal(&other.secret, &spec.secret));
            if clash {
                return Err(LbError::Configuration(format!(
                    "Secret of server '{}' is used by another imported server",
                    spec.server_id
                )));
            }
        }
        Ok(())
    }

    /// Create or update every tenant and server in `state`.
    ///
    /// The whole state is validated before anything changes, conflicts
    /// with registered tenants and servers included. With `clean`,
    /// tenants and servers missing from `state` are removed; servers that
    /// still host open meetings are kept.
    #[instrument(skip_all, fields(clean))]
    pub async fn import_state(&self, state: ClusterState, clean: bool) -> Result<ImportReport, LbError> {
        let mut tenants = Vec::with_capacity(state.tenants.len());
        for t in state.tenants {
            validate_tenant_name(&t.name)?;
            let overrides = t
                .overrides
                .iter()
                .map(|rule| rule.parse::<OverrideRule>())
                .collect::<Result<Vec<_>, _>>()?;
            tenants.push(Tenant {
                display_name: t.display_name.unwrap_or_else(|| t.name.clone()),
                name: t.name,
                secret: t.secret,
                realms: t.realms,
                overrides,
                enabled: t.enabled,
            });
        }

        let mut specs = Vec::with_capacity(state.servers.len());
        for s in state.servers {
            let spec = ServerSpec {
                server_id: s.server_id,
                base_url: s.base_url,
                secret: s.secret,
                poll_interval: s
                    .poll_interval_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_poll_interval),
                enabled: s.enabled,
            };
            self.validate_server(&spec)?;
            specs.push(spec);
        }

        self.check_import_conflicts(&tenants, &specs)?;

        let mut report = ImportReport::default();
        let tenant_names: HashSet<String> = tenants.iter().map(|t| t.name.clone()).collect();
        let server_ids: HashSet<String> = specs.iter().map(|s| s.server_id.clone()).collect();

        for tenant in tenants {
            let tenant = self.tenants.upsert(tenant)?;
            self.store.save_tenant(&tenant).await?;
            report.tenants += 1;
        }

        for spec in specs {
            let entry = match self.servers.get(&spec.server_id) {
                Ok(existing) if same_spec(&existing.spec(), &spec) => existing,
                Ok(_) => {
                    let entry = self.servers.replace(spec)?;
                    self.supervisor.start(entry.clone());
                    entry
                }
                Err(_) => {
                    let entry = self.servers.create(spec)?;
                    self.supervisor.start(entry.clone());
                    entry
                }
            };
            self.store.save_server(&entry.spec()).await?;
            report.servers += 1;
        }

        if clean {
            for tenant in self.tenants.list() {
                if !tenant_names.contains(&tenant.name) {
                    self.remove_tenant(&tenant.name).await?;
                    report.removed_tenants += 1;
                }
            }
            for server in self.servers.entries() {
                if server_ids.contains(&server.server_id) {
                    continue;
                }
                match self.remove_server(&server.server_id).await {
                    Ok(()) => report.removed_servers += 1,
                    Err(LbError::Configuration(reason)) => {
                        warn!(target: "lb.admin", server_id = %server.server_id, reason = %reason, "Keeping server");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            target: "lb.admin",
            tenants = report.tenants,
            servers = report.servers,
            removed_tenants = report.removed_tenants,
            removed_servers = report.removed_servers,
            "Cluster state imported"
        );
        Ok(report)
    }
}
