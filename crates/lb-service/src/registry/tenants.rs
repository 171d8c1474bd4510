//! Tenant registry.
//!
//! Resolves request hosts to tenants, verifies BBB checksums and stores
//! override rules. Tenants are held as `Arc<Tenant>` snapshots in a sharded
//! map and replaced on mutation, so request paths never wait on an
//! administrative change to an unrelated tenant.
//!
//! Realm uniqueness is enforced here at registration time: realms are
//! claimed one by one through the realm index's entry API and rolled back if
//! any of them is already owned by another tenant.

use common::checksum;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::LbError;
use crate::models::{OverrideOp, OverrideRule, Tenant};

#[derive(Debug, Default)]
pub struct TenantRegistry {
    tenants: DashMap<String, Arc<Tenant>>,
    /// realm -> tenant name
    realms: DashMap<String, String>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tenant.
    ///
    /// Fails with `Configuration` if the name is taken or any realm already
    /// belongs to another tenant. Nothing is changed on failure.
    pub fn register(&self, tenant: Tenant) -> Result<Arc<Tenant>, LbError> {
        if tenant.name.is_empty() {
            return Err(LbError::Validation("Tenant name must not be empty".to_string()));
        }

        match self.tenants.entry(tenant.name.clone()) {
            Entry::Occupied(_) => Err(LbError::Configuration(format!(
                "Tenant '{}' already exists",
                tenant.name
            ))),
            Entry::Vacant(slot) => {
                self.claim_realms(&tenant.name, &tenant.realms)?;
                let tenant = Arc::new(tenant);
                slot.insert(tenant.clone());
                info!(
                    target: "lb.tenants",
                    tenant = %tenant.name,
                    realms = ?tenant.realms,
                    "Tenant registered"
                );
                Ok(tenant)
            }
        }
    }

    /// Insert or replace a tenant, re-claiming its realms.
    pub fn upsert(&self, tenant: Tenant) -> Result<Arc<Tenant>, LbError> {
        if tenant.name.is_empty() {
            return Err(LbError::Validation("Tenant name must not be empty".to_string()));
        }

        let claimed = self.claim_realms(&tenant.name, &tenant.realms)?;
        let tenant = Arc::new(tenant);
        let previous = self.tenants.insert(tenant.name.clone(), tenant.clone());

        if let Some(previous) = previous {
            for realm in previous.realms.iter().filter(|r| !tenant.realms.contains(r)) {
                self.realms.remove_if(realm, |_, owner| *owner == tenant.name);
            }
        }

        info!(
            target: "lb.tenants",
            tenant = %tenant.name,
            realms = ?tenant.realms,
            new_realms = claimed.len(),
            "Tenant updated"
        );
        Ok(tenant)
    }

    /// Fail like [`Self::upsert`] would if any realm belongs to a tenant
    /// other than `owner`. Nothing is claimed.
    pub fn check_realms(&self, owner: &str, realms: &[String]) -> Result<(), LbError> {
        for realm in realms {
            if let Some(other) = self.realms.get(realm).filter(|o| o.value() != owner) {
                return Err(LbError::Configuration(format!(
                    "Realm '{realm}' is already used by tenant '{}'",
                    other.value()
                )));
            }
        }
        Ok(())
    }

    /// Claim every realm for `owner`, rolling back on the first conflict.
    fn claim_realms(&self, owner: &str, realms: &[String]) -> Result<Vec<String>, LbError> {
        let mut claimed = Vec::new();

        for realm in realms {
            match self.realms.entry(realm.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(owner.to_string());
                    claimed.push(realm.clone());
                }
                Entry::Occupied(slot) if slot.get() == owner => {}
                Entry::Occupied(slot) => {
                    let other = slot.get().clone();
                    drop(slot);
                    for realm in &claimed {
                        self.realms.remove(realm);
                    }
                    return Err(LbError::Configuration(format!(
                        "Realm '{realm}' is already used by tenant '{other}'"
                    )));
                }
            }
        }

        Ok(claimed)
    }

    /// Remove a tenant and release its realms.
    pub fn remove(&self, name: &str) -> Result<Arc<Tenant>, LbError> {
        let (_, tenant) = self
            .tenants
            .remove(name)
            .ok_or_else(|| LbError::NotFound(format!("Tenant '{name}'")))?;

        for realm in &tenant.realms {
            self.realms.remove_if(realm, |_, owner| owner == name);
        }

        info!(target: "lb.tenants", tenant = %name, "Tenant removed");
        Ok(tenant)
    }

    /// Resolve a request host to its tenant by exact realm match.
    pub fn resolve(&self, host: &str) -> Result<Arc<Tenant>, LbError> {
        let name = self
            .realms
            .get(host)
            .map(|owner| owner.value().clone())
            .ok_or_else(|| LbError::NotFound(format!("No tenant for realm '{host}'")))?;

        self.get(&name)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Tenant>, LbError> {
        self.tenants
            .get(name)
            .map(|t| t.value().clone())
            .ok_or_else(|| LbError::NotFound(format!("Tenant '{name}'")))
    }

    /// All tenants, ordered by name.
    pub fn list(&self) -> Vec<Arc<Tenant>> {
        let mut tenants: Vec<_> = self.tenants.iter().map(|t| t.value().clone()).collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        tenants
    }

    /// Verify a BBB checksum for `tenant`.
    ///
    /// `signed_query` is the raw query string with the checksum removed. The
    /// checksum is accepted if it matches either that raw string or the
    /// canonical (sorted, re-encoded) form of the same parameters. Never
    /// errors; a missing checksum is a mismatch.
    pub fn verify_checksum(
        &self,
        tenant: &Tenant,
        call: &str,
        signed_query: &str,
        supplied: Option<&str>,
    ) -> bool {
        let Some(supplied) = supplied else {
            debug!(target: "lb.tenants", tenant = %tenant.name, call, "Request without checksum");
            return false;
        };

        if checksum::verify(call, signed_query, &tenant.secret, supplied) {
            return true;
        }

        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(signed_query.as_bytes())
            .into_owned()
            .collect();
        let canonical = checksum::canonical_query(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        canonical != signed_query && checksum::verify(call, &canonical, &tenant.secret, supplied)
    }

    /// Append a rule. An existing rule with the same parameter and operator is
    /// replaced, and the new rule takes the latest definition position.
    pub fn add_override_rule(&self, name: &str, rule: OverrideRule) -> Result<Arc<Tenant>, LbError> {
        self.modify(name, |tenant| {
            tenant
                .overrides
                .retain(|r| !(r.parameter == rule.parameter && r.op == rule.op));
            info!(target: "lb.tenants", tenant = %tenant.name, rule = %rule, "Override rule set");
            tenant.overrides.push(rule);
        })
    }

    /// Remove the rules for `parameter`, either for one operator or all of them.
    /// Returns how many rules were removed.
    pub fn remove_override_rule(
        &self,
        name: &str,
        parameter: &str,
        op: Option<OverrideOp>,
    ) -> Result<usize, LbError> {
        let mut removed = 0;
        self.modify(name, |tenant| {
            let before = tenant.overrides.len();
            tenant
                .overrides
                .retain(|r| !(r.parameter == parameter && op.map_or(true, |op| r.op == op)));
            removed = before - tenant.overrides.len();
        })?;

        info!(target: "lb.tenants", tenant = %name, parameter, removed, "Override rules removed");
        Ok(removed)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<Arc<Tenant>, LbError> {
        self.modify(name, |tenant| tenant.enabled = enabled)
    }

    /// Copy-on-write update of a single tenant, holding only its shard lock.
    fn modify<F>(&self, name: &str, f: F) -> Result<Arc<Tenant>, LbError>
    where
        F: FnOnce(&mut Tenant),
    {
        let mut entry = self
            .tenants
            .get_mut(name)
            .ok_or_else(|| LbError::NotFound(format!("Tenant '{name}'")))?;
        f(Arc::make_mut(entry.value_mut()));
        Ok(entry.value().clone())
    }
}
