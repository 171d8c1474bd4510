//! Tenants repository.
//!
//! A tenant is stored across three tables: `tenants`, `tenant_realms` and
//! `tenant_overrides` (ordered by `position`). Writes replace the realm and
//! override sets inside one transaction.

use common::secret::{ExposeSecret, SecretString};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{instrument, warn};

use super::observe;
use crate::errors::LbError;
use crate::models::{OverrideOp, OverrideRule, Tenant};

#[derive(Debug, FromRow)]
struct TenantRow {
    name: String,
    display_name: String,
    secret: String,
    enabled: bool,
}

#[derive(Debug, FromRow)]
struct RealmRow {
    realm: String,
    tenant: String,
}

#[derive(Debug, FromRow)]
struct OverrideRow {
    tenant: String,
    parameter: String,
    operator: String,
    value: String,
}

pub struct TenantsRepository;

impl TenantsRepository {
    /// Load every tenant with its realms and override rules.
    #[instrument(skip_all)]
    pub async fn list(pool: &PgPool) -> Result<Vec<Tenant>, LbError> {
        let start = Instant::now();
        let result = async {
            let tenants: Vec<TenantRow> = sqlx::query_as(
                "SELECT name, display_name, secret, enabled FROM tenants ORDER BY name",
            )
            .fetch_all(pool)
            .await?;
            let realms: Vec<RealmRow> =
                sqlx::query_as("SELECT realm, tenant FROM tenant_realms ORDER BY realm")
                    .fetch_all(pool)
                    .await?;
            let overrides: Vec<OverrideRow> = sqlx::query_as(
                "SELECT tenant, parameter, operator, value FROM tenant_overrides \
                 ORDER BY tenant, position",
            )
            .fetch_all(pool)
            .await?;
            Ok::<_, sqlx::Error>((tenants, realms, overrides))
        }
        .await;
        let (tenants, realms, overrides) = observe("list_tenants", start, result)?;

        let mut realms_by_tenant: HashMap<String, Vec<String>> = HashMap::new();
        for row in realms {
            realms_by_tenant.entry(row.tenant).or_default().push(row.realm);
        }

        let mut rules_by_tenant: HashMap<String, Vec<OverrideRule>> = HashMap::new();
        for row in overrides {
            let rule = OverrideOp::from_db_str(&row.operator)
                .ok_or_else(|| LbError::Validation(format!("Unknown operator '{}'", row.operator)))
                .and_then(|op| OverrideRule::new(&row.parameter, op, &row.value));
            match rule {
                Ok(rule) => rules_by_tenant.entry(row.tenant).or_default().push(rule),
                Err(e) => warn!(
                    target: "lb.store",
                    tenant = %row.tenant,
                    parameter = %row.parameter,
                    error = %e,
                    "Skipping unreadable override rule"
                ),
            }
        }

        Ok(tenants
            .into_iter()
            .map(|row| Tenant {
                realms: realms_by_tenant.remove(&row.name).unwrap_or_default(),
                overrides: rules_by_tenant.remove(&row.name).unwrap_or_default(),
                secret: SecretString::from(row.secret),
                display_name: row.display_name,
                enabled: row.enabled,
                name: row.name,
            })
            .collect())
    }

    /// Insert or replace a tenant, its realms and its rules.
    #[instrument(skip_all, fields(tenant = %tenant.name))]
    pub async fn upsert(pool: &PgPool, tenant: &Tenant) -> Result<(), LbError> {
        let start = Instant::now();
        let result = async {
            let mut tx = pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO tenants (name, display_name, secret, enabled)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (name) DO UPDATE SET
                    display_name = EXCLUDED.display_name,
                    secret = EXCLUDED.secret,
                    enabled = EXCLUDED.enabled,
                    updated_at = NOW()
                "#,
            )
            .bind(&tenant.name)
            .bind(&tenant.display_name)
            .bind(tenant.secret.expose_secret())
            .bind(tenant.enabled)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM tenant_realms WHERE tenant = $1")
                .bind(&tenant.name)
                .execute(&mut *tx)
                .await?;
            for realm in &tenant.realms {
                sqlx::query("INSERT INTO tenant_realms (realm, tenant) VALUES ($1, $2)")
                    .bind(realm)
                    .bind(&tenant.name)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("DELETE FROM tenant_overrides WHERE tenant = $1")
                .bind(&tenant.name)
                .execute(&mut *tx)
                .await?;
            for (position, rule) in tenant.overrides.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO tenant_overrides (tenant, position, parameter, operator, value) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&tenant.name)
                .bind(i32::try_from(position).unwrap_or(i32::MAX))
                .bind(&rule.parameter)
                .bind(rule.op.as_db_str())
                .bind(&rule.value)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await
        }
        .await;
        observe("upsert_tenant", start, result)
    }

    /// Delete a tenant. Realms, rules and meetings cascade.
    #[instrument(skip_all, fields(tenant = %name))]
    pub async fn delete(pool: &PgPool, name: &str) -> Result<bool, LbError> {
        let start = Instant::now();
        let result = sqlx::query("DELETE FROM tenants WHERE name = $1")
            .bind(name)
            .execute(pool)
            .await;
        Ok(observe("delete_tenant", start, result)?.rows_affected() > 0)
    }
}
