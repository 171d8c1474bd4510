//! Servers repository.
//!
//! Stores the administrative view of a backend server. Health, load and
//! reservations are runtime-only.

use common::secret::{ExposeSecret, SecretString};
use sqlx::{FromRow, PgPool};
use std::time::{Duration, Instant};
use tracing::instrument;

use super::observe;
use crate::errors::LbError;
use crate::registry::servers::ServerSpec;

#[derive(Debug, FromRow)]
struct ServerRow {
    server_id: String,
    base_url: String,
    secret: String,
    enabled: bool,
    poll_interval_seconds: i32,
}

impl From<ServerRow> for ServerSpec {
    fn from(row: ServerRow) -> Self {
        ServerSpec {
            server_id: row.server_id,
            base_url: row.base_url,
            secret: SecretString::from(row.secret),
            poll_interval: Duration::from_secs(u64::try_from(row.poll_interval_seconds.max(1)).unwrap_or(1)),
            enabled: row.enabled,
        }
    }
}

pub struct ServersRepository;

impl ServersRepository {
    #[instrument(skip_all)]
    pub async fn list(pool: &PgPool) -> Result<Vec<ServerSpec>, LbError> {
        let start = Instant::now();
        let result: Result<Vec<ServerRow>, sqlx::Error> = sqlx::query_as(
            "SELECT server_id, base_url, secret, enabled, poll_interval_seconds \
             FROM servers ORDER BY server_id",
        )
        .fetch_all(pool)
        .await;
        Ok(observe("list_servers", start, result)?
            .into_iter()
            .map(ServerSpec::from)
            .collect())
    }

    /// Insert or update a server. A secret already used by another server
    /// violates the unique constraint and fails with `Configuration`.
    #[instrument(skip_all, fields(server_id = %server.server_id))]
    pub async fn upsert(pool: &PgPool, server: &ServerSpec) -> Result<(), LbError> {
        let start = Instant::now();
        let interval = i32::try_from(server.poll_interval.as_secs()).unwrap_or(i32::MAX);
        let result = sqlx::query(
            r#"
            INSERT INTO servers (server_id, base_url, secret, enabled, poll_interval_seconds)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (server_id) DO UPDATE SET
                base_url = EXCLUDED.base_url,
                secret = EXCLUDED.secret,
                enabled = EXCLUDED.enabled,
                poll_interval_seconds = EXCLUDED.poll_interval_seconds,
                updated_at = NOW()
            "#,
        )
        .bind(&server.server_id)
        .bind(&server.base_url)
        .bind(server.secret.expose_secret())
        .bind(server.enabled)
        .bind(interval)
        .execute(pool)
        .await;

        match result {
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                crate::observability::metrics::record_db_query("upsert_server", "error", start.elapsed());
                Err(LbError::Configuration(
                    "Another server already uses this secret".to_string(),
                ))
            }
            other => observe("upsert_server", start, other).map(|_| ()),
        }
    }

    #[instrument(skip_all, fields(server_id = %server_id))]
    pub async fn delete(pool: &PgPool, server_id: &str) -> Result<bool, LbError> {
        let start = Instant::now();
        let result = sqlx::query("DELETE FROM servers WHERE server_id = $1")
            .bind(server_id)
            .execute(pool)
            .await;
        Ok(observe("delete_server", start, result)?.rows_affected() > 0)
    }
}
