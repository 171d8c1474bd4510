//! BBB cluster load balancer
//!
//! Entry point of the load balancer service. Loads cluster state, starts
//! the backend pollers and the meeting cleanup task, and serves the API.

use lb_service::config::Config;
use lb_service::models::ClusterState;
use lb_service::observability::metrics;
use lb_service::repositories::{ClusterStore, MemoryStore, PgClusterStore};
use lb_service::routes::{self, AppState};
use lb_service::services::HttpBackendClient;
use lb_service::tasks::meeting_cleanup::DEFAULT_CLEANUP_INTERVAL_SECONDS;
use lb_service::tasks::{start_meeting_cleanup, MeetingCleanupConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (LOG_FORMAT=json for structured output)
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lb_service=info,tower_http=info".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting BBB load balancer");

    // Must happen before any metric is recorded
    let metrics_handle = metrics::init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        e
    })?;

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        domain = %config.domain,
        poll_interval_seconds = config.poll_interval.as_secs(),
        poll_timeout_seconds = config.poll_timeout.as_secs(),
        backend_checksum = config.backend_checksum.as_str(),
        "Configuration loaded successfully"
    );

    let store: Arc<dyn ClusterStore> = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(20)
                .min_connections(2)
                .acquire_timeout(Duration::from_secs(5))
                .idle_timeout(Duration::from_secs(600))
                .max_lifetime(Duration::from_secs(1800))
                .connect(&add_query_timeout(database_url, 5))
                .await
                .map_err(|e| {
                    error!("Failed to connect to database: {}", e);
                    e
                })?;

            sqlx::migrate!("../../migrations").run(&db_pool).await.map_err(|e| {
                error!("Failed to apply migrations: {}", e);
                e
            })?;

            info!("Database connection established");
            Arc::new(PgClusterStore::new(db_pool))
        }
        None => {
            warn!("DATABASE_URL not set, cluster state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let backend = Arc::new(HttpBackendClient::new(config.backend_checksum, config.request_timeout)?);
    let shutdown = CancellationToken::new();

    let bind_address = config.bind_address.clone();
    let state_file = config.state_file.clone();
    let cleanup_config = MeetingCleanupConfig {
        interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECONDS),
        grace: config.meeting_grace,
        retention: config.meeting_retention,
    };

    let state = Arc::new(AppState::new(config, store, backend, shutdown.clone()));

    state.admin.load_state().await.map_err(|e| {
        error!("Failed to load cluster state: {}", e);
        e
    })?;

    if let Some(path) = state_file {
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            error!("Failed to read state file {}: {}", path.display(), e);
            e
        })?;
        let cluster_state: ClusterState = serde_json::from_str(&contents).map_err(|e| {
            error!("Invalid state file {}: {}", path.display(), e);
            e
        })?;
        let report = state.admin.import_state(cluster_state, false).await?;
        info!(
            path = %path.display(),
            tenants = report.tenants,
            servers = report.servers,
            "State file imported"
        );
    }

    metrics::set_open_meetings(state.meetings.open_count());
    let cleanup_handle = tokio::spawn(start_meeting_cleanup(
        state.meetings.clone(),
        state.store.clone(),
        cleanup_config,
        shutdown.child_token(),
    ));

    let app = routes::build_routes(state.clone(), metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Load balancer listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    state.supervisor.shutdown();
    if let Err(e) = cleanup_handle.await {
        warn!("Meeting cleanup task did not exit cleanly: {}", e);
    }

    info!("Load balancer shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
///
/// Cancels `shutdown` as soon as a signal arrives so pollers stop, then
/// returns once the drain period is complete.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    shutdown.cancel();

    let drain_secs: u64 = std::env::var("LB_DRAIN_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    if drain_secs > 0 {
        warn!("Draining connections for {} seconds...", drain_secs);
        tokio::time::sleep(Duration::from_secs(drain_secs)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (LB_DRAIN_SECONDS=0)");
    }
}

/// Adds statement_timeout to the database URL.
fn add_query_timeout(url: &str, timeout_secs: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}options=-c%20statement_timeout%3D{timeout_secs}s")
}
