//! HTTP routes for the load balancer.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::registry::{MeetingRegistry, ServerRegistry, TenantRegistry};
use crate::repositories::ClusterStore;
use crate::services::{BackendClient, ClusterAdmin, MeetingService, RecordingHandoff, RecordingImporter};
use crate::tasks::{HealthPoller, PollSettings, PollSupervisor};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Persistent store (PostgreSQL or in-memory).
    pub store: Arc<dyn ClusterStore>,

    pub tenants: Arc<TenantRegistry>,
    pub servers: Arc<ServerRegistry>,
    pub meetings: Arc<MeetingRegistry>,

    /// One poll task per enabled server.
    pub supervisor: Arc<PollSupervisor>,

    /// Routed `create` calls.
    pub meeting_service: Arc<MeetingService>,

    /// Recording archive ingestion.
    pub importer: Arc<RecordingImporter>,

    /// Tenant and server administration.
    pub admin: Arc<ClusterAdmin>,
}

impl AppState {
    /// Wire registries, services and the poll supervisor together.
    ///
    /// Poll tasks are children of `shutdown`. Nothing is loaded or started
    /// here; see [`ClusterAdmin::load_state`].
    pub fn new(
        config: Config,
        store: Arc<dyn ClusterStore>,
        backend: Arc<dyn BackendClient>,
        shutdown: CancellationToken,
    ) -> Self {
        let tenants = Arc::new(TenantRegistry::new());
        let servers = Arc::new(ServerRegistry::new());
        let meetings = Arc::new(MeetingRegistry::new());

        let poller = Arc::new(HealthPoller::new(
            servers.clone(),
            meetings.clone(),
            backend.clone(),
            store.clone(),
            PollSettings {
                timeout: config.poll_timeout,
                fail_threshold: config.poll_fail_threshold,
            },
        ));
        let supervisor = Arc::new(PollSupervisor::new(poller, shutdown));

        let meeting_service = Arc::new(MeetingService::new(
            tenants.clone(),
            servers.clone(),
            meetings.clone(),
            backend,
            store.clone(),
            config.domain.clone(),
        ));
        let importer = Arc::new(RecordingImporter::new(
            RecordingHandoff::new(servers.clone()),
            meetings.clone(),
            store.clone(),
            config.recordings_dir.clone(),
            config.max_upload_bytes,
        ));
        let admin = Arc::new(ClusterAdmin::new(
            tenants.clone(),
            servers.clone(),
            meetings.clone(),
            store.clone(),
            supervisor.clone(),
            config.poll_interval,
        ));

        Self {
            config,
            store,
            tenants,
            servers,
            meetings,
            supervisor,
            meeting_service,
            importer,
            admin,
        }
    }
}

/// Build the application routes.
///
/// - `/health`, `/ready` - Liveness and readiness probes
/// - `/metrics` - Prometheus metrics endpoint
/// - `/bigbluebutton/api` and `/bigbluebutton/api/` - API index
/// - `/bigbluebutton/api/create` - Routed meeting creation (GET and POST),
///   bodies capped at `max_create_body_bytes`
/// - `/bbblb/api/v1/recordings/upload` - Recording ingestion, exempt from
///   the request timeout
/// - TraceLayer for request logging
/// - HTTP metrics middleware, outermost
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let request_timeout = state.config.request_timeout;

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/bigbluebutton/api", get(handlers::api_index))
        .route("/bigbluebutton/api/", get(handlers::api_index))
        .route(
            "/bigbluebutton/api/create",
            get(handlers::create_meeting)
                .post(handlers::create_meeting)
                .layer(DefaultBodyLimit::max(state.config.max_create_body_bytes)),
        )
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Archives can take longer than any sensible request timeout.
    let upload_routes = Router::new()
        .route("/bbblb/api/v1/recordings/upload", post(handlers::upload_recording))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - API and metrics routes only (innermost)
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    api_routes
        .merge(metrics_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .merge(upload_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
}
