//! Test server harness for E2E testing
//!
//! Provides `TestLbServer` for spawning real load balancer instances in tests.

use crate::fixtures::{backend_url, server_secret};
use common::secret::SecretString;
use lb_service::config::Config;
use lb_service::registry::ServerEntry;
use lb_service::repositories::MemoryStore;
use lb_service::routes::{self, AppState};
use lb_service::services::{ClusterAdmin, MockBackendClient, NewServer, NewTenant};
use lb_service::tasks::PollReport;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Poll attempts before `add_healthy_server` gives up.
const HEALTHY_POLL_ATTEMPTS: usize = 50;

/// Test harness for spawning the load balancer in E2E tests.
///
/// State lives in a [`MemoryStore`], backends are a [`MockBackendClient`]
/// and recordings go to a temporary directory removed on drop.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_flow_e2e() -> Result<()> {
///     let server = TestLbServer::spawn().await?;
///     let client = reqwest::Client::new();
///
///     let response = client
///         .get(&format!("{}/health", server.url()))
///         .send()
///         .await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestLbServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    backend: Arc<MockBackendClient>,
    store: Arc<MemoryStore>,
    shutdown: CancellationToken,
    recordings: TempDir,
    handle: JoinHandle<()>,
}

impl TestLbServer {
    /// Spawn a server whose backends accept every create.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(MockBackendClient::accepting()).await
    }

    /// Spawn a server talking to `backend`.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Poll backends once a minute (tests drive polls explicitly)
    /// - Start the HTTP server in the background
    pub async fn spawn_with(backend: MockBackendClient) -> Result<Self, anyhow::Error> {
        let recordings = tempfile::tempdir()
            .map_err(|e| anyhow::anyhow!("Failed to create recordings directory: {}", e))?;

        let vars = HashMap::from([
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("LB_DOMAIN".to_string(), "lb.test".to_string()),
            ("LB_POLL_INTERVAL_SECONDS".to_string(), "60".to_string()),
            ("LB_POLL_TIMEOUT_SECONDS".to_string(), "5".to_string()),
            (
                "LB_RECORDINGS_DIR".to_string(),
                recordings.path().display().to_string(),
            ),
        ]);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let backend = Arc::new(backend);
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState::new(
            config,
            store.clone(),
            backend.clone(),
            shutdown.clone(),
        ));

        // A recorder that is never installed globally, so tests do not race
        // on the process-wide recorder.
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        // Build routes using the service's real route builder
        let app = routes::build_routes(state.clone(), metrics_handle);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            state,
            backend,
            store,
            shutdown,
            recordings,
            handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn admin(&self) -> &Arc<ClusterAdmin> {
        &self.state.admin
    }

    /// The mock every backend call goes to.
    pub fn backend(&self) -> &Arc<MockBackendClient> {
        &self.backend
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Directory uploaded archives are written to.
    pub fn recordings_dir(&self) -> &Path {
        self.recordings.path()
    }

    /// Register tenant `name` serving `realm`.
    pub async fn add_tenant(&self, name: &str, realm: &str, secret: &str) -> Result<(), anyhow::Error> {
        self.state
            .admin
            .create_tenant(NewTenant {
                name: name.to_string(),
                display_name: None,
                secret: Some(SecretString::from(secret)),
                realms: vec![realm.to_string()],
            })
            .await?;
        Ok(())
    }

    /// Register backend `server_id` and poll it until it is healthy.
    ///
    /// Load reported for the server must be set on [`Self::backend`] first
    /// to be part of the poll.
    pub async fn add_healthy_server(&self, server_id: &str) -> Result<Arc<ServerEntry>, anyhow::Error> {
        let entry = self
            .state
            .admin
            .create_server(NewServer {
                server_id: server_id.to_string(),
                base_url: backend_url(server_id),
                secret: SecretString::from(server_secret(server_id)),
                enabled: true,
                poll_interval: None,
            })
            .await?;
        self.poll(server_id).await?;
        if !entry.is_candidate() {
            anyhow::bail!("Server '{server_id}' is not healthy after its first poll");
        }
        Ok(entry)
    }

    /// Run one poll of `server_id` to completion.
    ///
    /// Retries while the background poll task holds the server.
    pub async fn poll(&self, server_id: &str) -> Result<PollReport, anyhow::Error> {
        let entry = self.state.servers.get(server_id)?;
        let poller = self.state.supervisor.poller();
        for _ in 0..HEALTHY_POLL_ATTEMPTS {
            match poller.poll_once(&entry).await {
                PollReport::Skipped => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
                report => return Ok(report),
            }
        }
        anyhow::bail!("Server '{server_id}' stayed busy for {HEALTHY_POLL_ATTEMPTS} poll attempts")
    }
}

impl Drop for TestLbServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}
