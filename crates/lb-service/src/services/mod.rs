//! Service layer for the load balancer.
//!
//! # Components
//!
//! - `backend_client` - Signed HTTP client for backend `getMeetings` and `create`
//! - `cluster_admin` - Tenant and server administration, state export/import
//! - `load_balancer` - Least-loaded server selection with in-flight reservations
//! - `meeting_service` - Routed `create` calls and meeting-to-server affinity
//! - `override_engine` - Per-tenant rewrites of `create` parameters
//! - `recording_handoff` - Upload token issue and verification
//! - `recording_import` - Ingestion of uploaded recording archives
//! - `recording_upload` - Backend-side upload client with retries

pub mod backend_client;
pub mod cluster_admin;
pub mod load_balancer;
pub mod meeting_service;
pub mod override_engine;
pub mod recording_handoff;
pub mod recording_import;
pub mod recording_upload;

pub use backend_client::{BackendClient, HttpBackendClient};
pub use cluster_admin::{ClusterAdmin, ImportReport, NewServer, NewTenant};
pub use load_balancer::LoadBalancer;
pub use meeting_service::{CreateOutcome, CreateRequest, MeetingService};
pub use recording_handoff::RecordingHandoff;
pub use recording_import::RecordingImporter;
pub use recording_upload::{RecordingUploader, UploadError};
// Scriptable backend for unit and integration tests
#[allow(unused_imports)]
pub use backend_client::mock::MockBackendClient;
