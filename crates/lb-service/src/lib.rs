//! BBB-compatible cluster load balancer.
//!
//! Sits in front of a pool of conferencing backends and speaks their API to
//! tenant front-ends:
//!
//! - Tenant resolution by request host and per-tenant checksum auth
//! - Least-loaded server selection with in-flight reservations
//! - Meeting-to-server affinity for repeated `create` calls
//! - Periodic health and load polling of every enabled backend
//! - Recording archive ingestion from backends
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> services/*.rs -> registry/*.rs
//!                                                 -> repositories/*.rs
//! tasks/*.rs (poller, cleanup) -> registry/*.rs, repositories/*.rs
//! ```
//!
//! The registries are the live state; the store persists it so a restart
//! picks up where the previous process left off.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod registry;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod tasks;
