//! # LB Test Utilities
//!
//! Shared test utilities for the load balancer service.
//!
//! This crate provides:
//! - Server test harness (`TestLbServer` for end-to-end tests)
//! - Fixtures for signed BBB queries, tenants, servers and upload tokens
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lb_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestLbServer::spawn().await?;
//!     server.add_tenant("acme", "bbb.acme.test", "acme-secret").await?;
//!     server.add_healthy_server("bbb1").await?;
//!
//!     let query = signed_query("create", &[("meetingID", "daily")], "acme-secret");
//!     let response = reqwest::Client::new()
//!         .get(format!("{}/bigbluebutton/api/create?{query}", server.url()))
//!         .header("Host", "bbb.acme.test")
//!         .send()
//!         .await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::*;
