//! HTTP request handlers for the load balancer.

pub mod bbb_api;
pub mod health;
pub mod metrics;
pub mod recordings;

pub use bbb_api::{api_index, create_meeting};
pub use health::{health_check, readiness_check};
pub use metrics::metrics_handler;
pub use recordings::upload_recording;
