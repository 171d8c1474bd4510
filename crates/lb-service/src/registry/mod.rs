//! In-memory registries shared between request handlers and background tasks.
//!
//! Each registry is a sharded `DashMap` keyed by entity id. Per-entity state
//! sits behind its own `parking_lot::Mutex` or atomics; no registry-wide lock
//! exists and none of these locks is held across an `.await`.

pub mod meetings;
pub mod servers;
pub mod tenants;

pub use meetings::{CleanupReport, MeetingRegistry, OpenMeeting};
pub use servers::{HealthTransition, PollOutcome, ServerEntry, ServerRegistry, ServerSpec};
pub use tenants::TenantRegistry;
