//! Background tasks.
//!
//! - `health_poller` - Per-server health and load polling, and the supervisor
//!   that starts and stops the poll tasks
//! - `meeting_cleanup` - Ends stale meetings and evicts closed ones

pub mod health_poller;
pub mod meeting_cleanup;

pub use health_poller::{HealthPoller, PollReport, PollSettings, PollSupervisor};
pub use meeting_cleanup::{start_meeting_cleanup, MeetingCleanupConfig};
