//! Load balancer configuration.
//!
//! Configuration is loaded from environment variables. The database URL is
//! redacted in Debug output.

use common::checksum::ChecksumAlgorithm;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;

/// Default poll timeout in seconds. Must stay below the interval.
pub const DEFAULT_POLL_TIMEOUT_SECONDS: u64 = 5;

/// Default number of consecutive failed polls before a server is unreachable.
pub const DEFAULT_POLL_FAIL_THRESHOLD: u32 = 5;

/// Default upper bound for uploaded recording archives (5 GiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Default upper bound for `create` request bodies, pre-upload documents
/// included (16 MiB).
pub const DEFAULT_MAX_CREATE_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Default grace period before a never-started meeting is considered stale.
pub const DEFAULT_MEETING_GRACE_SECONDS: u64 = 300;

/// Default time closed meetings stay in memory.
pub const DEFAULT_MEETING_RETENTION_SECONDS: u64 = 3600;

/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Default directory for ingested recordings.
pub const DEFAULT_RECORDINGS_DIR: &str = "/var/lib/bbblb/recordings";

/// Load balancer configuration.
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL connection URL. Without it the service keeps state in memory.
    pub database_url: Option<String>,

    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Public domain of this load balancer, sent as `meta_bbblb-origin`.
    pub domain: String,

    /// Default poll interval for newly created servers.
    pub poll_interval: Duration,

    /// Hard timeout of a single poll. Always shorter than any poll interval.
    pub poll_timeout: Duration,

    /// Consecutive failed polls before a server becomes unreachable.
    pub poll_fail_threshold: u32,

    /// Checksum algorithm for calls to backend servers.
    pub backend_checksum: ChecksumAlgorithm,

    /// Where uploaded recording archives are stored.
    pub recordings_dir: PathBuf,

    /// Maximum accepted recording archive size in bytes.
    pub max_upload_bytes: u64,

    /// Maximum accepted `create` request body in bytes.
    pub max_create_body_bytes: usize,

    /// Meetings still `CREATED` after this long are ended by the cleanup task.
    pub meeting_grace: Duration,

    /// Closed meetings are evicted from memory after this long.
    pub meeting_retention: Duration,

    /// Optional JSON cluster state imported at startup.
    pub state_file: Option<PathBuf>,

    /// Per-request timeout applied to all routes.
    pub request_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("bind_address", &self.bind_address)
            .field("domain", &self.domain)
            .field("poll_interval", &self.poll_interval)
            .field("poll_timeout", &self.poll_timeout)
            .field("poll_fail_threshold", &self.poll_fail_threshold)
            .field("backend_checksum", &self.backend_checksum)
            .field("recordings_dir", &self.recordings_dir)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("max_create_body_bytes", &self.max_create_body_bytes)
            .field("meeting_grace", &self.meeting_grace)
            .field("meeting_retention", &self.meeting_retention)
            .field("state_file", &self.state_file)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid poll configuration: {0}")]
    InvalidPollSettings(String),

    #[error("Invalid failure threshold: {0}")]
    InvalidFailThreshold(String),

    #[error("Invalid checksum algorithm: {0}")]
    InvalidChecksumAlgorithm(String),

    #[error("Invalid size limit: {0}")]
    InvalidSizeLimit(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

/// Parse an optional integer variable, applying `default` when unset and
/// rejecting values outside `min..=max`.
fn parse_bounded<E>(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
    err: E,
) -> Result<u64, ConfigError>
where
    E: Fn(String) -> ConfigError,
{
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = value_str
        .parse()
        .map_err(|e| err(format!("{name} must be a valid positive integer, got '{value_str}': {e}")))?;

    if value < min || value > max {
        return Err(err(format!("{name} must be between {min} and {max}, got {value}")));
    }

    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = vars.get("DATABASE_URL").filter(|v| !v.is_empty()).cloned();

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let domain = vars
            .get("LB_DOMAIN")
            .cloned()
            .unwrap_or_else(|| "localhost".to_string());

        let poll_interval_secs = parse_bounded(
            vars,
            "LB_POLL_INTERVAL_SECONDS",
            DEFAULT_POLL_INTERVAL_SECONDS,
            1,
            3600,
            ConfigError::InvalidPollSettings,
        )?;

        let poll_timeout_secs = parse_bounded(
            vars,
            "LB_POLL_TIMEOUT_SECONDS",
            DEFAULT_POLL_TIMEOUT_SECONDS.min(poll_interval_secs.saturating_sub(1)).max(1),
            1,
            3600,
            ConfigError::InvalidPollSettings,
        )?;

        if poll_timeout_secs >= poll_interval_secs {
            return Err(ConfigError::InvalidPollSettings(format!(
                "LB_POLL_TIMEOUT_SECONDS ({poll_timeout_secs}) must be shorter than \
                 LB_POLL_INTERVAL_SECONDS ({poll_interval_secs})"
            )));
        }

        let poll_fail_threshold = parse_bounded(
            vars,
            "LB_POLL_FAIL_THRESHOLD",
            u64::from(DEFAULT_POLL_FAIL_THRESHOLD),
            1,
            100,
            ConfigError::InvalidFailThreshold,
        )?;
        let poll_fail_threshold = u32::try_from(poll_fail_threshold)
            .map_err(|e| ConfigError::InvalidFailThreshold(e.to_string()))?;

        let backend_checksum = match vars.get("LB_BACKEND_CHECKSUM") {
            Some(value) => value
                .parse()
                .map_err(|e: common::checksum::UnknownAlgorithm| {
                    ConfigError::InvalidChecksumAlgorithm(e.to_string())
                })?,
            None => ChecksumAlgorithm::Sha256,
        };

        let recordings_dir = vars
            .get("LB_RECORDINGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR));

        let max_upload_bytes = parse_bounded(
            vars,
            "LB_MAX_UPLOAD_BYTES",
            DEFAULT_MAX_UPLOAD_BYTES,
            1,
            u64::MAX,
            ConfigError::InvalidSizeLimit,
        )?;

        let max_create_body_bytes = parse_bounded(
            vars,
            "LB_MAX_CREATE_BODY_BYTES",
            DEFAULT_MAX_CREATE_BODY_BYTES,
            1024,
            1024 * 1024 * 1024,
            ConfigError::InvalidSizeLimit,
        )?;
        let max_create_body_bytes = usize::try_from(max_create_body_bytes)
            .map_err(|e| ConfigError::InvalidSizeLimit(e.to_string()))?;

        let meeting_grace_secs = parse_bounded(
            vars,
            "LB_MEETING_GRACE_SECONDS",
            DEFAULT_MEETING_GRACE_SECONDS,
            1,
            86_400,
            ConfigError::InvalidDuration,
        )?;

        let meeting_retention_secs = parse_bounded(
            vars,
            "LB_MEETING_RETENTION_SECONDS",
            DEFAULT_MEETING_RETENTION_SECONDS,
            0,
            30 * 86_400,
            ConfigError::InvalidDuration,
        )?;

        let request_timeout_secs = parse_bounded(
            vars,
            "LB_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
            1,
            3600,
            ConfigError::InvalidDuration,
        )?;

        let state_file = vars
            .get("LB_STATE_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Config {
            database_url,
            bind_address,
            domain,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_timeout: Duration::from_secs(poll_timeout_secs),
            poll_fail_threshold,
            backend_checksum,
            recordings_dir,
            max_upload_bytes,
            max_create_body_bytes,
            meeting_grace: Duration::from_secs(meeting_grace_secs),
            meeting_retention: Duration::from_secs(meeting_retention_secs),
            state_file,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}
