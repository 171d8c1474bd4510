//! Load balancer models.
//!
//! Domain types shared by the registries, services and handlers.

use chrono::{DateTime, Utc};
use common::secret::{serialize_exposed, SecretString};
use common::types::MeetingUuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::LbError;

/// Create-call parameters, ordered by name.
pub type Params = BTreeMap<String, String>;

// ============================================================================
// Tenants and override rules
// ============================================================================

/// An isolated customer organization.
#[derive(Debug, Clone)]
pub struct Tenant {
    /// Unique slug, also used to scope backend meeting ids.
    pub name: String,
    pub display_name: String,
    pub secret: SecretString,
    /// Host names resolving to this tenant. Unique across all tenants.
    pub realms: Vec<String>,
    /// Rules in definition order.
    pub overrides: Vec<OverrideRule>,
    pub enabled: bool,
}

/// Override operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideOp {
    /// `=`: set unconditionally, an empty value removes the parameter.
    ForceSet,
    /// `?`: set only if absent.
    Fallback,
    /// `<`: clamp a numeric value to at most the rule's value.
    NumericMax,
    /// `+`: add to a comma-separated set.
    ListAppend,
}

impl OverrideOp {
    pub fn symbol(self) -> char {
        match self {
            OverrideOp::ForceSet => '=',
            OverrideOp::Fallback => '?',
            OverrideOp::NumericMax => '<',
            OverrideOp::ListAppend => '+',
        }
    }

    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '=' => Some(OverrideOp::ForceSet),
            '?' => Some(OverrideOp::Fallback),
            '<' => Some(OverrideOp::NumericMax),
            '+' => Some(OverrideOp::ListAppend),
            _ => None,
        }
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            OverrideOp::ForceSet => "force_set",
            OverrideOp::Fallback => "fallback",
            OverrideOp::NumericMax => "numeric_max",
            OverrideOp::ListAppend => "list_append",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "force_set" => Some(OverrideOp::ForceSet),
            "fallback" => Some(OverrideOp::Fallback),
            "numeric_max" => Some(OverrideOp::NumericMax),
            "list_append" => Some(OverrideOp::ListAppend),
            _ => None,
        }
    }
}

/// A per-tenant rewrite of one create parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRule {
    pub parameter: String,
    pub op: OverrideOp,
    pub value: String,
}

impl OverrideRule {
    /// Build a rule, validating the parameter name and numeric-max values.
    pub fn new(parameter: &str, op: OverrideOp, value: &str) -> Result<Self, LbError> {
        let valid_name = !parameter.is_empty()
            && parameter
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(LbError::Validation(format!(
                "Invalid override parameter name: '{parameter}'"
            )));
        }

        if op == OverrideOp::NumericMax && value.trim().parse::<i64>().is_err() {
            return Err(LbError::Validation(format!(
                "Override '{parameter}<' needs an integer value, got '{value}'"
            )));
        }

        Ok(Self {
            parameter: parameter.to_string(),
            op,
            value: value.to_string(),
        })
    }
}

/// Parses the `name<op>value` form, e.g. `duration<90` or `record=`.
impl FromStr for OverrideRule {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'));

        let Some((idx, symbol)) = split else {
            return Err(LbError::Validation(format!(
                "Override '{s}' has no operator (expected one of = ? < +)"
            )));
        };
        let op = OverrideOp::from_symbol(symbol)
            .ok_or_else(|| LbError::Validation(format!("Unknown override operator '{symbol}'")))?;

        let parameter = s.get(..idx).unwrap_or_default();
        let value = s.get(idx + symbol.len_utf8()..).unwrap_or_default();
        OverrideRule::new(parameter, op, value)
    }
}

impl fmt::Display for OverrideRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.parameter, self.op.symbol(), self.value)
    }
}

// ============================================================================
// Servers
// ============================================================================

/// Poll-derived health of a backend server.
///
/// Orthogonal to the administrative `enabled` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerHealth {
    /// Freshly created or re-enabled, waiting for the first poll.
    Unknown,
    Healthy,
    Unreachable,
}

impl ServerHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerHealth::Unknown => "unknown",
            ServerHealth::Healthy => "healthy",
            ServerHealth::Unreachable => "unreachable",
        }
    }
}

/// Load reported by the last successful poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub active_meetings: u32,
    pub users: u32,
    pub voice: u32,
    pub video: u32,
}

/// Read-only view of a server for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub base_url: String,
    pub enabled: bool,
    pub health: ServerHealth,
    pub consecutive_failures: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub load: LoadSnapshot,
    pub in_flight: u32,
    pub poll_interval_seconds: u64,
}

/// A meeting as reported by a backend's `getMeetings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMeeting {
    /// The (scoped) `meetingID` the backend knows.
    pub meeting_id: String,
    pub internal_meeting_id: String,
    pub users: u32,
    pub voice: u32,
    pub video: u32,
}

// ============================================================================
// Meetings
// ============================================================================

/// Meeting lifecycle. Variants are ordered; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingState {
    Created,
    Running,
    Ended,
    RecordingPublished,
}

impl MeetingState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MeetingState::Created => "created",
            MeetingState::Running => "running",
            MeetingState::Ended => "ended",
            MeetingState::RecordingPublished => "recording_published",
        }
    }

    /// Unknown values map to `Ended` so a corrupt row never reopens a meeting.
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "created" => MeetingState::Created,
            "running" => MeetingState::Running,
            "recording_published" => MeetingState::RecordingPublished,
            _ => MeetingState::Ended,
        }
    }

    /// Closed meetings no longer count as open for reuse or load.
    pub fn is_open(self) -> bool {
        matches!(self, MeetingState::Created | MeetingState::Running)
    }
}

/// Per-meeting counters from the latest poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingLoad {
    pub users: u32,
    pub voice: u32,
    pub video: u32,
}

/// A meeting routed through the load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meeting {
    pub uuid: MeetingUuid,
    /// Tenant-chosen, reusable BBB `meetingID`.
    pub external_id: String,
    pub tenant: String,
    pub server_id: String,
    /// Scoped id sent to the backend.
    pub backend_meeting_id: String,
    pub internal_meeting_id: Option<String>,
    pub state: MeetingState,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub load: MeetingLoad,
}

impl Meeting {
    /// Advance to `next` if that is a forward move. Returns whether anything changed.
    pub fn advance(&mut self, next: MeetingState, now: DateTime<Utc>) -> bool {
        if next <= self.state {
            return false;
        }
        if !next.is_open() && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
        self.state = next;
        true
    }
}

/// Backend meeting id for a tenant's external id.
pub fn scoped_meeting_id(external_id: &str, tenant: &str) -> String {
    format!("{external_id}*{tenant}")
}

// ============================================================================
// Cluster state export/import
// ============================================================================

/// Serializable snapshot of all tenants and servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub tenants: Vec<TenantState>,
    #[serde(default)]
    pub servers: Vec<ServerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantState {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(serialize_with = "serialize_exposed")]
    pub secret: SecretString,
    #[serde(default)]
    pub realms: Vec<String>,
    /// Rules in `name<op>value` form.
    #[serde(default)]
    pub overrides: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerState {
    pub server_id: String,
    pub base_url: String,
    #[serde(serialize_with = "serialize_exposed")]
    pub secret: SecretString,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// HTTP responses
// ============================================================================

/// Readiness check response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of an accepted recording upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub message: String,
    #[serde(rename = "importId")]
    pub import_id: String,
}
