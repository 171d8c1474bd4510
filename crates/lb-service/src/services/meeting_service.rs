//! Routed meeting creation.
//!
//! A `create` call is authenticated against the tenant resolved from the
//! request host, rewritten by the tenant's override rules and forwarded to
//! one backend. Repeated creates for an open meeting go to the server that
//! already hosts it; new meetings go to the server picked by the
//! [`LoadBalancer`].
//!
//! The backend sees a scoped meeting id (`{external}*{tenant}`) plus
//! `meta_bbblb-*` tags. The scoped id is rewritten back to the tenant's id
//! in the returned document.

use bytes::Bytes;
use chrono::Utc;
use common::checksum::split_checksum;
use common::types::MeetingUuid;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::errors::LbError;
use crate::models::{scoped_meeting_id, Meeting, MeetingLoad, MeetingState, Params, Tenant};
use crate::observability::metrics;
use crate::registry::meetings::{MeetingRegistry, OpenMeeting};
use crate::registry::servers::ServerRegistry;
use crate::registry::tenants::TenantRegistry;
use crate::repositories::ClusterStore;
use crate::services::backend_client::{rewrite_meeting_id, BackendClient};
use crate::services::load_balancer::LoadBalancer;
use crate::services::override_engine;

/// An inbound `create` call.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Value of the `Host` header.
    pub host: String,
    /// Raw query string, checksum included.
    pub query: String,
    /// Optional pre-upload document, forwarded as is.
    pub body: Option<Bytes>,
}

/// What the backend answered, ready to hand back to the caller.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub status: u16,
    pub body: String,
    /// The recorded meeting. `None` when the backend refused the create.
    pub meeting: Option<Meeting>,
    /// The call went to the server of an already open meeting.
    pub reused: bool,
}

/// Abandons a pending meeting unless disarmed, including when the request
/// future is dropped mid-call.
struct PendingMeeting<'a> {
    meetings: &'a MeetingRegistry,
    uuid: Option<MeetingUuid>,
}

impl<'a> PendingMeeting<'a> {
    fn new(meetings: &'a MeetingRegistry, uuid: MeetingUuid) -> Self {
        Self {
            meetings,
            uuid: Some(uuid),
        }
    }

    fn disarm(mut self) {
        self.uuid = None;
    }
}

impl Drop for PendingMeeting<'_> {
    fn drop(&mut self) {
        if let Some(uuid) = self.uuid.take() {
            self.meetings.abandon(uuid);
        }
    }
}

pub struct MeetingService {
    tenants: Arc<TenantRegistry>,
    servers: Arc<ServerRegistry>,
    meetings: Arc<MeetingRegistry>,
    balancer: LoadBalancer,
    backend: Arc<dyn BackendClient>,
    store: Arc<dyn ClusterStore>,
    domain: String,
}

impl MeetingService {
    pub fn new(
        tenants: Arc<TenantRegistry>,
        servers: Arc<ServerRegistry>,
        meetings: Arc<MeetingRegistry>,
        backend: Arc<dyn BackendClient>,
        store: Arc<dyn ClusterStore>,
        domain: String,
    ) -> Self {
        Self {
            balancer: LoadBalancer::new(servers.clone()),
            tenants,
            servers,
            meetings,
            backend,
            store,
            domain,
        }
    }

    /// Resolve the tenant for `host`, trying the bare host name if the
    /// exact value is not a known realm.
    pub fn resolve_tenant(&self, host: &str) -> Result<Arc<Tenant>, LbError> {
        match self.tenants.resolve(host) {
            Ok(tenant) => Ok(tenant),
            Err(e) => match strip_port(host) {
                Some(bare) => self.tenants.resolve(bare),
                None => Err(e),
            },
        }
    }

    /// Authenticate an API call and return its tenant and parameters.
    ///
    /// The returned parameters exclude the checksum.
    pub fn authenticate(
        &self,
        host: &str,
        call: &str,
        raw_query: &str,
    ) -> Result<(Arc<Tenant>, Params), LbError> {
        let tenant = self.resolve_tenant(host)?;
        if !tenant.enabled {
            warn!(target: "lb.tenants", tenant = %tenant.name, call, "Request for disabled tenant");
            return Err(LbError::Auth(format!("Tenant '{}' is disabled", tenant.name)));
        }

        let (signed, supplied) = split_checksum(raw_query);
        if !self
            .tenants
            .verify_checksum(&tenant, call, &signed, supplied.as_deref())
        {
            metrics::record_checksum_failure();
            warn!(target: "lb.tenants", tenant = %tenant.name, call, "Checksum mismatch");
            return Err(LbError::Auth("Checksums do not match".to_string()));
        }

        let params: Params = url::form_urlencoded::parse(signed.as_bytes())
            .into_owned()
            .collect();
        Ok((tenant, params))
    }

    /// Handle one `create` call end to end.
    #[instrument(skip_all, fields(host = %request.host))]
    pub async fn create(&self, request: CreateRequest) -> Result<CreateOutcome, LbError> {
        let (tenant, params) = self.authenticate(&request.host, "create", &request.query)?;

        let external_id = params
            .get("meetingID")
            .filter(|id| !id.is_empty())
            .cloned()
            .ok_or_else(|| LbError::Validation("Missing parameter 'meetingID'".to_string()))?;
        let mut params = override_engine::apply(&tenant.overrides, &params)?;

        let mut reservation = None;
        let claimed = self
            .meetings
            .find_or_insert_pending(&tenant.name, &external_id, || {
                let selected = self.balancer.select(&tenant)?;
                let meeting = Meeting {
                    uuid: MeetingUuid::new(),
                    external_id: external_id.clone(),
                    tenant: tenant.name.clone(),
                    server_id: selected.server().server_id.clone(),
                    backend_meeting_id: scoped_meeting_id(&external_id, &tenant.name),
                    internal_meeting_id: None,
                    state: MeetingState::Created,
                    created_at: Utc::now(),
                    ended_at: None,
                    load: MeetingLoad::default(),
                };
                reservation = Some(selected);
                Ok(meeting)
            });
        let claimed = claimed.inspect_err(|e| {
            let status = match e {
                LbError::NoServerAvailable => "no_server",
                _ => "error",
            };
            metrics::record_meeting_created(status);
        })?;

        let (meeting, pending, reused) = match claimed {
            OpenMeeting::Existing(meeting) => (meeting, None, true),
            OpenMeeting::Pending(meeting) => {
                let guard = PendingMeeting::new(&self.meetings, meeting.uuid);
                (meeting, Some(guard), false)
            }
        };

        let server = match &reservation {
            Some(reservation) => reservation.server().clone(),
            None => self.servers.get(&meeting.server_id).map_err(|_| {
                warn!(
                    target: "lb.meetings",
                    meeting_uuid = %meeting.uuid,
                    server_id = %meeting.server_id,
                    "Open meeting refers to an unknown server"
                );
                metrics::record_meeting_created("no_server");
                LbError::NoServerAvailable
            })?,
        };

        params.insert("meetingID".to_string(), meeting.backend_meeting_id.clone());
        params.insert("meta_bbblb-uuid".to_string(), meeting.uuid.to_string());
        params.insert("meta_bbblb-origin".to_string(), self.domain.clone());
        params.insert("meta_bbblb-tenant".to_string(), tenant.name.clone());
        params.insert("meta_bbblb-server".to_string(), server.server_id.clone());

        let start = Instant::now();
        let response = match self.backend.create(&server, &params, request.body).await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_backend_create("error", start.elapsed());
                metrics::record_meeting_created("error");
                warn!(
                    target: "lb.meetings",
                    tenant = %tenant.name,
                    server_id = %server.server_id,
                    error = %e,
                    "Create call failed"
                );
                return Err(e);
            }
        };

        if !response.success {
            metrics::record_backend_create("failed", start.elapsed());
            metrics::record_meeting_created("backend_failed");
            info!(
                target: "lb.meetings",
                tenant = %tenant.name,
                server_id = %server.server_id,
                message_key = response.message_key.as_deref().unwrap_or(""),
                "Backend refused create"
            );
            return Ok(CreateOutcome {
                status: response.status,
                body: response.body,
                meeting: None,
                reused,
            });
        }
        metrics::record_backend_create("success", start.elapsed());

        if let Some(pending) = pending {
            pending.disarm();
        }
        let confirmed = self
            .meetings
            .confirm(&meeting, response.internal_meeting_id.as_deref());
        if let Some(reservation) = reservation {
            reservation.commit();
        }

        if let Err(e) = self.store.save_meeting(&confirmed).await {
            error!(
                target: "lb.meetings",
                meeting_uuid = %confirmed.uuid,
                error = %e,
                "Failed to persist meeting"
            );
        }

        let body = rewrite_meeting_id(&response.body, &confirmed.backend_meeting_id, &confirmed.external_id)
            .unwrap_or_else(|e| {
                warn!(target: "lb.meetings", error = %e, "Could not rewrite meeting id in response");
                response.body.clone()
            });

        metrics::record_meeting_created(if reused { "reused" } else { "created" });
        info!(
            target: "lb.meetings",
            tenant = %tenant.name,
            meeting_uuid = %confirmed.uuid,
            server_id = %confirmed.server_id,
            reused,
            "Meeting created"
        );

        Ok(CreateOutcome {
            status: response.status,
            body,
            meeting: Some(confirmed),
            reused,
        })
    }
}

/// `host` without a trailing `:port`, if it has one.
fn strip_port(host: &str) -> Option<&str> {
    let (bare, port) = host.rsplit_once(':')?;
    let numeric = !port.is_empty() && port.chars().all(|c| c.is_ascii_digit());
    let ipv6_without_port = bare.contains(':') && !bare.ends_with(']');
    (numeric && !bare.is_empty() && !ipv6_without_port).then_some(bare)
}
