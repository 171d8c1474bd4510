//! Meeting registry.
//!
//! Tracks routed meetings and the `(tenant, external id) -> meeting` index of
//! open meetings used to send repeated create calls to the same server.
//!
//! A create call first inserts a *pending* meeting while holding the index
//! entry, so concurrent creates for the same external id agree on one server.
//! The pending record is confirmed when the backend accepts the create, or
//! abandoned when it fails. Pending meetings are never ended by a poll.
//!
//! Open meetings are also indexed per server, so a poll of one server only
//! visits that server's meetings.
//!
//! Lock order: index shard, then meeting map shard, then a meeting's mutex.
//! Code holding a meeting's mutex never touches either index.

use chrono::{DateTime, Utc};
use common::types::MeetingUuid;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::LbError;
use crate::models::{BackendMeeting, Meeting, MeetingLoad, MeetingState};

#[derive(Debug)]
struct MeetingSlot {
    meeting: Meeting,
    pending: bool,
}

/// Outcome of [`MeetingRegistry::find_or_insert_pending`].
#[derive(Debug, Clone)]
pub enum OpenMeeting {
    /// An open meeting already exists for this external id.
    Existing(Meeting),
    /// A new pending meeting was inserted.
    Pending(Meeting),
}

/// Result of the stale-meeting sweep.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub ended: Vec<Meeting>,
    pub evicted: usize,
}

type IndexKey = (String, String);

#[derive(Debug, Default)]
pub struct MeetingRegistry {
    meetings: DashMap<MeetingUuid, Arc<Mutex<MeetingSlot>>>,
    open: DashMap<IndexKey, MeetingUuid>,
    /// server id -> open meetings on it, pending ones included
    open_by_server: DashMap<String, HashSet<MeetingUuid>>,
}

impl MeetingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the open meeting for `(tenant, external_id)`, or insert the
    /// pending meeting produced by `build`.
    ///
    /// `build` runs while the index entry is held and must not block.
    pub fn find_or_insert_pending<F>(
        &self,
        tenant: &str,
        external_id: &str,
        build: F,
    ) -> Result<OpenMeeting, LbError>
    where
        F: FnOnce() -> Result<Meeting, LbError>,
    {
        let key = (tenant.to_string(), external_id.to_string());
        match self.open.entry(key) {
            Entry::Occupied(mut entry) => {
                let uuid = *entry.get();
                match self.get(uuid) {
                    Some(meeting) => Ok(OpenMeeting::Existing(meeting)),
                    None => {
                        // Index outlived its meeting; replace it.
                        let meeting = build()?;
                        self.insert_slot(meeting.clone(), true);
                        entry.insert(meeting.uuid);
                        Ok(OpenMeeting::Pending(meeting))
                    }
                }
            }
            Entry::Vacant(entry) => {
                let meeting = build()?;
                self.insert_slot(meeting.clone(), true);
                entry.insert(meeting.uuid);
                Ok(OpenMeeting::Pending(meeting))
            }
        }
    }

    fn insert_slot(&self, meeting: Meeting, pending: bool) {
        if meeting.state.is_open() {
            self.open_by_server
                .entry(meeting.server_id.clone())
                .or_default()
                .insert(meeting.uuid);
        }
        self.meetings
            .insert(meeting.uuid, Arc::new(Mutex::new(MeetingSlot { meeting, pending })));
    }

    fn unindex_server(&self, server_id: &str, uuid: MeetingUuid) {
        if let Some(mut open) = self.open_by_server.get_mut(server_id) {
            open.remove(&uuid);
        }
        self.open_by_server.remove_if(server_id, |_, open| open.is_empty());
    }

    /// Mark a meeting as accepted by its backend.
    ///
    /// Pending meetings get their creation time reset to now, so polls that
    /// started before the backend knew the meeting cannot end it. If the
    /// record vanished in the meantime it is re-inserted.
    pub fn confirm(&self, meeting: &Meeting, internal_meeting_id: Option<&str>) -> Meeting {
        if let Some(slot) = self.slot(meeting.uuid) {
            let mut slot = slot.lock();
            if slot.pending {
                slot.pending = false;
                slot.meeting.created_at = Utc::now();
            }
            if let Some(internal) = internal_meeting_id {
                slot.meeting.internal_meeting_id = Some(internal.to_string());
            }
            return slot.meeting.clone();
        }

        let mut restored = meeting.clone();
        restored.created_at = Utc::now();
        if let Some(internal) = internal_meeting_id {
            restored.internal_meeting_id = Some(internal.to_string());
        }
        self.restore(restored.clone());
        restored
    }

    /// Drop a pending meeting after a failed create call.
    pub fn abandon(&self, uuid: MeetingUuid) {
        let Some(slot) = self.slot(uuid) else {
            return;
        };
        let (key, server_id) = {
            let slot = slot.lock();
            if !slot.pending {
                return;
            }
            (
                (slot.meeting.tenant.clone(), slot.meeting.external_id.clone()),
                slot.meeting.server_id.clone(),
            )
        };

        self.meetings.remove(&uuid);
        self.open.remove_if(&key, |_, v| *v == uuid);
        self.unindex_server(&server_id, uuid);
        debug!(target: "lb.meetings", meeting_uuid = %uuid, "Pending meeting abandoned");
    }

    /// Insert a known meeting, e.g. loaded from the store at startup.
    pub fn restore(&self, meeting: Meeting) {
        let uuid = meeting.uuid;
        let key = (meeting.tenant.clone(), meeting.external_id.clone());
        let open = meeting.state.is_open();
        self.insert_slot(meeting, false);
        if open {
            self.open.insert(key, uuid);
        }
    }

    fn slot(&self, uuid: MeetingUuid) -> Option<Arc<Mutex<MeetingSlot>>> {
        self.meetings.get(&uuid).map(|s| s.value().clone())
    }

    fn slots(&self) -> Vec<Arc<Mutex<MeetingSlot>>> {
        self.meetings.iter().map(|s| s.value().clone()).collect()
    }

    /// Slots of the open meetings indexed under `server_id`.
    fn server_slots(&self, server_id: &str) -> Vec<Arc<Mutex<MeetingSlot>>> {
        let uuids: Vec<MeetingUuid> = match self.open_by_server.get(server_id) {
            Some(open) => open.iter().copied().collect(),
            None => return Vec::new(),
        };
        uuids.into_iter().filter_map(|uuid| self.slot(uuid)).collect()
    }

    pub fn get(&self, uuid: MeetingUuid) -> Option<Meeting> {
        self.slot(uuid).map(|s| s.lock().meeting.clone())
    }

    pub fn find_open(&self, tenant: &str, external_id: &str) -> Option<Meeting> {
        let uuid = *self
            .open
            .get(&(tenant.to_string(), external_id.to_string()))?
            .value();
        self.get(uuid)
    }

    /// Open, confirmed meetings on `server_id`.
    pub fn open_on_server(&self, server_id: &str) -> Vec<Meeting> {
        self.server_slots(server_id)
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                (!slot.pending && slot.meeting.server_id == server_id && slot.meeting.state.is_open())
                    .then(|| slot.meeting.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.meetings.len()
    }

    /// Number of open meetings, pending ones included.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meetings.is_empty()
    }

    /// Move a meeting forward. Returns the meeting if its state changed.
    pub fn advance(&self, uuid: MeetingUuid, next: MeetingState) -> Result<Option<Meeting>, LbError> {
        let slot = self
            .slot(uuid)
            .ok_or_else(|| LbError::NotFound(format!("Meeting '{uuid}'")))?;

        let (changed, key) = {
            let mut slot = slot.lock();
            let changed = slot.meeting.advance(next, Utc::now());
            let key = (slot.meeting.tenant.clone(), slot.meeting.external_id.clone());
            (changed.then(|| slot.meeting.clone()), key)
        };

        if let Some(meeting) = &changed {
            if !meeting.state.is_open() {
                self.open.remove_if(&key, |_, v| *v == uuid);
                self.unindex_server(&meeting.server_id, uuid);
            }
            info!(
                target: "lb.meetings",
                meeting_uuid = %uuid,
                state = meeting.state.as_db_str(),
                "Meeting state changed"
            );
        }
        Ok(changed)
    }

    /// Apply a successful poll of `server_id`.
    ///
    /// Meetings reported by the backend become `Running` with fresh counts.
    /// Confirmed open meetings created before `poll_started` that the backend
    /// no longer reports become `Ended`. Returns the meetings that changed.
    pub fn apply_snapshot(
        &self,
        server_id: &str,
        running: &[BackendMeeting],
        poll_started: DateTime<Utc>,
    ) -> Vec<Meeting> {
        let reported: HashMap<&str, &BackendMeeting> =
            running.iter().map(|m| (m.meeting_id.as_str(), m)).collect();
        let now = Utc::now();
        let mut changed = Vec::new();
        let mut closed = Vec::new();

        for slot in self.server_slots(server_id) {
            let mut slot = slot.lock();
            let pending = slot.pending;
            let meeting = &mut slot.meeting;
            if meeting.server_id != server_id || !meeting.state.is_open() {
                continue;
            }

            match reported.get(meeting.backend_meeting_id.as_str()) {
                Some(seen) => {
                    let load = MeetingLoad {
                        users: seen.users,
                        voice: seen.voice,
                        video: seen.video,
                    };
                    let advanced = meeting.advance(MeetingState::Running, now);
                    let internal = Some(seen.internal_meeting_id.clone());
                    if advanced || meeting.load != load || meeting.internal_meeting_id != internal {
                        meeting.load = load;
                        meeting.internal_meeting_id = internal;
                        changed.push(meeting.clone());
                    }
                }
                None if !pending && meeting.created_at < poll_started => {
                    meeting.advance(MeetingState::Ended, now);
                    closed.push((
                        (meeting.tenant.clone(), meeting.external_id.clone()),
                        meeting.uuid,
                    ));
                    changed.push(meeting.clone());
                }
                None => {}
            }
        }

        for (key, uuid) in closed {
            self.open.remove_if(&key, |_, v| *v == uuid);
            self.unindex_server(server_id, uuid);
            info!(target: "lb.meetings", meeting_uuid = %uuid, server_id, "Meeting ended");
        }

        changed
    }

    /// End confirmed meetings that never showed up on their backend within
    /// `grace`, and evict closed meetings older than `retention`.
    pub fn cleanup(&self, now: DateTime<Utc>, grace: Duration, retention: Duration) -> CleanupReport {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let mut report = CleanupReport::default();
        let mut closed = Vec::new();
        let mut evict = Vec::new();

        for slot in self.slots() {
            let mut slot = slot.lock();
            let pending = slot.pending;
            let meeting = &mut slot.meeting;

            let stale = meeting
                .created_at
                .checked_add_signed(grace)
                .is_some_and(|deadline| deadline < now);
            let expired = meeting
                .ended_at
                .and_then(|ended| ended.checked_add_signed(retention))
                .is_some_and(|deadline| deadline < now);

            if meeting.state == MeetingState::Created && !pending && stale {
                meeting.advance(MeetingState::Ended, now);
                closed.push((
                    (meeting.tenant.clone(), meeting.external_id.clone()),
                    meeting.server_id.clone(),
                    meeting.uuid,
                ));
                report.ended.push(meeting.clone());
            } else if !meeting.state.is_open() && expired {
                evict.push(meeting.uuid);
            }
        }

        for (key, server_id, uuid) in closed {
            self.open.remove_if(&key, |_, v| *v == uuid);
            self.unindex_server(&server_id, uuid);
        }
        for uuid in evict {
            if self.meetings.remove(&uuid).is_some() {
                report.evicted += 1;
            }
        }

        if !report.ended.is_empty() || report.evicted > 0 {
            info!(
                target: "lb.meetings",
                ended = report.ended.len(),
                evicted = report.evicted,
                "Stale meeting cleanup"
            );
        }
        report
    }
}
