//! Meetings repository.

use chrono::{DateTime, Utc};
use common::types::MeetingUuid;
use sqlx::{FromRow, PgPool};
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use super::observe;
use crate::errors::LbError;
use crate::models::{Meeting, MeetingLoad, MeetingState};

#[derive(Debug, FromRow)]
struct MeetingRow {
    uuid: Uuid,
    external_id: String,
    tenant: String,
    server_id: String,
    backend_meeting_id: String,
    internal_meeting_id: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    users: i32,
    voice: i32,
    video: i32,
}

fn count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn column(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl From<MeetingRow> for Meeting {
    fn from(row: MeetingRow) -> Self {
        Meeting {
            uuid: MeetingUuid(row.uuid),
            external_id: row.external_id,
            tenant: row.tenant,
            server_id: row.server_id,
            backend_meeting_id: row.backend_meeting_id,
            internal_meeting_id: row.internal_meeting_id,
            state: MeetingState::from_db_str(&row.state),
            created_at: row.created_at,
            ended_at: row.ended_at,
            load: MeetingLoad {
                users: count(row.users),
                voice: count(row.voice),
                video: count(row.video),
            },
        }
    }
}

pub struct MeetingsRepository;

impl MeetingsRepository {
    #[instrument(skip_all)]
    pub async fn list_open(pool: &PgPool) -> Result<Vec<Meeting>, LbError> {
        let start = Instant::now();
        let result: Result<Vec<MeetingRow>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT uuid, external_id, tenant, server_id, backend_meeting_id,
                   internal_meeting_id, state, created_at, ended_at, users, voice, video
            FROM meetings
            WHERE state IN ('created', 'running')
            ORDER BY created_at
            "#,
        )
        .fetch_all(pool)
        .await;
        Ok(observe("list_open_meetings", start, result)?
            .into_iter()
            .map(Meeting::from)
            .collect())
    }

    #[instrument(skip_all, fields(meeting_uuid = %uuid))]
    pub async fn get(pool: &PgPool, uuid: MeetingUuid) -> Result<Option<Meeting>, LbError> {
        let start = Instant::now();
        let result: Result<Option<MeetingRow>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT uuid, external_id, tenant, server_id, backend_meeting_id,
                   internal_meeting_id, state, created_at, ended_at, users, voice, video
            FROM meetings
            WHERE uuid = $1
            "#,
        )
        .bind(uuid.0)
        .fetch_optional(pool)
        .await;
        Ok(observe("get_meeting", start, result)?.map(Meeting::from))
    }

    /// Insert or update a meeting.
    ///
    /// The state column only moves forward, so a late write of an older
    /// snapshot cannot reopen a closed meeting.
    #[instrument(skip_all, fields(meeting_uuid = %meeting.uuid))]
    pub async fn upsert(pool: &PgPool, meeting: &Meeting) -> Result<(), LbError> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            INSERT INTO meetings (
                uuid, external_id, tenant, server_id, backend_meeting_id,
                internal_meeting_id, state, created_at, ended_at, users, voice, video
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (uuid) DO UPDATE SET
                internal_meeting_id = COALESCE(EXCLUDED.internal_meeting_id, meetings.internal_meeting_id),
                state = CASE
                    WHEN meeting_state_rank(EXCLUDED.state) > meeting_state_rank(meetings.state)
                    THEN EXCLUDED.state ELSE meetings.state END,
                ended_at = COALESCE(meetings.ended_at, EXCLUDED.ended_at),
                users = EXCLUDED.users,
                voice = EXCLUDED.voice,
                video = EXCLUDED.video
            "#,
        )
        .bind(meeting.uuid.0)
        .bind(&meeting.external_id)
        .bind(&meeting.tenant)
        .bind(&meeting.server_id)
        .bind(&meeting.backend_meeting_id)
        .bind(meeting.internal_meeting_id.as_deref())
        .bind(meeting.state.as_db_str())
        .bind(meeting.created_at)
        .bind(meeting.ended_at)
        .bind(column(meeting.load.users))
        .bind(column(meeting.load.voice))
        .bind(column(meeting.load.video))
        .execute(pool)
        .await;
        observe("upsert_meeting", start, result).map(|_| ())
    }

    #[instrument(skip_all, fields(meeting_uuid = %uuid))]
    pub async fn delete(pool: &PgPool, uuid: MeetingUuid) -> Result<bool, LbError> {
        let start = Instant::now();
        let result = sqlx::query("DELETE FROM meetings WHERE uuid = $1")
            .bind(uuid.0)
            .execute(pool)
            .await;
        Ok(observe("delete_meeting", start, result)?.rows_affected() > 0)
    }
}
