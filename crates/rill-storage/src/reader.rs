//! Forward reads over the `events` table.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use rill_core::event::RecordedEvent;
use rill_core::store::{EventReader, StoreError};

use crate::backend;

/// Row shape shared by the stream and all-stream queries.
#[derive(sqlx::FromRow)]
pub(crate) struct EventRow {
    pub event_id: Uuid,
    pub event_number: i64,
    pub stream_uuid: String,
    pub stream_version: i64,
    pub event_type: String,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl From<EventRow> for RecordedEvent {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            event_number: row.event_number as u64,
            stream_uuid: row.stream_uuid,
            stream_version: row.stream_version as u64,
            event_type: row.event_type,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            data: Bytes::from(row.data),
            metadata: Bytes::from(row.metadata),
            created_at: row.created_at,
        }
    }
}

const SELECT_COLUMNS: &str = "event_id, event_number, stream_uuid, stream_version, event_type, \
     correlation_id, causation_id, data, metadata, created_at";

/// Stateless [`EventReader`] over a connection pool.
#[derive(Clone)]
pub struct PgEventReader {
    pool: PgPool,
}

impl PgEventReader {
    /// Creates a reader over `pool`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventReader for PgEventReader {
    async fn read_stream(
        &self,
        stream_uuid: &str,
        from_version: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS}
             FROM events
             WHERE stream_uuid = $1 AND stream_version >= $2
             ORDER BY stream_version ASC
             LIMIT $3"
        ))
        .bind(stream_uuid)
        .bind(from_version as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        if rows.is_empty() {
            // Distinguish "caught up" from "no such stream".
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT 1::bigint FROM streams WHERE stream_uuid = $1")
                    .bind(stream_uuid)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?;
            if exists.is_none() {
                return Err(StoreError::StreamNotFound(stream_uuid.to_owned()));
            }
        }
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn read_all(
        &self,
        from_event_number: u64,
        max: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS}
             FROM events
             WHERE event_number >= $1
             ORDER BY event_number ASC
             LIMIT $2"
        ))
        .bind(from_event_number as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn latest_event_number(&self) -> Result<u64, StoreError> {
        let (latest,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(event_number), 0) FROM events")
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;
        Ok(latest as u64)
    }

    async fn stream_version(&self, stream_uuid: &str) -> Result<u64, StoreError> {
        let version: Option<(i64,)> =
            sqlx::query_as("SELECT stream_version FROM streams WHERE stream_uuid = $1")
                .bind(stream_uuid)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(version.map_or(0, |(v,)| v as u64))
    }
}
