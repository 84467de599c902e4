//! The append collaborator.
//!
//! The subscription runtime only consumes committed rows and their
//! notifications; this writer exists so the system can be driven end to
//! end. It assigns dense positions inside one transaction (a transaction-
//! scoped advisory lock serializes writers so `event_number` stays dense
//! across concurrent appends) and leaves notification to the schema
//! trigger, keeping the wire contract identical for any other writer.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use rill_core::event::{EventData, ExpectedVersion, RecordedEvent};
use rill_core::store::StoreError;

use crate::backend;

/// Transaction-scoped advisory lock key serializing appends.
const APPEND_LOCK_KEY: i64 = 0x7269_6c6c;

/// Transactional append writer.
#[derive(Clone)]
pub struct PgAppendWriter {
    pool: PgPool,
}

impl PgAppendWriter {
    /// Creates a writer over `pool`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Appends `events` to `stream_uuid`, returning them with assigned
    /// positions. The commit fires the notification trigger.
    ///
    /// # Errors
    ///
    /// [`StoreError::WrongExpectedVersion`] when `expected` is `Exact` and
    /// does not match; backend errors otherwise.
    pub async fn append_to_stream(
        &self,
        stream_uuid: &str,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        sqlx::query(
            "INSERT INTO streams (stream_uuid) VALUES ($1)
             ON CONFLICT (stream_uuid) DO NOTHING",
        )
        .bind(stream_uuid)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        let (current,): (i64,) =
            sqlx::query_as("SELECT stream_version FROM streams WHERE stream_uuid = $1 FOR UPDATE")
                .bind(stream_uuid)
                .fetch_one(&mut *tx)
                .await
                .map_err(backend)?;
        let current = current as u64;
        if let ExpectedVersion::Exact(expected) = expected {
            if expected != current {
                return Err(StoreError::WrongExpectedVersion {
                    stream_uuid: stream_uuid.to_owned(),
                    expected,
                    current,
                });
            }
        }

        let (base,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(event_number), 0) FROM events")
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;
        let base = base as u64;

        let created_at = Utc::now();
        let recorded: Vec<RecordedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(offset, event)| {
                let offset = offset as u64;
                RecordedEvent {
                    event_id: event.event_id,
                    event_number: base + offset + 1,
                    stream_uuid: stream_uuid.to_owned(),
                    stream_version: current + offset + 1,
                    event_type: event.event_type,
                    correlation_id: event.correlation_id,
                    causation_id: event.causation_id,
                    data: event.data,
                    metadata: event.metadata,
                    created_at,
                }
            })
            .collect();

        // One multi-row statement so the statement-level trigger emits one
        // notification covering the whole batch.
        let event_ids: Vec<Uuid> = recorded.iter().map(|e| e.event_id).collect();
        let event_numbers: Vec<i64> = recorded.iter().map(|e| e.event_number as i64).collect();
        let stream_versions: Vec<i64> = recorded.iter().map(|e| e.stream_version as i64).collect();
        let event_types: Vec<String> = recorded.iter().map(|e| e.event_type.clone()).collect();
        let correlation_ids: Vec<Option<Uuid>> =
            recorded.iter().map(|e| e.correlation_id).collect();
        let causation_ids: Vec<Option<Uuid>> = recorded.iter().map(|e| e.causation_id).collect();
        let payloads: Vec<Vec<u8>> = recorded.iter().map(|e| e.data.to_vec()).collect();
        let metadata: Vec<Vec<u8>> = recorded.iter().map(|e| e.metadata.to_vec()).collect();

        sqlx::query(
            "INSERT INTO events
                 (event_id, event_number, stream_uuid, stream_version, event_type,
                  correlation_id, causation_id, data, metadata, created_at)
             SELECT u.event_id, u.event_number, $3, u.stream_version, u.event_type,
                    u.correlation_id, u.causation_id, u.data, u.metadata, $10
             FROM UNNEST($1::uuid[], $2::bigint[], $4::bigint[], $5::text[],
                         $6::uuid[], $7::uuid[], $8::bytea[], $9::bytea[])
                  AS u(event_id, event_number, stream_version, event_type,
                       correlation_id, causation_id, data, metadata)",
        )
        .bind(&event_ids)
        .bind(&event_numbers)
        .bind(stream_uuid)
        .bind(&stream_versions)
        .bind(&event_types)
        .bind(&correlation_ids)
        .bind(&causation_ids)
        .bind(&payloads)
        .bind(&metadata)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query("UPDATE streams SET stream_version = $2 WHERE stream_uuid = $1")
            .bind(stream_uuid)
            .bind((current + recorded.len() as u64) as i64)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(recorded)
    }
}
