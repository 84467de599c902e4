//! Durable subscription rows.
//!
//! One row per `(stream_uuid, subscription_name)`, carrying the last
//! acknowledged positions. The lookup-first subscribe absorbs most create
//! races; a race that loses both the insert and the re-read surfaces
//! `SubscriptionAlreadyExists` to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use rill_core::store::{StoreError, StoredSubscription, SubscriptionStore};

use crate::backend;

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: i64,
    stream_uuid: String,
    subscription_name: String,
    last_seen_event_number: Option<i64>,
    last_seen_stream_version: Option<i64>,
    created_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for StoredSubscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            subscription_id: row.subscription_id,
            stream_uuid: row.stream_uuid,
            subscription_name: row.subscription_name,
            last_seen_event_number: row.last_seen_event_number.map(|n| n as u64),
            last_seen_stream_version: row.last_seen_stream_version.map(|n| n as u64),
            created_at: row.created_at,
        }
    }
}

const SELECT_ROW: &str = "SELECT subscription_id, stream_uuid, subscription_name, \
     last_seen_event_number, last_seen_stream_version, created_at \
     FROM subscriptions \
     WHERE stream_uuid = $1 AND subscription_name = $2";

/// [`SubscriptionStore`] over a connection pool.
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    /// Creates a store over `pool`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lookup(
        &self,
        stream_uuid: &str,
        name: &str,
    ) -> Result<Option<StoredSubscription>, StoreError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(SELECT_ROW)
            .bind(stream_uuid)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn subscribe(
        &self,
        stream_uuid: &str,
        name: &str,
        start_event_number: u64,
        start_stream_version: u64,
    ) -> Result<StoredSubscription, StoreError> {
        if let Some(existing) = self.lookup(stream_uuid, name).await? {
            return Ok(existing);
        }

        let inserted: Option<SubscriptionRow> = sqlx::query_as(
            "INSERT INTO subscriptions
                 (stream_uuid, subscription_name, last_seen_event_number, last_seen_stream_version)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (stream_uuid, subscription_name) DO NOTHING
             RETURNING subscription_id, stream_uuid, subscription_name,
                       last_seen_event_number, last_seen_stream_version, created_at",
        )
        .bind(stream_uuid)
        .bind(name)
        .bind(start_event_number as i64)
        .bind(start_stream_version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }
        // A concurrent creator won the insert; their row is authoritative.
        match self.lookup(stream_uuid, name).await? {
            Some(existing) => Ok(existing),
            None => Err(StoreError::SubscriptionAlreadyExists {
                stream_uuid: stream_uuid.to_owned(),
                name: name.to_owned(),
            }),
        }
    }

    async fn ack(
        &self,
        stream_uuid: &str,
        name: &str,
        event_number: u64,
        stream_version: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscriptions
             SET last_seen_event_number = $3, last_seen_stream_version = $4
             WHERE stream_uuid = $1 AND subscription_name = $2",
        )
        .bind(stream_uuid)
        .bind(name)
        .bind(event_number as i64)
        .bind(stream_version as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn unsubscribe(&self, stream_uuid: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM subscriptions WHERE stream_uuid = $1 AND subscription_name = $2",
        )
        .bind(stream_uuid)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
