//! Schema DDL: tables, indexes and the append-notification trigger.
//!
//! [`initialize`] is idempotent and safe to run on every startup. The
//! trigger is statement-level over the transition table of each `INSERT`,
//! so one committed append batch raises exactly one
//! `pg_notify('events', '<first>,<last>')`, the contract the listener
//! consumes, no matter which writer performed the append.

use sqlx::PgPool;

use rill_core::store::StoreError;

use crate::backend;

/// Streams and their current versions.
pub const CREATE_STREAMS: &str = "
CREATE TABLE IF NOT EXISTS streams (
    stream_id bigserial PRIMARY KEY,
    stream_uuid text NOT NULL UNIQUE,
    stream_version bigint NOT NULL DEFAULT 0,
    created_at timestamptz NOT NULL DEFAULT now()
)";

/// Immutable event rows; `event_number` is the dense `$all` order.
pub const CREATE_EVENTS: &str = "
CREATE TABLE IF NOT EXISTS events (
    event_number bigint PRIMARY KEY,
    event_id uuid NOT NULL UNIQUE,
    stream_uuid text NOT NULL,
    stream_version bigint NOT NULL,
    event_type text NOT NULL,
    correlation_id uuid,
    causation_id uuid,
    data bytea NOT NULL,
    metadata bytea NOT NULL DEFAULT ''::bytea,
    created_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (stream_uuid, stream_version)
)";

/// Durable subscription cursors.
pub const CREATE_SUBSCRIPTIONS: &str = "
CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id bigserial PRIMARY KEY,
    stream_uuid text NOT NULL,
    subscription_name text NOT NULL,
    last_seen_event_number bigint,
    last_seen_stream_version bigint,
    created_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (stream_uuid, subscription_name)
)";

/// Notification function: one payload per appended batch.
pub const CREATE_NOTIFY_FUNCTION: &str = "
CREATE OR REPLACE FUNCTION rill_notify_events() RETURNS trigger AS $$
DECLARE
    first_number bigint;
    last_number bigint;
BEGIN
    SELECT min(event_number), max(event_number)
      INTO first_number, last_number
      FROM appended;
    IF first_number IS NOT NULL THEN
        PERFORM pg_notify('events', first_number || ',' || last_number);
    END IF;
    RETURN NULL;
END;
$$ LANGUAGE plpgsql";

/// Drops a previous trigger before re-creating it.
pub const DROP_NOTIFY_TRIGGER: &str = "DROP TRIGGER IF EXISTS rill_events_notify ON events";

/// Statement-level trigger over the insert's transition table.
pub const CREATE_NOTIFY_TRIGGER: &str = "
CREATE TRIGGER rill_events_notify
    AFTER INSERT ON events
    REFERENCING NEW TABLE AS appended
    FOR EACH STATEMENT
    EXECUTE FUNCTION rill_notify_events()";

/// Creates tables and (re)installs the notification trigger.
///
/// # Errors
///
/// Any failed DDL statement, wrapped as a backend error.
pub async fn initialize(pool: &PgPool) -> Result<(), StoreError> {
    for statement in [
        CREATE_STREAMS,
        CREATE_EVENTS,
        CREATE_SUBSCRIPTIONS,
        CREATE_NOTIFY_FUNCTION,
        DROP_NOTIFY_TRIGGER,
        CREATE_NOTIFY_TRIGGER,
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(backend)?;
    }
    Ok(())
}
