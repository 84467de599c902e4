//! # Rill Storage
//!
//! PostgreSQL backend for the Rill event store. Implements the storage
//! seams of `rill-core` with `sqlx`:
//!
//! - [`PgEventReader`]: forward reads over the `events` table.
//! - [`PgSubscriptionStore`]: durable subscription rows.
//! - [`PgLockManager`]: session-scoped advisory locks on dedicated
//!   connections.
//! - [`PgEventListener`]: the `LISTEN events` loop feeding committed
//!   `(first, last)` ranges to the relay, reconnecting with capped backoff.
//! - [`schema`]: DDL for the three tables and the statement-level trigger
//!   that emits `pg_notify('events', '<first>,<last>')` per append batch.
//! - [`PgAppendWriter`]: the append collaborator; transactional inserts
//!   with dense numbering and `WrongExpectedVersion` enforcement.
//!
//! All fallible operations surface
//! [`StoreError`](rill_core::store::StoreError); driver failures are
//! wrapped as transient backend errors, which crash the owning subscription
//! task and let its supervisor restart from the durable cursor.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Positions are u64 in the API and bigint in PostgreSQL.
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

pub mod append;
pub mod listener;
pub mod lock;
pub mod reader;
pub mod schema;
pub mod subscriptions;

pub use append::PgAppendWriter;
pub use listener::{ListenerConfig, PgEventListener};
pub use lock::PgLockManager;
pub use reader::PgEventReader;
pub use subscriptions::PgSubscriptionStore;

use rill_core::store::StoreError;

/// Wraps a driver failure as a transient backend error.
pub(crate) fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}
