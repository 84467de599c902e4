//! # Rill
//!
//! A PostgreSQL-backed event store with persistent, ordered, at-least-once
//! subscriptions. Producers append immutable events to named streams;
//! consumers subscribe by name to one stream or to the synthetic `$all`
//! view, receive events in order, and acknowledge progress so delivery
//! resumes from the last acknowledged position after a reconnect or
//! failover. A database advisory lock keeps each named subscription single
//! active across every node sharing the store.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use rill_db::{EventStore, StoreConfig, EventData, ExpectedVersion,
//!               SubscriptionOptions, SubscriptionMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rill_db::DbError> {
//!     let store = EventStore::connect(StoreConfig::new(
//!         "postgres://localhost/rill",
//!     )).await?;
//!     store.initialize().await?;
//!
//!     let mut sub = store
//!         .subscribe_to_stream("account-123", "balances", SubscriptionOptions::new())
//!         .await?;
//!
//!     store.append_to_stream(
//!         "account-123",
//!         ExpectedVersion::Any,
//!         vec![EventData::new("account_opened", &b"{}"[..])],
//!     ).await?;
//!
//!     while let Some(message) = sub.recv().await {
//!         if let SubscriptionMessage::Events(events) = message {
//!             // process, then acknowledge to advance the durable cursor
//!             sub.ack_events(&events).await;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

mod config;
mod db;
mod error;

pub use config::StoreConfig;
pub use db::EventStore;
pub use error::DbError;

// Re-export the API surface callers interact with.
pub use rill_core::{
    Ack, EventData, EventRange, ExpectedVersion, RecordedEvent, StartFrom, StoreError,
    StoredSubscription, Subscription, SubscriptionMessage, SubscriptionOptions, ALL_STREAM,
};
pub use rill_storage::schema;
