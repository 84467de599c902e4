//! # Rill Core
//!
//! The subscription runtime of the Rill event store: producers append
//! immutable, ordered events to named streams; consumers subscribe by name
//! to one stream or to the synthetic `$all` view, receive events in order,
//! and acknowledge progress so delivery resumes from the last acknowledged
//! position after a reconnect or failover.
//!
//! This crate is backend-agnostic. It contains:
//!
//! - **Events** ([`event`]): recorded events, append inputs, notification
//!   ranges.
//! - **Storage seams** ([`store`]): the reader, subscription-row and
//!   advisory-lock traits a backend implements (`rill-storage` provides
//!   PostgreSQL).
//! - **Topics** ([`topic`]): per-stream in-process broadcast channels.
//! - **Relay** ([`relay`]): the cluster-singleton that turns committed
//!   `(first, last)` ranges into topic traffic.
//! - **Subscriptions** ([`subscription`]): the per-subscription state
//!   machine, catch-up workers, registry and supervision.
//! - **Memory backend** ([`memory`]): an in-process implementation of all
//!   seams, for tests and single-node use.
//!
//! ## Delivery contract
//!
//! At-least-once, strictly ordered per subscription. A subscriber must ack
//! to keep delivery flowing and must tolerate redelivery after a restart.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod event;
pub mod memory;
pub mod relay;
pub mod store;
pub mod subscription;
pub mod topic;

pub use event::{
    EventBatch, EventData, EventRange, ExpectedVersion, RecordedEvent, ALL_STREAM,
};
pub use relay::{NotificationRelay, RelayConfig};
pub use store::{EventReader, LockGuard, LockManager, StoreError, StoredSubscription, SubscriptionStore};
pub use subscription::{
    Ack, StartFrom, SubscribeError, Subscription, SubscriptionConfig, SubscriptionMessage,
    SubscriptionOptions, Subscriptions,
};
pub use topic::TopicHub;

/// Result type for rill-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type aggregating the runtime's failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage backend failure.
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    /// Subscribe API failure.
    #[error("subscription error: {0}")]
    Subscription(#[from] subscription::SubscribeError),
}
