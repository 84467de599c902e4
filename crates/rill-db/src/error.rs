//! Error types for the store facade.

use rill_core::store::StoreError;

/// Errors from event store operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Subscription runtime error.
    #[error("subscription error: {0}")]
    Core(#[from] rill_core::Error),

    /// Storage error (reads, appends, durable rows).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Connection-level driver error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}
