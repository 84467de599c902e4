//! Session-scoped advisory locks.
//!
//! `pg_try_advisory_lock` is keyed by the subscription id and held by a
//! **dedicated** connection, never a pooled one (which would leak the lock
//! to the next checkout). Dropping the guard closes the session, which is
//! how PostgreSQL releases a session-scoped advisory lock, including after
//! a crash of the holding node.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::{debug, trace};

use rill_core::store::{LockGuard, LockManager, StoreError};

use crate::backend;

/// [`LockManager`] opening one dedicated connection per held lock.
#[derive(Clone)]
pub struct PgLockManager {
    url: String,
}

impl PgLockManager {
    /// Creates a manager connecting to `url` for each lock attempt.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn try_lock(
        &self,
        subscription_id: i64,
    ) -> Result<Option<Box<dyn LockGuard>>, StoreError> {
        let mut conn = PgConnection::connect(&self.url).await.map_err(backend)?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(subscription_id)
            .fetch_one(&mut conn)
            .await
            .map_err(backend)?;

        if locked {
            trace!(subscription_id, "advisory lock acquired");
            Ok(Some(Box::new(PgLockGuard {
                subscription_id,
                conn: Some(conn),
            })))
        } else {
            trace!(subscription_id, "advisory lock busy");
            // Close promptly so only held locks keep a connection open.
            let _ = conn.close().await;
            Ok(None)
        }
    }
}

/// Holds the lock for as long as the underlying session lives.
struct PgLockGuard {
    subscription_id: i64,
    conn: Option<PgConnection>,
}

impl LockGuard for PgLockGuard {}

impl Drop for PgLockGuard {
    fn drop(&mut self) {
        debug!(
            subscription_id = self.subscription_id,
            "releasing advisory lock"
        );
        if let Some(conn) = self.conn.take() {
            // Drop cannot await; hand the close to the runtime. If no
            // runtime is left the connection drops anyway and the server
            // reaps the session with its lock.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = conn.close().await;
                });
            }
        }
    }
}
