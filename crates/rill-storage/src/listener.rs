//! The `LISTEN events` loop.
//!
//! Each committed append batch raises one notification on the `events`
//! channel with payload `"<first_event_number>,<last_event_number>"` (see
//! [`crate::schema`] for the emitting trigger). Payloads arrive in commit
//! order; the listener preserves that order, never coalesces ranges, and
//! forwards them to the relay.
//!
//! On connection loss the listener reconnects with capped exponential
//! backoff and does **not** replay missed ranges: recovery is each
//! subscription's catch-up path, which re-reads the hole from the store.

use std::time::Duration;

use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use rill_core::event::EventRange;

/// Configuration for the [`PgEventListener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Notification channel name. The schema trigger notifies `events`.
    pub channel: String,
    /// Backoff after the first failed (re)connect.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: "events".into(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Sole consumer of the database notification channel.
///
/// Spawn [`run`](Self::run) once per cluster next to the relay it feeds.
pub struct PgEventListener {
    pool: PgPool,
    config: ListenerConfig,
    ranges: mpsc::Sender<EventRange>,
    shutdown: watch::Receiver<bool>,
}

impl PgEventListener {
    /// Creates a listener feeding `ranges`.
    #[must_use]
    pub fn new(
        pool: PgPool,
        config: ListenerConfig,
        ranges: mpsc::Sender<EventRange>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            config,
            ranges,
            shutdown,
        }
    }

    /// Runs the listen loop until shutdown or until the relay goes away.
    pub async fn run(mut self) {
        let mut backoff = self.config.initial_backoff;
        let mut listener: Option<PgListener> = None;

        loop {
            if *self.shutdown.borrow() {
                debug!("event listener shutting down");
                return;
            }

            let active = match listener.as_mut() {
                Some(active) => active,
                None => {
                    match self.connect().await {
                        Ok(connected) => {
                            info!(channel = %self.config.channel, "listening for append notifications");
                            backoff = self.config.initial_backoff;
                            listener.insert(connected)
                        }
                        Err(err) => {
                            warn!(%err, ?backoff, "listener connect failed, retrying");
                            tokio::select! {
                                () = tokio::time::sleep(backoff) => {}
                                _ = self.shutdown.changed() => {}
                            }
                            backoff = (backoff * 2).min(self.config.max_backoff);
                            continue;
                        }
                    }
                }
            };

            tokio::select! {
                notification = active.recv() => match notification {
                    Ok(notification) => {
                        let payload = notification.payload();
                        match payload.parse::<EventRange>() {
                            Ok(range) => {
                                trace!(%range, "append notification");
                                if self.ranges.send(range).await.is_err() {
                                    debug!("relay gone, listener stopping");
                                    return;
                                }
                            }
                            Err(err) => {
                                // A foreign writer on the channel; skip it.
                                error!(%err, "ignoring malformed append notification");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "notification connection lost, reconnecting");
                        listener = None;
                    }
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("event listener shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.config.channel).await?;
        Ok(listener)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let cfg = ListenerConfig::default();
        assert_eq!(cfg.channel, "events");
        assert_eq!(cfg.initial_backoff, Duration::from_secs(1));
        assert_eq!(cfg.max_backoff, Duration::from_secs(60));
    }
}
