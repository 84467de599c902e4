//! Store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rill_core::{RelayConfig, SubscriptionConfig};
use rill_storage::ListenerConfig;

/// Configuration for an [`EventStore`](crate::EventStore).
///
/// Intervals are carried as milliseconds so the whole struct deserializes
/// from flat configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Notification channel the schema trigger writes to.
    pub channel: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Buffered committed ranges between listener and relay.
    pub range_queue_capacity: usize,
    /// Rows per read while the relay resolves a range.
    pub relay_read_batch_size: usize,
    /// Batches buffered per stream topic.
    pub topic_capacity: usize,
    /// Pending-buffer capacity per subscription.
    pub max_size: usize,
    /// Drain level recovering a max-capacity subscription
    /// (default: `max_size / 2`).
    pub low_water: Option<usize>,
    /// Page size for subscription catch-up reads.
    pub catch_up_batch_size: usize,
    /// Advisory-lock poll interval, in milliseconds.
    pub lock_retry_interval_ms: u64,
    /// Delay before restarting a crashed subscription, in milliseconds.
    pub restart_delay_ms: u64,
    /// Subscriber mailbox capacity.
    pub mailbox_capacity: usize,
    /// First listener reconnect backoff, in milliseconds.
    pub listener_initial_backoff_ms: u64,
    /// Listener reconnect backoff ceiling, in milliseconds.
    pub listener_max_backoff_ms: u64,
}

impl StoreConfig {
    /// Configuration with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub(crate) fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            max_size: self.max_size,
            low_water: self.low_water,
            catch_up_batch_size: self.catch_up_batch_size,
            lock_retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            mailbox_capacity: self.mailbox_capacity,
        }
    }

    pub(crate) fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            channel: self.channel.clone(),
            initial_backoff: Duration::from_millis(self.listener_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.listener_max_backoff_ms),
        }
    }

    pub(crate) fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            read_batch_size: self.relay_read_batch_size,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let subscriptions = SubscriptionConfig::default();
        let listener = ListenerConfig::default();
        Self {
            url: "postgres://localhost/rill".into(),
            channel: listener.channel,
            pool_size: 10,
            range_queue_capacity: 1024,
            relay_read_batch_size: RelayConfig::default().read_batch_size,
            topic_capacity: rill_core::topic::DEFAULT_TOPIC_CAPACITY,
            max_size: subscriptions.max_size,
            low_water: subscriptions.low_water,
            catch_up_batch_size: subscriptions.catch_up_batch_size,
            lock_retry_interval_ms: subscriptions.lock_retry_interval.as_millis() as u64,
            restart_delay_ms: subscriptions.restart_delay.as_millis() as u64,
            mailbox_capacity: subscriptions.mailbox_capacity,
            listener_initial_backoff_ms: listener.initial_backoff.as_millis() as u64,
            listener_max_backoff_ms: listener.max_backoff.as_millis() as u64,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.channel, "events");
        assert_eq!(cfg.max_size, 1000);
        assert!(cfg.low_water.is_none());
        assert_eq!(cfg.catch_up_batch_size, 1000);
        assert_eq!(cfg.lock_retry_interval_ms, 1000);
        assert_eq!(cfg.pool_size, 10);
    }

    #[test]
    fn test_config_new_keeps_defaults() {
        let cfg = StoreConfig::new("postgres://db.internal/eventstore");
        assert_eq!(cfg.url, "postgres://db.internal/eventstore");
        assert_eq!(cfg.mailbox_capacity, StoreConfig::default().mailbox_capacity);
    }

    #[test]
    fn test_config_interval_mapping() {
        let cfg = StoreConfig {
            lock_retry_interval_ms: 50,
            restart_delay_ms: 10,
            ..StoreConfig::default()
        };
        let subs = cfg.subscription_config();
        assert_eq!(subs.lock_retry_interval, Duration::from_millis(50));
        assert_eq!(subs.restart_delay, Duration::from_millis(10));
    }
}
