//! Local process registry for live subscriptions.
//!
//! Maps `(stream_uuid, name)` to the running subscription's control
//! channel. Registration is exclusive: a second local subscribe with the
//! same key is refused with `SubscriptionAlreadyExists`. Cross-node
//! exclusivity is not this registry's job; the database advisory lock
//! enforces it.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::subscription::handle::Command;

/// Key identifying a subscription: `(stream_uuid, name)`.
pub(crate) type SubscriptionKey = (String, String);

struct Registered {
    /// Epoch token distinguishing re-registrations of the same key, so a
    /// late deregistration of a finished task cannot evict its successor.
    epoch: u64,
    control: mpsc::Sender<Command>,
}

/// Exclusive registry of live subscription processes on this node.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionKey, Registered>>,
    next_epoch: Mutex<u64>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription, returning its epoch token, or `None` when
    /// the key is already taken.
    pub(crate) fn register(
        &self,
        key: SubscriptionKey,
        control: mpsc::Sender<Command>,
    ) -> Option<u64> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return None;
        }
        let epoch = {
            let mut next = self.next_epoch.lock();
            *next += 1;
            *next
        };
        entries.insert(key, Registered { epoch, control });
        Some(epoch)
    }

    /// Removes the registration if it still belongs to `epoch`.
    pub(crate) fn deregister(&self, key: &SubscriptionKey, epoch: u64) {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|r| r.epoch == epoch) {
            entries.remove(key);
        }
    }

    /// Control channel of a live subscription, if any.
    pub(crate) fn control(&self, key: &SubscriptionKey) -> Option<mpsc::Sender<Command>> {
        self.entries.lock().get(key).map(|r| r.control.clone())
    }

    /// Number of live registrations.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(stream: &str, name: &str) -> SubscriptionKey {
        (stream.to_owned(), name.to_owned())
    }

    fn control() -> mpsc::Sender<Command> {
        mpsc::channel(1).0
    }

    #[test]
    fn test_registry_registration_is_exclusive() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.register(key("s", "a"), control()).is_some());
        assert!(registry.register(key("s", "a"), control()).is_none());

        // Different name or stream is a different subscription.
        assert!(registry.register(key("s", "b"), control()).is_some());
        assert!(registry.register(key("t", "a"), control()).is_some());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_registry_deregister_frees_the_key() {
        let registry = SubscriptionRegistry::new();
        let epoch = registry.register(key("s", "a"), control()).unwrap();
        registry.deregister(&key("s", "a"), epoch);
        assert!(registry.register(key("s", "a"), control()).is_some());
    }

    #[test]
    fn test_registry_stale_deregister_ignored() {
        let registry = SubscriptionRegistry::new();
        let old = registry.register(key("s", "a"), control()).unwrap();
        registry.deregister(&key("s", "a"), old);

        let fresh = registry.register(key("s", "a"), control()).unwrap();
        assert_ne!(old, fresh);

        // A late deregistration from the finished predecessor must not
        // evict the successor.
        registry.deregister(&key("s", "a"), old);
        assert_eq!(registry.len(), 1);
        assert!(registry.control(&key("s", "a")).is_some());
    }
}
