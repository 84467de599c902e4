//! Supervision of subscription tasks.
//!
//! Each subscription runs under a supervisor loop: a transient crash
//! (storage failure) restarts the task with fresh in-memory state (the
//! durable cursor carries the progress), while every deliberate exit
//! (unsubscribe, subscriber death, shutdown) stops it for good. Sibling
//! subscriptions are unaffected either way.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::subscription::handle::{Command, SubscriptionMessage};
use crate::subscription::registry::{SubscriptionKey, SubscriptionRegistry};
use crate::subscription::task::{run_subscription, ExitReason, SubscriptionDeps, SubscriptionParams};

/// Runs a subscription under supervision until it terminates, then frees
/// its registry slot.
pub(crate) async fn run_supervised<T: Clone + Send + 'static>(
    deps: SubscriptionDeps,
    params: SubscriptionParams<T>,
    mut control: mpsc::Receiver<Command>,
    subscriber: mpsc::Sender<SubscriptionMessage<T>>,
    registry: Arc<SubscriptionRegistry>,
    key: SubscriptionKey,
    epoch: u64,
) {
    let mut shutdown = deps.shutdown.clone();
    loop {
        match run_subscription(&deps, &params, &mut control, &subscriber).await {
            ExitReason::Crashed(err) => {
                warn!(
                    stream_uuid = %key.0,
                    name = %key.1,
                    %err,
                    "subscription crashed, restarting from the durable cursor"
                );
                tokio::select! {
                    () = tokio::time::sleep(deps.config.restart_delay) => {}
                    () = subscriber.closed() => break,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            reason => {
                debug!(
                    stream_uuid = %key.0,
                    name = %key.1,
                    ?reason,
                    "subscription stopped"
                );
                break;
            }
        }
    }
    registry.deregister(&key, epoch);
}
