//! Periodic removal of expired entries.

use crate::CacheStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

/// Owns the background sweep task; dropping it stops the sweep.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweep.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    /// Returns true once the sweep task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<V: Send + 'static> CacheStore<V> {
    /// Spawn the expiry sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference, so it exits once the store is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let period = self.config().cleanup_interval().max(Duration::from_millis(1));
        let store = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "swept expired cache entries");
                }
            }
        });
        SweeperHandle { task }
    }
}
