use std::sync::Arc;
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

use super::ResourceLoader;
use super::cacher::{Inner, ResourceCache};
use crate::utils::futures::CancelOnDrop;

/// The outcome of one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub removed_entries: usize,
    pub removed_bytes: u64,

    pub retained_entries: usize,
    pub retained_bytes: u64,
}

impl<L: ResourceLoader> ResourceCache<L> {
    /// Removes entries that were idle for longer than their priority allows, and disposable
    /// entries that were never reused.
    ///
    /// Returns `None` without doing anything if another sweep is running.
    pub fn sweep(&self) -> Option<SweepStats> {
        self.inner.sweep()
    }

    /// Spawns a task that sweeps the cache every [`sweep_interval`].
    ///
    /// The task stops when the returned handle is dropped, or once the cache itself is gone.
    ///
    /// [`sweep_interval`]: crate::config::CacheConfig::sweep_interval
    pub fn spawn_sweeper(&self) -> CancelOnDrop<()> {
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval.max(Duration::from_millis(1));

        let task = async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.sweep();
            }
            tracing::debug!("resource cache dropped, stopping sweeper");
        };

        CancelOnDrop::new(tokio::spawn(
            task.bind_hub(Hub::new_from_top(Hub::current())),
        ))
    }
}

impl<L: ResourceLoader> Inner<L> {
    pub(super) fn sweep(&self) -> Option<SweepStats> {
        let Some(_running) = self.sweep_lock.try_lock() else {
            tracing::debug!("skipping sweep, another one is still running");
            return None;
        };

        let now = Instant::now();
        let (evicted, stats, previous, current) = {
            let mut store = self.store.write();
            let mut evicted = store.remove_expired(now);

            let stats = SweepStats {
                removed_entries: evicted.len(),
                removed_bytes: evicted.iter().map(|e| e.memory_size).sum(),
                retained_entries: store.len(),
                retained_bytes: store.total_memory_usage(),
            };
            let (previous, current) = self.rebalance(&mut store, now, &mut evicted);
            (evicted, stats, previous, current)
        };

        tracing::debug!(
            removed_entries = stats.removed_entries,
            removed_bytes = stats.removed_bytes,
            retained_entries = stats.retained_entries,
            retained_bytes = stats.retained_bytes,
            "swept resource cache"
        );
        self.publish(evicted, previous, current);

        Some(stats)
    }
}
