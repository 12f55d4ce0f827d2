use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use super::in_flight::{InFlightRegistry, LoadHandle, PendingLoad};
use super::pressure::{PressureController, PressureLevel};
use super::stats::{CacheCounters, CacheHealth, CacheStatistics};
use super::store::{CacheStore, Eviction, EvictionReason};
use super::{CacheEntry, CacheError, CacheKey, LoadOptions, Priority, ResourceLoader};
use crate::config::CacheConfig;
use crate::utils::futures::{CallOnDrop, m, measure};

type Resource<L> = <L as ResourceLoader>::Resource;

/// A memory-budgeted, pressure-aware cache of resources produced by a [`ResourceLoader`].
///
/// Requests for a key that is already resident are answered from memory. Concurrent requests for
/// a key that is not resident are coalesced into a single load, which runs on a spawned task;
/// its outcome is handed to every caller that asked in the meantime. Successful results are
/// stored, evicting other entries as needed to stay within the budget.
///
/// The cache is cheap to clone; all clones share the same state.
pub struct ResourceCache<L: ResourceLoader> {
    pub(super) inner: Arc<Inner<L>>,
}

impl<L: ResourceLoader> Clone for ResourceCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: ResourceLoader> fmt::Debug for ResourceCache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.inner.in_flight.read();
        let store = self.inner.store.read();
        f.debug_struct("ResourceCache")
            .field("config", &self.inner.config)
            .field("store", &*store)
            .field("in_flight", &*in_flight)
            .field("pressure", &self.inner.pressure.level())
            .finish()
    }
}

/// Shared state of a [`ResourceCache`].
///
/// Whenever both locks are needed, `in_flight` is locked before `store`.
pub(super) struct Inner<L: ResourceLoader> {
    pub(super) config: CacheConfig,
    loader: L,
    pub(super) store: RwLock<CacheStore<Resource<L>>>,
    pub(super) in_flight: RwLock<InFlightRegistry<Resource<L>>>,
    pub(super) pressure: PressureController,
    pub(super) counters: CacheCounters,
    /// Held for the duration of a sweep.
    pub(super) sweep_lock: Mutex<()>,
}

enum Lookup<R> {
    Hit(Arc<R>),
    Pending(LoadHandle<R>),
}

impl<L: ResourceLoader> ResourceCache<L> {
    pub fn new(config: CacheConfig, loader: L) -> Self {
        let budget = config.budget();
        tracing::debug!(
            budget,
            max_entry_count = config.max_entry_count,
            max_in_flight_tasks = config.max_in_flight_tasks,
            "creating resource cache"
        );

        let inner = Inner {
            store: RwLock::new(CacheStore::new(
                budget,
                config.max_entry_count,
                config.priorities,
            )),
            in_flight: RwLock::new(InFlightRegistry::new(
                config.max_in_flight_tasks,
                config.max_task_age,
            )),
            pressure: PressureController::new(config.pressure),
            counters: CacheCounters::default(),
            sweep_lock: Mutex::new(()),
            loader,
            config,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    /// Returns the resource for `key`, loading it if it is not resident.
    ///
    /// # Errors
    ///
    /// - [`CacheError::MemoryCritical`] if the key is not resident and pressure is critical.
    /// - [`CacheError::Overloaded`] if a new load would exceed the in-flight limit.
    /// - [`CacheError::LoadCancelled`] if the load was cancelled before it settled.
    /// - Any error of the loader, unchanged.
    pub async fn get_resource(
        &self,
        key: &CacheKey,
        priority: Priority,
    ) -> CacheEntry<Arc<Resource<L>>> {
        metric!(counter("caches.access") += 1);

        let hit = self.inner.store.read().get(key, Instant::now());
        if let Some(resource) = hit {
            self.inner.record_hit(key);
            return Ok(resource);
        }

        if self.inner.pressure.level() == PressureLevel::Critical {
            tracing::warn!(%key, "rejecting load under critical memory pressure");
            self.inner.record_rejected(&CacheError::MemoryCritical);
            return Err(CacheError::MemoryCritical);
        }

        match self.join_or_load(key, priority)? {
            Lookup::Hit(resource) => Ok(resource),
            Lookup::Pending(handle) => handle.wait().await,
        }
    }

    /// Builds the [`CacheKey`] for `identifier` and `options` and returns its resource.
    ///
    /// See [`get_resource`](Self::get_resource).
    pub async fn get_resource_for(
        &self,
        identifier: &str,
        options: &LoadOptions,
        priority: Priority,
    ) -> CacheEntry<Arc<Resource<L>>> {
        let key = CacheKey::new(identifier, options)?;
        self.get_resource(&key, priority).await
    }

    /// Starts loading `key` in the background unless it is resident already.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn preload(&self, key: CacheKey, priority: Priority) {
        if self.contains(&key) {
            return;
        }

        let cache = self.clone();
        let task = async move {
            if let Err(error) = cache.get_resource(&key, priority).await {
                tracing::warn!(%key, %error, "preload failed");
            }
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Whether `key` is resident, without counting as an access.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.store.read().contains(key)
    }

    /// Removes a single resident entry. Returns whether it was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let (evicted, previous, current) = {
            let mut store = self.inner.store.write();
            let mut evicted: Vec<_> = store.remove(key).into_iter().collect();
            let (previous, current) = self.inner.rebalance(&mut store, now, &mut evicted);
            (evicted, previous, current)
        };

        let removed = !evicted.is_empty();
        self.inner.publish(evicted, previous, current);
        removed
    }

    /// Drops every entry and pending load derived from `identifier`, regardless of load options.
    ///
    /// Returns the number of removed entries.
    pub fn invalidate(&self, identifier: &str) -> usize {
        let now = Instant::now();
        let (cancelled, evicted, previous, current) = {
            let mut in_flight = self.inner.in_flight.write();
            let cancelled = in_flight.cancel_where(|task| task.key().identifier() == identifier);

            let mut store = self.inner.store.write();
            let mut evicted = store.remove_where(
                |entry| entry.key().identifier() == identifier,
                EvictionReason::Invalidate,
            );
            let (previous, current) = self.inner.rebalance(&mut store, now, &mut evicted);
            (cancelled, evicted, previous, current)
        };

        let removed = evicted.len();
        tracing::debug!(identifier, removed, cancelled, "invalidated resource");
        self.inner.publish(evicted, previous, current);
        removed
    }

    /// Removes all entries, or only those of the given priority.
    ///
    /// Clearing without a filter also cancels every pending load.
    pub fn clear(&self, priority: Option<Priority>) {
        let now = Instant::now();
        let (cancelled, evicted, previous, current) = {
            let mut in_flight = self.inner.in_flight.write();
            let cancelled = match priority {
                None => in_flight.cancel_all(),
                Some(_) => 0,
            };

            let mut store = self.inner.store.write();
            let mut evicted = store.remove_where(
                |entry| priority.is_none_or(|priority| entry.priority() == priority),
                EvictionReason::Clear,
            );
            let (previous, current) = self.inner.rebalance(&mut store, now, &mut evicted);
            (cancelled, evicted, previous, current)
        };

        tracing::info!(
            priority = priority.map(Priority::as_str),
            removed = evicted.len(),
            cancelled,
            "cleared resource cache"
        );
        self.inner.publish(evicted, previous, current);
    }

    /// Forces an external memory pressure level.
    ///
    /// A level more severe than the current one shrinks the cache right away. At
    /// [`PressureLevel::Critical`], no new loads are started.
    pub fn set_memory_pressure(&self, level: PressureLevel) {
        let now = Instant::now();
        let (evicted, previous, current) = {
            let mut store = self.inner.store.write();
            let update = self.inner.pressure.set_pressure(level, &mut store, now);
            self.inner.report_gauges(&store);
            (update.evicted, update.previous, update.current)
        };

        self.inner.publish(evicted, previous, current);
    }

    /// The current effective pressure level.
    pub fn memory_pressure(&self) -> PressureLevel {
        self.inner.pressure.level()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let in_flight_count = self.inner.in_flight.read().len();
        let (entry_count, total_memory_usage, budget, utilization) = {
            let store = self.inner.store.read();
            (
                store.len(),
                store.total_memory_usage(),
                store.budget(),
                store.utilization(),
            )
        };

        let pressure_level = self.inner.pressure.level();
        let counters = self.inner.counters.snapshot();
        let hit_rate = self.inner.counters.hit_rate();
        let health = CacheHealth::evaluate(pressure_level, hit_rate, self.inner.counters.lookups());

        CacheStatistics {
            entry_count,
            in_flight_count,
            total_memory_usage,
            budget,
            utilization,
            pressure_level,
            hit_rate,
            health,
            counters,
        }
    }

    pub fn health(&self) -> CacheHealth {
        self.statistics().health
    }

    /// Joins the pending load of `key`, or registers and spawns a new one.
    fn join_or_load(
        &self,
        key: &CacheKey,
        priority: Priority,
    ) -> CacheEntry<Lookup<Resource<L>>> {
        let now = Instant::now();
        let mut in_flight = self.inner.in_flight.write();

        // a load may have settled between the first lookup and taking the lock
        let hit = self.inner.store.read().get(key, now);
        if let Some(resource) = hit {
            self.inner.record_hit(key);
            return Ok(Lookup::Hit(resource));
        }

        if let Some(handle) = in_flight.join(key) {
            self.inner.counters.record_coalesced();
            metric!(counter("caches.channel.hit") += 1);
            tracing::trace!(%key, "joining pending load");
            return Ok(Lookup::Pending(handle));
        }

        let pending = match in_flight.register(key.clone(), priority, now) {
            Ok(pending) => pending,
            Err(error) => {
                drop(in_flight);
                tracing::warn!(%key, %error, "rejecting load");
                self.inner.record_rejected(&error);
                return Err(error);
            }
        };
        drop(in_flight);

        self.inner.counters.record_miss();
        metric!(counter("caches.channel.miss") += 1);
        tracing::trace!(%key, %priority, "starting load");

        let handle = pending.handle.clone();
        self.spawn_load(key.clone(), priority, pending);
        Ok(Lookup::Pending(handle))
    }

    fn spawn_load(&self, key: CacheKey, priority: Priority, pending: PendingLoad<Resource<L>>) {
        let PendingLoad {
            id, sender, cancel, ..
        } = pending;
        let inner = Arc::clone(&self.inner);

        let task = async move {
            // deregisters the load if this task is aborted or panics
            let deregister = {
                let inner = Arc::clone(&inner);
                let key = key.clone();
                CallOnDrop::new(move || {
                    inner.in_flight.write().complete(&key, id);
                })
            };

            let result = tokio::select! {
                biased;

                _ = cancel.cancelled() => Err(CacheError::LoadCancelled),
                result = measure("caches.computation", m::cache_result, inner.loader.load(&key)) => {
                    result.map(Arc::new)
                }
            };

            let result = inner.settle(&key, id, priority, result);
            deregister.disarm();

            // all waiters may have gone away already
            let _ = sender.send(result);
        };

        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

impl<L: ResourceLoader> Inner<L> {
    /// Publishes the outcome of load `id` for `key`.
    ///
    /// A successful result is stored before the load is deregistered, so that a request issued
    /// after the waiters were woken finds it resident. Results of loads that were cancelled in the
    /// meantime are discarded.
    fn settle(
        &self,
        key: &CacheKey,
        id: u64,
        priority: Priority,
        result: CacheEntry<Arc<Resource<L>>>,
    ) -> CacheEntry<Arc<Resource<L>>> {
        let now = Instant::now();
        let mut in_flight = self.in_flight.write();
        if !in_flight.is_registered(key, id) {
            tracing::debug!(%key, "discarding result of cancelled load");
            return Err(CacheError::LoadCancelled);
        }

        self.counters.record_load(result.is_ok());
        let (evicted, previous, current) = match &result {
            Ok(resource) => {
                let memory_size = L::memory_size(resource);
                metric!(histogram("caches.resource.size") = memory_size);
                let mut store = self.store.write();

                let insertion =
                    store.insert(key.clone(), Arc::clone(resource), memory_size, priority, now);
                if !insertion.stored {
                    tracing::warn!(
                        %key,
                        memory_size,
                        budget = store.budget(),
                        "resource exceeds the cache budget, not caching it"
                    );
                    metric!(counter("caches.rejected") += 1, "reason" => "oversized");
                }

                let mut evicted = insertion.evicted;
                let (previous, current) = self.rebalance(&mut store, now, &mut evicted);
                (evicted, previous, current)
            }
            Err(error) => {
                tracing::debug!(%key, %error, "load failed");
                let level = self.pressure.level();
                (Vec::new(), level, level)
            }
        };

        in_flight.complete(key, id);
        drop(in_flight);

        self.publish(evicted, previous, current);
        result
    }

    /// Re-evaluates memory pressure after `store` was mutated.
    ///
    /// Returns the effective pressure level before and after.
    pub(super) fn rebalance(
        &self,
        store: &mut CacheStore<Resource<L>>,
        now: Instant,
        evicted: &mut Vec<Eviction<Resource<L>>>,
    ) -> (PressureLevel, PressureLevel) {
        let update = self.pressure.on_utilization_changed(store, now);
        evicted.extend(update.evicted);
        self.report_gauges(store);
        (update.previous, update.current)
    }

    fn report_gauges(&self, store: &CacheStore<Resource<L>>) {
        metric!(gauge("caches.memory.usage") = store.total_memory_usage());
        metric!(gauge("caches.memory.entries") = store.len() as u64);
        metric!(gauge("caches.pressure") = self.pressure.level() as u64);
    }

    /// Logs and counts evictions. Must be called without holding any lock, as this drops the
    /// evicted resources.
    pub(super) fn publish(
        &self,
        evicted: Vec<Eviction<Resource<L>>>,
        previous: PressureLevel,
        current: PressureLevel,
    ) {
        if previous != current {
            tracing::info!(%previous, %current, "memory pressure changed");
        }

        self.counters.record_evictions(evicted.len());
        for eviction in evicted {
            tracing::debug!(
                key = %eviction.key,
                reason = eviction.reason.as_str(),
                memory_size = eviction.memory_size,
                priority = %eviction.priority,
                "evicted resource"
            );
            metric!(counter("caches.eviction") += 1, "reason" => eviction.reason.as_str());
        }
    }

    fn record_hit(&self, key: &CacheKey) {
        self.counters.record_hit();
        metric!(counter("caches.memory.hit") += 1);
        tracing::trace!(%key, "cache hit");
    }

    fn record_rejected(&self, error: &CacheError) {
        self.counters.record_rejected();
        metric!(counter("caches.rejected") += 1, "reason" => error.metrics_tag());
    }
}
