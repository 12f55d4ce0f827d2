use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::{CacheKey, Priority};
use crate::config::PriorityConfigs;

const MIB: f64 = 1024.0 * 1024.0;
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Why an entry left the [`CacheStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Room was needed for a new entry.
    Budget,
    /// The entry count cap was exceeded.
    Count,
    /// Memory pressure rose and the store was shrunk.
    Pressure,
    /// The maintenance sweep found the entry idle for too long.
    Sweep,
    /// The source of the entry changed.
    Invalidate,
    Clear,
    /// Removed explicitly by key.
    Removed,
    /// A new resource was stored under the same key.
    Replaced,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::Budget => "budget",
            EvictionReason::Count => "count",
            EvictionReason::Pressure => "pressure",
            EvictionReason::Sweep => "sweep",
            EvictionReason::Invalidate => "invalidate",
            EvictionReason::Clear => "clear",
            EvictionReason::Removed => "removed",
            EvictionReason::Replaced => "replaced",
        }
    }
}

/// An entry that was removed from the store.
///
/// The resource is handed back so that it is dropped outside of the store lock.
pub struct Eviction<R> {
    pub key: CacheKey,
    pub resource: Arc<R>,
    pub memory_size: u64,
    pub priority: Priority,
    pub reason: EvictionReason,
}

impl<R> fmt::Debug for Eviction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eviction")
            .field("key", &self.key)
            .field("memory_size", &self.memory_size)
            .field("priority", &self.priority)
            .field("reason", &self.reason)
            .finish()
    }
}

/// The outcome of [`CacheStore::insert`].
#[must_use]
pub struct Insertion<R> {
    /// `false` if the resource is larger than the whole budget and was not kept.
    pub stored: bool,
    /// Entries that had to make room for the new one.
    pub evicted: Vec<Eviction<R>>,
}

/// A resource held by the [`CacheStore`] together with its bookkeeping.
///
/// Access bookkeeping is atomic so that hits only need shared access to the store.
pub struct CachedEntry<R> {
    resource: Arc<R>,
    key: CacheKey,
    memory_size: u64,
    priority: Priority,
    created_at: Instant,
    /// Nanoseconds since the store epoch.
    last_access: AtomicU64,
    access_count: AtomicU64,
    /// Store-wide access sequence; lower means less recently used.
    recency: AtomicU64,
}

impl<R> CachedEntry<R> {
    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of accesses, including the insertion itself.
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn recency(&self) -> u64 {
        self.recency.load(Ordering::Relaxed)
    }
}

/// The authoritative mapping from [`CacheKey`] to cached resource.
///
/// The store tracks the sum of all entry sizes and keeps it within its budget by evicting entries
/// in order of their eviction score:
///
/// ```text
/// idle hours * size in MiB * 1 / max(1, access count) * priority weight
/// ```
///
/// Highest scores leave first, ties are broken by evicting the least recently used entry.
///
/// The store does not synchronize by itself. Lookups take `&self`, every mutation takes
/// `&mut self`; the owner wraps it in a reader/writer lock.
pub struct CacheStore<R> {
    entries: HashMap<CacheKey, CachedEntry<R>>,
    total_memory_usage: u64,
    budget: u64,
    max_entry_count: usize,
    priorities: PriorityConfigs,
    epoch: Instant,
    sequence: AtomicU64,
}

impl<R> fmt::Debug for CacheStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.entries.len())
            .field("total_memory_usage", &self.total_memory_usage)
            .field("budget", &self.budget)
            .field("max_entry_count", &self.max_entry_count)
            .finish()
    }
}

impl<R> CacheStore<R> {
    pub fn new(budget: u64, max_entry_count: usize, priorities: PriorityConfigs) -> Self {
        Self {
            entries: HashMap::new(),
            total_memory_usage: 0,
            budget,
            max_entry_count: max_entry_count.max(1),
            priorities,
            epoch: Instant::now(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// The sum of the memory sizes of all entries.
    pub fn total_memory_usage(&self) -> u64 {
        self.total_memory_usage
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The fraction of the budget in use.
    pub fn utilization(&self) -> f64 {
        if self.budget == 0 {
            return if self.total_memory_usage > 0 { 1.0 } else { 0.0 };
        }
        self.total_memory_usage as f64 / self.budget as f64
    }

    /// Looks up `key`, recording an access at `now` on a hit.
    pub fn get(&self, key: &CacheKey, now: Instant) -> Option<Arc<R>> {
        let entry = self.entries.get(key)?;

        entry.last_access.fetch_max(self.ticks(now), Ordering::Relaxed);
        entry.access_count.fetch_add(1, Ordering::Relaxed);
        entry
            .recency
            .fetch_max(self.next_sequence(), Ordering::Relaxed);

        Some(Arc::clone(&entry.resource))
    }

    /// Whether `key` is present, without counting as an access.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CachedEntry<R>> {
        self.entries.values()
    }

    /// Stores `resource` under `key`, evicting entries as needed.
    ///
    /// A resource larger than the whole budget is not stored. Otherwise entries are evicted by
    /// score until the new entry fits, and the least recently used entries are evicted while the
    /// entry count cap is exceeded. A previous entry under the same key is replaced.
    pub fn insert(
        &mut self,
        key: CacheKey,
        resource: Arc<R>,
        memory_size: u64,
        priority: Priority,
        now: Instant,
    ) -> Insertion<R> {
        let mut evicted = Vec::new();
        evicted.extend(self.remove_entry(&key, EvictionReason::Replaced));

        if memory_size > self.budget {
            return Insertion {
                stored: false,
                evicted,
            };
        }

        if self.total_memory_usage + memory_size > self.budget {
            for victim in self.eviction_order(now) {
                if self.total_memory_usage + memory_size <= self.budget {
                    break;
                }
                evicted.extend(self.remove_entry(&victim, EvictionReason::Budget));
            }
        }

        let entry = CachedEntry {
            resource,
            key: key.clone(),
            memory_size,
            priority,
            created_at: now,
            last_access: AtomicU64::new(self.ticks(now)),
            access_count: AtomicU64::new(1),
            recency: AtomicU64::new(self.next_sequence()),
        };
        self.entries.insert(key, entry);
        self.total_memory_usage += memory_size;

        if self.entries.len() > self.max_entry_count {
            let excess = self.entries.len() - self.max_entry_count;
            let mut by_recency: Vec<_> = self
                .entries
                .values()
                .map(|entry| (entry.recency(), entry.key.clone()))
                .collect();
            by_recency.sort_unstable_by_key(|(recency, _)| *recency);

            // the new entry has the highest sequence and is never among the excess
            for (_, victim) in by_recency.into_iter().take(excess) {
                evicted.extend(self.remove_entry(&victim, EvictionReason::Count));
            }
        }

        Insertion {
            stored: true,
            evicted,
        }
    }

    /// Evicts entries by score until at most `target` bytes are in use.
    pub fn reduce_to(
        &mut self,
        target: u64,
        reason: EvictionReason,
        now: Instant,
    ) -> Vec<Eviction<R>> {
        let mut evicted = Vec::new();
        if self.total_memory_usage <= target {
            return evicted;
        }

        for victim in self.eviction_order(now) {
            if self.total_memory_usage <= target {
                break;
            }
            evicted.extend(self.remove_entry(&victim, reason));
        }
        evicted
    }

    /// Removes a single entry.
    pub fn remove(&mut self, key: &CacheKey) -> Option<Eviction<R>> {
        self.remove_entry(key, EvictionReason::Removed)
    }

    /// Removes every entry matching `predicate`.
    pub fn remove_where<F>(&mut self, mut predicate: F, reason: EvictionReason) -> Vec<Eviction<R>>
    where
        F: FnMut(&CachedEntry<R>) -> bool,
    {
        let victims: Vec<_> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.key.clone())
            .collect();

        victims
            .iter()
            .filter_map(|key| self.remove_entry(key, reason))
            .collect()
    }

    /// Removes entries that outlived the idle time of their priority, and [`Priority::Disposable`]
    /// entries that were never reused after their creation.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<Eviction<R>> {
        let victims: Vec<_> = self
            .entries
            .values()
            .filter(|entry| self.is_expired(entry, now))
            .map(|entry| entry.key.clone())
            .collect();

        victims
            .iter()
            .filter_map(|key| self.remove_entry(key, EvictionReason::Sweep))
            .collect()
    }

    /// How long `entry` has not been accessed as of `now`.
    pub fn idle_time(&self, entry: &CachedEntry<R>, now: Instant) -> Duration {
        let last_access = entry.last_access.load(Ordering::Relaxed);
        Duration::from_nanos(self.ticks(now).saturating_sub(last_access))
    }

    fn is_expired(&self, entry: &CachedEntry<R>, now: Instant) -> bool {
        let policy = self.priorities.policy(entry.priority);
        if self.idle_time(entry, now) > policy.max_idle_time {
            return true;
        }
        entry.priority == Priority::Disposable && entry.access_count() <= 1
    }

    fn eviction_score(&self, entry: &CachedEntry<R>, now: Instant) -> f64 {
        let idle_hours = self.idle_time(entry, now).as_secs_f64() / SECONDS_PER_HOUR;
        let size_mib = entry.memory_size as f64 / MIB;
        let frequency = 1.0 / entry.access_count().max(1) as f64;
        let weight = self.priorities.policy(entry.priority).eviction_weight;

        idle_hours * size_mib * frequency * weight
    }

    /// All keys, the best eviction candidate first.
    fn eviction_order(&self, now: Instant) -> Vec<CacheKey> {
        let mut candidates: Vec<_> = self
            .entries
            .values()
            .map(|entry| (self.eviction_score(entry, now), entry.recency(), &entry.key))
            .collect();

        candidates.sort_by(|(score_a, recency_a, _), (score_b, recency_b, _)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| recency_a.cmp(recency_b))
        });

        candidates
            .into_iter()
            .map(|(_, _, key)| key.clone())
            .collect()
    }

    fn remove_entry(&mut self, key: &CacheKey, reason: EvictionReason) -> Option<Eviction<R>> {
        let entry = self.entries.remove(key)?;
        self.total_memory_usage -= entry.memory_size;

        Some(Eviction {
            key: entry.key,
            resource: entry.resource,
            memory_size: entry.memory_size,
            priority: entry.priority,
            reason,
        })
    }

    fn ticks(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}
