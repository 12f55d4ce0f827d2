use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::PressureLevel;

/// Hit rates below this are reported as degraded.
const DEGRADED_HIT_RATE: f64 = 0.5;
/// The hit rate is only meaningful after this many lookups.
const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 100;

/// Running counters of a cache, updated lock-free on every request.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
}

impl CacheCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A miss that joined an in-flight load.
    pub fn record_coalesced(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load(&self, success: bool) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// A request refused before any work started.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// The number of requests answered from memory or by a load.
    pub fn lookups(&self) -> u64 {
        self.hits.load(Ordering::Relaxed) + self.misses.load(Ordering::Relaxed)
    }

    /// `hits / (hits + misses)`, or `0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / lookups as f64
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CacheCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Misses that joined a load which was already running.
    pub coalesced: u64,
    /// Loads that settled, successful or not.
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    /// Requests refused because of critical pressure or too many loads in flight.
    pub rejected: u64,
}

/// Coarse health of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHealth {
    Healthy,
    /// Under urgent pressure, or serving too few requests from memory.
    Degraded,
    /// Under critical pressure and refusing new loads.
    Critical,
}

impl CacheHealth {
    pub fn evaluate(pressure: PressureLevel, hit_rate: f64, lookups: u64) -> Self {
        match pressure {
            PressureLevel::Critical => CacheHealth::Critical,
            PressureLevel::Urgent => CacheHealth::Degraded,
            _ if lookups >= MIN_LOOKUPS_FOR_HIT_RATE && hit_rate < DEGRADED_HIT_RATE => {
                CacheHealth::Degraded
            }
            _ => CacheHealth::Healthy,
        }
    }
}

/// A read-only view of the state of a [`ResourceCache`](super::ResourceCache).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub entry_count: usize,
    pub in_flight_count: usize,
    pub total_memory_usage: u64,
    pub budget: u64,
    pub utilization: f64,
    pub pressure_level: PressureLevel,
    pub hit_rate: f64,
    pub health: CacheHealth,
    pub counters: CounterSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let counters = CacheCounters::default();
        assert_eq!(counters.hit_rate(), 0.0);

        counters.record_hit();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        assert_eq!(counters.hit_rate(), 0.75);

        counters.record_coalesced();
        assert_eq!(counters.lookups(), 5);
        assert_eq!(counters.hit_rate(), 0.6);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.misses, 2);
        assert_eq!(snapshot.coalesced, 1);
    }

    #[test]
    fn test_health() {
        use CacheHealth::*;

        assert_eq!(CacheHealth::evaluate(PressureLevel::Normal, 0.0, 0), Healthy);
        assert_eq!(CacheHealth::evaluate(PressureLevel::Warning, 0.9, 1000), Healthy);
        assert_eq!(CacheHealth::evaluate(PressureLevel::Urgent, 0.9, 1000), Degraded);
        assert_eq!(CacheHealth::evaluate(PressureLevel::Critical, 0.9, 1000), Critical);

        // a low hit rate only counts once there were enough lookups
        assert_eq!(CacheHealth::evaluate(PressureLevel::Normal, 0.2, 99), Healthy);
        assert_eq!(CacheHealth::evaluate(PressureLevel::Normal, 0.2, 100), Degraded);
    }

    #[test]
    fn test_counters_serialize() {
        let counters = CacheCounters::default();
        counters.record_load(true);
        counters.record_load(false);
        counters.record_evictions(3);
        counters.record_rejected();

        let json = serde_json::to_string(&counters.snapshot()).unwrap();
        insta::assert_snapshot!(json, @r#"{"hits":0,"misses":0,"coalesced":0,"loads":2,"load_failures":1,"evictions":3,"rejected":1}"#);
    }
}
