use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::store::{CacheStore, Eviction, EvictionReason};
use crate::config::PressureConfig;

/// How close the cache is to exhausting its memory budget.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    #[default]
    Normal,
    Warning,
    Urgent,
    /// No new loads are started at this level.
    Critical,
}

impl PressureLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Urgent => "urgent",
            PressureLevel::Critical => "critical",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Warning,
            2 => PressureLevel::Urgent,
            _ => PressureLevel::Critical,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of a pressure evaluation.
#[must_use]
pub struct PressureUpdate<R> {
    /// The effective level before the evaluation.
    pub previous: PressureLevel,
    /// The effective level after the evaluation, and after any reduction it triggered.
    pub current: PressureLevel,
    pub evicted: Vec<Eviction<R>>,
}

/// Derives a [`PressureLevel`] from store utilization and shrinks the store when it rises.
///
/// The effective level is the more severe of the level derived from utilization and the level
/// last pushed from outside via [`set_pressure`](Self::set_pressure). Reading the level is
/// lock-free; evaluations require exclusive access to the store and are thus serialized by the
/// store lock.
#[derive(Debug)]
pub struct PressureController {
    config: PressureConfig,
    recorded: AtomicU8,
    external: AtomicU8,
}

impl PressureController {
    pub fn new(config: PressureConfig) -> Self {
        Self {
            config,
            recorded: AtomicU8::new(PressureLevel::Normal as u8),
            external: AtomicU8::new(PressureLevel::Normal as u8),
        }
    }

    /// Maps a utilization fraction to the level whose threshold it exceeds.
    pub fn level_for(&self, utilization: f64) -> PressureLevel {
        if utilization > self.config.critical_threshold {
            PressureLevel::Critical
        } else if utilization > self.config.urgent_threshold {
            PressureLevel::Urgent
        } else if utilization > self.config.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    /// The effective pressure level.
    pub fn level(&self) -> PressureLevel {
        self.recorded_level().max(self.external_level())
    }

    /// The level last pushed via [`set_pressure`](Self::set_pressure).
    pub fn external_level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.external.load(Ordering::Relaxed))
    }

    fn recorded_level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.recorded.load(Ordering::Relaxed))
    }

    /// Re-evaluates the level after the utilization of `store` changed.
    ///
    /// If the derived level rose above the previously recorded one, the store is shrunk to the
    /// reduction target of the effective level right away.
    pub fn on_utilization_changed<R>(
        &self,
        store: &mut CacheStore<R>,
        now: Instant,
    ) -> PressureUpdate<R> {
        let previous = self.level();
        let derived = self.level_for(store.utilization());

        let evicted = if derived > self.recorded_level() {
            self.reduce(derived.max(self.external_level()), store, now)
        } else {
            Vec::new()
        };
        self.record(store);

        PressureUpdate {
            previous,
            current: self.level(),
            evicted,
        }
    }

    /// Forces an external pressure level.
    ///
    /// A level more severe than the current effective level shrinks the store immediately. A less
    /// severe level only lowers the floor; evicted entries are never reloaded.
    pub fn set_pressure<R>(
        &self,
        level: PressureLevel,
        store: &mut CacheStore<R>,
        now: Instant,
    ) -> PressureUpdate<R> {
        let previous = self.level();
        self.external.store(level as u8, Ordering::Relaxed);

        let evicted = if level > previous {
            let evicted = self.reduce(level, store, now);
            self.record(store);
            evicted
        } else {
            Vec::new()
        };

        PressureUpdate {
            previous,
            current: self.level(),
            evicted,
        }
    }

    fn reduce<R>(
        &self,
        level: PressureLevel,
        store: &mut CacheStore<R>,
        now: Instant,
    ) -> Vec<Eviction<R>> {
        let factor = self.config.reduction_factor(level);
        let target = (store.budget() as f64 * factor) as u64;
        store.reduce_to(target, EvictionReason::Pressure, now)
    }

    fn record<R>(&self, store: &CacheStore<R>) {
        let level = self.level_for(store.utilization());
        self.recorded.store(level as u8, Ordering::Relaxed);
    }
}
