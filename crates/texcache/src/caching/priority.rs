use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retention class of a cached resource.
///
/// The priority decides how eagerly an entry is evicted under memory pressure (its eviction
/// weight) and how long it may stay unused before the maintenance sweep drops it (its maximum idle
/// time). Both can be overridden per class through
/// [`PriorityConfigs`](crate::config::PriorityConfigs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    /// Used once and thrown away, e.g. thumbnails of a scrubbed timeline.
    ///
    /// Disposable entries that were never reused are removed on the next sweep.
    Disposable,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Disposable,
    ];

    /// Multiplier applied to the eviction score. Higher means evicted sooner.
    pub fn default_eviction_weight(self) -> f64 {
        match self {
            Priority::Low => 2.0,
            Priority::Normal => 1.0,
            Priority::High => 0.25,
            Priority::Disposable => 4.0,
        }
    }

    /// How long an entry may remain unused before the sweep removes it.
    pub fn default_max_idle_time(self) -> Duration {
        match self {
            Priority::Low => Duration::from_secs(5 * 60),
            Priority::Normal => Duration::from_secs(30 * 60),
            Priority::High => Duration::from_secs(2 * 3600),
            Priority::Disposable => Duration::from_secs(60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Disposable => "disposable",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_priorities_are_more_evictable() {
        assert!(Priority::Disposable.default_eviction_weight() > Priority::Low.default_eviction_weight());
        assert!(Priority::Low.default_eviction_weight() > Priority::Normal.default_eviction_weight());
        assert!(Priority::Normal.default_eviction_weight() > Priority::High.default_eviction_weight());

        assert!(Priority::High.default_max_idle_time() > Priority::Normal.default_max_idle_time());
        assert!(Priority::Disposable.default_max_idle_time() < Priority::Low.default_max_idle_time());
    }

    #[test]
    fn test_priority_serde() {
        let priority: Priority = serde_json::from_str(r#""disposable""#).unwrap();
        assert_eq!(priority, Priority::Disposable);
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), r#""high""#);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
