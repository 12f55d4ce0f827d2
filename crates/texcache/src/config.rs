use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{PressureLevel, Priority};

const MIB: u64 = 1024 * 1024;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "texcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Per-priority overrides for the retention policy.
///
/// Unset values fall back to the defaults of the respective [`Priority`].
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriorityOverride {
    /// Multiplier applied to the eviction score. Higher means evicted sooner.
    pub eviction_weight: Option<f64>,

    /// Maximum duration an entry may stay unused before the sweep removes it.
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Option<Duration>,
}

/// The effective retention policy of one [`Priority`] class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriorityPolicy {
    pub eviction_weight: f64,
    pub max_idle_time: Duration,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriorityConfigs {
    pub low: PriorityOverride,
    pub normal: PriorityOverride,
    pub high: PriorityOverride,
    pub disposable: PriorityOverride,
}

impl PriorityConfigs {
    /// Resolves the retention policy for `priority`, applying configured overrides.
    pub fn policy(&self, priority: Priority) -> PriorityPolicy {
        let overrides = match priority {
            Priority::Low => &self.low,
            Priority::Normal => &self.normal,
            Priority::High => &self.high,
            Priority::Disposable => &self.disposable,
        };
        PriorityPolicy {
            eviction_weight: overrides
                .eviction_weight
                .unwrap_or_else(|| priority.default_eviction_weight()),
            max_idle_time: overrides
                .max_idle_time
                .unwrap_or_else(|| priority.default_max_idle_time()),
        }
    }
}

/// Utilization thresholds and reduction targets of the pressure controller.
///
/// Thresholds are fractions of the budget above which a level is entered. Reductions are the
/// fraction of the budget the cache shrinks to when the level is entered.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PressureConfig {
    pub warning_threshold: f64,
    pub urgent_threshold: f64,
    pub critical_threshold: f64,

    pub warning_reduction: f64,
    pub urgent_reduction: f64,
    pub critical_reduction: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.70,
            urgent_threshold: 0.85,
            critical_threshold: 0.95,
            warning_reduction: 0.70,
            urgent_reduction: 0.50,
            critical_reduction: 0.25,
        }
    }
}

impl PressureConfig {
    /// The fraction of the budget to keep once `level` is entered.
    pub fn reduction_factor(&self, level: PressureLevel) -> f64 {
        match level {
            PressureLevel::Normal => 1.0,
            PressureLevel::Warning => self.warning_reduction,
            PressureLevel::Urgent => self.urgent_reduction,
            PressureLevel::Critical => self.critical_reduction,
        }
        .clamp(0.0, 1.0)
    }
}

/// Configuration of the in-memory resource cache.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard memory budget in bytes.
    ///
    /// When unset, the budget is derived from [`recommended_working_set`](Self::recommended_working_set).
    pub budget_bytes: Option<u64>,

    /// The working-set size the host device recommends, in bytes.
    ///
    /// Capability detection is up to the embedder; the cache only uses the number.
    pub recommended_working_set: Option<u64>,

    /// Lower bound for the derived budget.
    ///
    /// Defaults to `64 MiB`.
    pub min_budget_bytes: u64,

    /// Maximum number of resident entries, independent of their size.
    ///
    /// Defaults to `500`.
    pub max_entry_count: usize,

    /// Maximum number of concurrently running loads.
    ///
    /// Defaults to `64`.
    pub max_in_flight_tasks: usize,

    /// Loads pending for longer than this are cancelled on the next registration.
    ///
    /// Defaults to `30s`.
    #[serde(with = "humantime_serde")]
    pub max_task_age: Duration,

    /// Interval of the maintenance sweep.
    ///
    /// Defaults to `60s`.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Per-priority eviction weights and idle lifetimes.
    pub priorities: PriorityConfigs,

    /// Pressure thresholds and reduction targets.
    pub pressure: PressureConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: None,
            recommended_working_set: None,
            min_budget_bytes: 64 * MIB,
            max_entry_count: 500,
            max_in_flight_tasks: 64,
            max_task_age: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            priorities: PriorityConfigs::default(),
            pressure: PressureConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Creates a default configuration with an explicit budget.
    pub fn with_budget(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: Some(budget_bytes),
            min_budget_bytes: 0,
            ..Default::default()
        }
    }

    /// The effective memory budget in bytes.
    ///
    /// An explicit `budget_bytes` wins, otherwise a quarter of the recommended working set is used,
    /// falling back to `512 MiB`. The result is never below `min_budget_bytes`.
    pub fn budget(&self) -> u64 {
        let budget = match (self.budget_bytes, self.recommended_working_set) {
            (Some(budget), _) => budget,
            (None, Some(working_set)) => working_set / 4,
            (None, None) => 512 * MIB,
        };
        budget.max(self.min_budget_bytes)
    }
}

/// The root configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    /// Configuration of the resource cache.
    pub cache: CacheConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
