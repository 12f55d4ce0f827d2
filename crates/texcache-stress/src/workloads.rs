use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use texcache::caching::{
    CacheEntry, CacheError, CacheKey, LoadOptions, PixelFormat, PressureLevel, Priority,
    ResourceLoader, TextureDescriptor,
};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    #[serde(default)]
    pub loader: LoaderConfig,
    pub workloads: Vec<Workload>,
    /// External pressure levels forced at fixed offsets into the run.
    #[serde(default)]
    pub pressure: Vec<PressureEvent>,
}

impl WorkloadsConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        serde_yaml::from_reader(file).context("failed to parse workloads YAML")
    }
}

/// Behavior of the synthetic loader.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Base latency of every load.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Additional uniformly distributed latency.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    /// Probability of a load failing.
    pub failure_rate: f64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(5),
            jitter: Duration::from_millis(5),
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of distinct textures requested by this workload.
    pub key_space: usize,
    #[serde(default)]
    pub priority: Priority,
    /// Edge lengths of the requested square textures; one is picked per key.
    #[serde(default = "default_edges")]
    pub edges: Vec<u32>,
    #[serde(default)]
    pub options: LoadOptions,
}

fn default_edges() -> Vec<u32> {
    vec![256, 512, 1024]
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PressureEvent {
    #[serde(with = "humantime_serde")]
    pub after: Duration,
    pub level: PressureLevel,
}

/// A request that a workload sends over and over.
#[derive(Debug, Clone)]
pub struct PreparedWorkload {
    pub concurrency: usize,
    pub priority: Priority,
    pub keys: Vec<CacheKey>,
}

/// Builds the key space of workload `index`.
///
/// Identifiers look like `w{index}/{n}/{edge}`, where the edge length is what the
/// [`SyntheticLoader`] decodes the texture size from.
pub fn prepare_workload(index: usize, workload: Workload) -> Result<PreparedWorkload> {
    let mut rng = rand::rng();
    let edges = if workload.edges.is_empty() {
        default_edges()
    } else {
        workload.edges
    };

    let keys = (0..workload.key_space.max(1))
        .map(|n| {
            let edge = edges.choose(&mut rng).copied().unwrap_or(256);
            let identifier = format!("w{index}/{n}/{edge}");
            CacheKey::new(&identifier, &workload.options)
                .with_context(|| format!("invalid identifier {identifier}"))
        })
        .collect::<Result<_>>()?;

    Ok(PreparedWorkload {
        concurrency: workload.concurrency.max(1),
        priority: workload.priority,
        keys,
    })
}

/// A decoded texture; only its shape is kept.
#[derive(Debug)]
pub struct SyntheticTexture {
    pub descriptor: TextureDescriptor,
}

/// A loader that sleeps instead of decoding, and fails at random.
#[derive(Debug)]
pub struct SyntheticLoader {
    config: LoaderConfig,
}

impl SyntheticLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }
}

impl ResourceLoader for SyntheticLoader {
    type Resource = SyntheticTexture;

    fn load<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, CacheEntry<SyntheticTexture>> {
        // `ThreadRng` must not be held across the sleep
        let (delay, fail) = {
            let mut rng = rand::rng();
            let jitter = self.config.jitter.mul_f64(rng.random::<f64>());
            let fail = rng.random_bool(self.config.failure_rate.clamp(0.0, 1.0));
            (self.config.latency + jitter, fail)
        };

        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if fail {
                return Err(CacheError::LoadFailed(format!(
                    "synthetic failure loading {}",
                    key.identifier()
                )));
            }

            let edge = key
                .identifier()
                .rsplit('/')
                .next()
                .and_then(|edge| edge.parse().ok());
            let Some(edge) = edge else {
                return Err(CacheError::CacheKeyInvalid(key.identifier().to_owned()));
            };

            Ok(SyntheticTexture {
                descriptor: TextureDescriptor {
                    width: edge,
                    height: edge,
                    pixel_format: PixelFormat::Rgba8,
                    mipmapped: key.options_digest().contains("mipmaps=true"),
                },
            })
        })
    }

    fn memory_size(texture: &SyntheticTexture) -> u64 {
        texture.descriptor.memory_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_workload() {
        let config: WorkloadsConfig = serde_yaml::from_str(
            r#"
            workloads:
              - concurrency: 4
                key_space: 3
                priority: high
                edges: [512]
            pressure:
              - after: 2s
                level: urgent
            "#,
        )
        .unwrap();
        assert_eq!(config.loader.failure_rate, 0.0);
        assert_eq!(config.pressure[0].after, Duration::from_secs(2));
        assert_eq!(config.pressure[0].level, PressureLevel::Urgent);

        let workload = config.workloads.into_iter().next().unwrap();
        let prepared = prepare_workload(7, workload).unwrap();
        assert_eq!(prepared.priority, Priority::High);
        let identifiers: Vec<_> = prepared.keys.iter().map(|k| k.identifier()).collect();
        assert_eq!(identifiers, ["w7/0/512", "w7/1/512", "w7/2/512"]);
    }

    #[tokio::test]
    async fn test_synthetic_textures_are_sized_by_edge() {
        let loader = SyntheticLoader::new(LoaderConfig {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            failure_rate: 0.0,
        });

        let key = CacheKey::new("w0/1/256", &LoadOptions::default()).unwrap();
        let texture = loader.load(&key).await.unwrap();
        assert_eq!(SyntheticLoader::memory_size(&texture), 256 * 256 * 4);

        let key = CacheKey::new("w0/1/huge", &LoadOptions::default()).unwrap();
        let error = loader.load(&key).await.unwrap_err();
        assert!(matches!(error, CacheError::CacheKeyInvalid(_)));
    }
}
