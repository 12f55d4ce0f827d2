use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use texcache::caching::{
    CacheEntry, CacheError, CacheKey, PixelFormat, ResourceCache, ResourceLoader,
    TextureDescriptor,
};
use texcache::config::{CacheConfig, PressureConfig};

/// A decoded texture as the integration tests see it.
#[derive(Debug)]
pub struct Texture {
    pub descriptor: TextureDescriptor,
}

/// Loads square RGBA textures whose edge length is encoded in the identifier, e.g. `tiles/512`.
#[derive(Debug, Default)]
pub struct SquareLoader {
    pub loads: AtomicUsize,
    pub latency: Duration,
}

impl SquareLoader {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ResourceLoader for SquareLoader {
    type Resource = Texture;

    fn load<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, CacheEntry<Texture>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;

            let edge = key
                .identifier()
                .rsplit('/')
                .next()
                .and_then(|edge| edge.parse().ok());
            let Some(edge) = edge else {
                return Err(CacheError::CacheKeyInvalid(format!(
                    "no edge length in {}",
                    key.identifier()
                )));
            };

            let descriptor = TextureDescriptor {
                width: edge,
                height: edge,
                pixel_format: PixelFormat::Rgba8,
                mipmapped: key.options_digest().contains("mipmaps=true"),
            };
            Ok(Texture { descriptor })
        })
    }

    fn memory_size(texture: &Texture) -> u64 {
        texture.descriptor.memory_size()
    }
}

/// A cache whose pressure thresholds are never reached.
pub fn setup_cache(budget: u64, latency: Duration) -> ResourceCache<SquareLoader> {
    texcache_test::setup();

    let config = CacheConfig {
        pressure: PressureConfig {
            warning_threshold: 2.0,
            urgent_threshold: 2.0,
            critical_threshold: 2.0,
            ..Default::default()
        },
        ..CacheConfig::with_budget(budget)
    };
    let loader = SquareLoader {
        latency,
        ..Default::default()
    };
    ResourceCache::new(config, loader)
}
