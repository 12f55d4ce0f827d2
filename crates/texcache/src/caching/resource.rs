use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{CacheEntry, CacheKey};

/// Produces the resources held by a [`ResourceCache`](super::ResourceCache).
///
/// The cache calls [`load`](Self::load) at most once per key at a time, on a spawned task. The
/// returned future may be dropped at any point when the load is cancelled.
pub trait ResourceLoader: 'static + Send + Sync {
    /// The produced resource. It is handed out to callers behind an `Arc`.
    type Resource: 'static + Send + Sync;

    /// Invoked to produce the resource identified by `key`.
    ///
    /// Errors are handed to every caller waiting on this load and are never retried by the cache.
    fn load<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, CacheEntry<Self::Resource>>;

    /// The number of bytes this resource occupies in the memory budget.
    ///
    /// This is computed once when the resource is inserted, and has to account for the memory the
    /// resource owns, not just its handle. [`TextureDescriptor::memory_size`] does that for
    /// textures.
    fn memory_size(resource: &Self::Resource) -> u64;
}

/// Pixel formats with a known per-pixel or per-block footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    R8,
    Rg8,
    Rgba8,
    Rgba16Float,
    Rgba32Float,
    /// 4x4 blocks of 8 bytes.
    Bc1,
    /// 4x4 blocks of 16 bytes.
    Bc3,
    /// 4x4 blocks of 16 bytes.
    Bc7,
}

impl PixelFormat {
    /// Returns the block edge length in pixels and the bytes per block.
    ///
    /// Uncompressed formats are treated as 1x1 blocks.
    fn block_layout(self) -> (u64, u64) {
        match self {
            PixelFormat::R8 => (1, 1),
            PixelFormat::Rg8 => (1, 2),
            PixelFormat::Rgba8 => (1, 4),
            PixelFormat::Rgba16Float => (1, 8),
            PixelFormat::Rgba32Float => (1, 16),
            PixelFormat::Bc1 => (4, 8),
            PixelFormat::Bc3 | PixelFormat::Bc7 => (4, 16),
        }
    }
}

/// The declared shape of a GPU texture, from which its memory footprint is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub mipmapped: bool,
}

impl TextureDescriptor {
    /// The number of mip levels, including the base level.
    pub fn mip_levels(&self) -> u32 {
        if !self.mipmapped {
            return 1;
        }
        let longest = self.width.max(self.height).max(1);
        u32::BITS - longest.leading_zeros()
    }

    /// Bytes occupied by the texture and its full mip chain.
    pub fn memory_size(&self) -> u64 {
        let (block, block_bytes) = self.pixel_format.block_layout();

        let mut width = u64::from(self.width.max(1));
        let mut height = u64::from(self.height.max(1));
        let mut total = 0;
        for _ in 0..self.mip_levels() {
            total += width.div_ceil(block) * height.div_ceil(block) * block_bytes;
            width = (width / 2).max(1);
            height = (height / 2).max(1);
        }
        total
    }
}
