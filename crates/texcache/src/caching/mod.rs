//! # Resource caching
//!
//! Producing a GPU-resident texture is expensive: the source has to be read, decoded and uploaded.
//! At the same time, the memory the host device grants for resident textures is tightly bounded.
//! This module contains the [`ResourceCache`], which turns "give me the resource for this key"
//! into a shared resource handle.
//!
//! ## Request flow
//!
//! A request goes through the following steps:
//! - First, the [`CacheStore`] is consulted. A resident entry is returned right away and its
//!   access bookkeeping is updated.
//! - If memory pressure is [`PressureLevel::Critical`], the request is refused with
//!   [`CacheError::MemoryCritical`] instead of starting new work.
//! - If a load for the same key is already running, the request joins it.
//! - Otherwise, a new load is registered in the [`InFlightRegistry`] and the [`ResourceLoader`]
//!   is invoked on a spawned task.
//! - When the load settles, a successful result is inserted into the store (possibly evicting
//!   other entries), the load is deregistered, and every waiting caller receives the same outcome.
//!
//! Failed loads are not cached and never retried by the cache; the next request starts a fresh
//! load.
//!
//! ## Eviction
//!
//! The store keeps the sum of entry sizes within its budget. When room is needed, entries are
//! evicted by a score combining idle time, size, access frequency and the eviction weight of their
//! [`Priority`]. The [`PressureController`] derives a pressure level from utilization after every
//! mutation and shrinks the store proportionally when the level rises. An external level can be
//! forced with [`ResourceCache::set_memory_pressure`].
//!
//! A periodic sweep (see [`ResourceCache::spawn_sweeper`]) removes entries that were idle for
//! longer than their priority allows.
//!
//! ### Metrics
//!
//! - `caches.access`: All requests.
//! - `caches.memory.hit`: Requests served from memory.
//! - `caches.channel.hit`: Requests that joined a running load.
//! - `caches.channel.miss`: Requests that started a new load.
//! - `caches.computation`: Timer of loads, tagged with their `status`.
//! - `caches.resource.size`: Size in bytes of every loaded resource.
//! - `caches.eviction`: Evicted entries, tagged with the `reason`.
//! - `caches.rejected`: Refused requests and oversized resources, tagged with the `reason`.
//! - `caches.memory.usage`, `caches.memory.entries` and `caches.pressure`: Gauges of the store.

mod cache_error;
mod cache_key;
mod cacher;
mod in_flight;
mod pressure;
mod priority;
mod resource;
mod stats;
mod store;
mod sweep;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, CacheKeyBuilder, LoadOptions, TextureUsage};
pub use cacher::ResourceCache;
pub use in_flight::{InFlightRegistry, LoadHandle, LoadingTask, PendingLoad};
pub use pressure::{PressureController, PressureLevel, PressureUpdate};
pub use priority::Priority;
pub use resource::{PixelFormat, ResourceLoader, TextureDescriptor};
pub use stats::{CacheCounters, CacheHealth, CacheStatistics, CounterSnapshot};
pub use store::{CacheStore, CachedEntry, Eviction, EvictionReason, Insertion};
pub use sweep::SweepStats;
