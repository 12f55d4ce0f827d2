use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use texcache::caching::{CacheError, LoadOptions, PressureLevel, Priority};

use crate::utils::setup_cache;

const MB: u64 = 1024 * 1024;

#[tokio::test]
async fn test_concurrent_requests_share_one_load() {
    let cache = setup_cache(64 * MB, Duration::from_millis(20));
    let options = LoadOptions::default();

    let requests = (0..16).map(|_| cache.get_resource_for("tiles/256", &options, Priority::Normal));
    let textures: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(cache.loader().loads(), 1);
    assert!(textures.iter().all(|t| Arc::ptr_eq(t, &textures[0])));
    assert_eq!(textures[0].descriptor.width, 256);

    let stats = cache.statistics();
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.total_memory_usage, 256 * 256 * 4);
    assert_eq!(stats.counters.coalesced, 15);
}

#[tokio::test]
async fn test_options_are_part_of_the_identity() {
    let cache = setup_cache(64 * MB, Duration::ZERO);

    let plain = cache
        .get_resource_for("tiles/256", &LoadOptions::default(), Priority::Normal)
        .await
        .unwrap();
    let mipmapped = cache
        .get_resource_for(
            "tiles/256",
            &LoadOptions {
                generate_mipmaps: true,
                ..Default::default()
            },
            Priority::Normal,
        )
        .await
        .unwrap();

    assert!(!plain.descriptor.mipmapped);
    assert!(mipmapped.descriptor.mipmapped);
    assert_eq!(cache.loader().loads(), 2);
    assert!(cache.statistics().total_memory_usage > 2 * 256 * 256 * 4);

    assert_eq!(cache.invalidate("tiles/256"), 2);
    assert_eq!(cache.statistics().entry_count, 0);
}

#[tokio::test]
async fn test_budget_is_respected() {
    // every 1024x1024 RGBA texture takes 4 MiB
    let cache = setup_cache(10 * MB, Duration::ZERO);

    for i in 0..8 {
        let identifier = format!("atlas-{i}/1024");
        cache
            .get_resource_for(&identifier, &LoadOptions::default(), Priority::Normal)
            .await
            .unwrap();

        let stats = cache.statistics();
        assert!(stats.total_memory_usage <= stats.budget);
    }

    let stats = cache.statistics();
    assert_eq!(stats.entry_count, 2);
    assert_eq!(stats.counters.evictions, 6);
}

#[tokio::test]
async fn test_loader_errors_are_surfaced() {
    let cache = setup_cache(10 * MB, Duration::ZERO);

    let result = cache
        .get_resource_for("tiles/huge", &LoadOptions::default(), Priority::Normal)
        .await;
    assert!(matches!(result, Err(CacheError::CacheKeyInvalid(_))));
    assert_eq!(cache.statistics().in_flight_count, 0);
}

#[tokio::test]
async fn test_pressure_round_trip() {
    let cache = setup_cache(16 * MB, Duration::ZERO);
    let options = LoadOptions::default();

    cache
        .get_resource_for("tiles/1024", &options, Priority::High)
        .await
        .unwrap();
    cache.set_memory_pressure(PressureLevel::Critical);

    let rejected = cache
        .get_resource_for("tiles/512", &options, Priority::Normal)
        .await;
    assert_eq!(rejected.unwrap_err(), CacheError::MemoryCritical);

    cache.set_memory_pressure(PressureLevel::Normal);
    cache
        .get_resource_for("tiles/512", &options, Priority::Normal)
        .await
        .unwrap();

    let stats = serde_json::to_value(cache.statistics()).unwrap();
    assert_eq!(stats["pressure_level"], "normal");
    assert_eq!(stats["health"], "healthy");
    assert_eq!(stats["counters"]["rejected"], 1);
}
