use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use texcache::caching::ResourceCache;
use texcache::config::CacheConfig;
use tokio::sync::Semaphore;

use crate::workloads::{SyntheticLoader, WorkloadsConfig, prepare_workload};

#[derive(Default)]
struct WorkloadResults {
    durations: Mutex<DDSketch>,
    errors: AtomicU64,
}

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = ResourceCache::new(cache_config, SyntheticLoader::new(workloads.loader));
    let _sweeper = cache.spawn_sweeper();

    // initialize workloads
    let prepared: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| prepare_workload(i, workload).map(Arc::new))
        .collect::<Result<_>>()
        .context("failed to prepare workloads")?;

    // warmup: request the first texture of each workload once
    {
        let start = Instant::now();

        let futures = prepared.iter().map(|workload| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                if let Some(key) = workload.keys.first() {
                    let _ = cache.get_resource(key, workload.priority).await;
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + duration);

    // force external pressure levels at their scheduled offsets
    let pressure_events = workloads.pressure;
    let pressure_task = {
        let cache = cache.clone();
        tokio::spawn(async move {
            for event in pressure_events {
                let at = tokio::time::Instant::from_std(start + event.after);
                if at > deadline {
                    break;
                }
                tokio::time::sleep_until(at).await;
                println!("[{:?}] forcing {} memory pressure", start.elapsed(), event.level);
                cache.set_memory_pressure(event.level);
            }
        })
    };

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(prepared.len());
    for workload in prepared {
        let cache = cache.clone();

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let results = Arc::new(WorkloadResults::default());
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let index = rand::rng().random_range(0..workload.keys.len());
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let results = Arc::clone(&results);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let result = cache
                                .get_resource(&workload.keys[index], workload.priority)
                                .await;

                            transaction.finish();

                            if result.is_err() {
                                results.errors.fetch_add(1, Ordering::Relaxed);
                            }
                            results
                                .durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations = std::mem::take(
                &mut *results
                    .durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            (concurrency, durations, results.errors.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;
    pressure_task.abort();

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, durations, errors) = task.context("workload task panicked")?;
        print_workload(i, concurrency, &durations, errors, duration);
    }

    println!();
    let statistics = serde_yaml::to_string(&cache.statistics())
        .context("failed to serialize cache statistics")?;
    println!("Cache statistics:\n{statistics}");

    Ok(())
}

fn print_workload(
    index: usize,
    concurrency: usize,
    durations: &DDSketch,
    errors: u64,
    duration: Duration,
) {
    let ops = durations.count();
    let ops_ps = ops as f64 / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "Workload {index} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {errors} errors"
    );
    if ops == 0 {
        return;
    }

    let quantile = |q| {
        let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs.max(0.0))
    };
    let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
    let p50 = quantile(0.5);
    let p90 = quantile(0.9);
    let p99 = quantile(0.99);
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_short_run() {
        let workloads: WorkloadsConfig = serde_yaml::from_str(
            r#"
            loader:
              latency: 1ms
              jitter: 1ms
              failure_rate: 0.1
            workloads:
              - concurrency: 4
                key_space: 10
                edges: [64, 128]
            pressure:
              - after: 50ms
                level: critical
            "#,
        )
        .unwrap();

        perform_stresstest(
            CacheConfig::with_budget(1024 * 1024),
            workloads,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
    }
}
