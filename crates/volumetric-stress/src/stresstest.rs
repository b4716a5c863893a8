use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use volumetric_cache::config::Config;
use volumetric_cache::{MemoryRegistry, VolumeCache};
use volumetric_test::{TestBuilder, Tracker};

use crate::workloads::{WorkloadsConfig, prepare_workload, process_workload};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // start the cache
    let runtime = tokio::runtime::Handle::current();
    let builder = TestBuilder::new();
    builder.set_latency(workloads.build_latency);
    let registry = Arc::new(MemoryRegistry::new());
    let cache = Arc::new(VolumeCache::new(
        &config.cache,
        builder.clone(),
        registry.clone(),
        runtime,
    ));
    let tracker = Tracker::new();

    // initialize workloads
    let prepared: Vec<_> = workloads
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| {
            let prepared = prepare_workload(i, &tracker, workload);
            (workload.concurrency.max(1), Arc::new(prepared))
        })
        .collect();

    // warmup: run each workload once to make sure the code paths are warm
    {
        let start = Instant::now();

        let futures = prepared.iter().map(|(_, workload)| {
            let cache = Arc::clone(&cache);
            let workload = Arc::clone(workload);
            tokio::task::spawn_blocking(move || process_workload(&cache, &workload, 0))
        });

        for result in futures::future::join_all(futures).await {
            result.context("warmup task panicked")??;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // simulate memory pressure in the background
    let pressure_events = Arc::new(AtomicU64::new(0));
    let bytes_released = Arc::new(AtomicU64::new(0));
    let pressure = workloads.pressure_interval.map(|period| {
        let registry = Arc::clone(&registry);
        let pressure_events = Arc::clone(&pressure_events);
        let bytes_released = Arc::clone(&bytes_released);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let registry = Arc::clone(&registry);
                let released = tokio::task::spawn_blocking(move || registry.unload_all())
                    .await
                    .unwrap_or_default();
                pressure_events.fetch_add(1, Ordering::Relaxed);
                bytes_released.fetch_add(released, Ordering::Relaxed);
            }
        })
    });

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(prepared.len());
    for (concurrency, workload) in prepared.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = Arc::clone(&cache);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut iteration = 0;

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = Arc::clone(&cache);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();
                        iteration += 1;

                        tokio::task::spawn_blocking(move || {
                            if let Err(error) = process_workload(&cache, &workload, iteration) {
                                let dynerr: &dyn std::error::Error = error.as_ref();
                                tracing::error!(error = dynerr, "Workload operation failed");
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;
    if let Some(pressure) = pressure {
        pressure.abort();
    }

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, failures) = task.context("workload task panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failures"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let value = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(value)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!(
        "Memory pressure: {} events, {} bytes released",
        pressure_events.load(Ordering::Relaxed),
        bytes_released.load(Ordering::Relaxed)
    );

    // all operations released their references, so every entry is being torn down
    let teardown = async {
        while !cache.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(30), teardown)
        .await
        .context("timed out waiting for teardowns")?;

    let stats = cache.stats();
    println!(
        "Cache: {} constructions ({} failed), {} unloads, {} teardowns ({} release failures)",
        stats.constructions,
        stats.construction_failures,
        stats.unloads,
        stats.teardowns,
        stats.teardown_failures
    );
    println!(
        "Builder: {} builds; Sources: {} acquired, {} leaked",
        builder.builds(),
        tracker.acquired(),
        tracker.live()
    );
    anyhow::ensure!(tracker.live() == 0, "source references were leaked");

    Ok(())
}
