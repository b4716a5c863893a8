use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use volumetric_cache::{CacheError, LargeObjectContainer, RegenerationCost};

use crate::{TestBuilder, frames, setup_cache};

#[tokio::test(flavor = "multi_thread")]
async fn test_loaded_entries_are_registered() {
    let harness = setup_cache(|config| config.regeneration_cost = RegenerationCost::High);
    let a = harness
        .cache
        .get_or_create(&frames(&harness.tracker, "1.3.6.30", 2))
        .unwrap();
    let b = harness
        .cache
        .get_or_create(&frames(&harness.tracker, "1.3.6.31", 3))
        .unwrap();

    // entries only register once their payload is resident
    assert!(harness.registry.is_empty());
    a.payload().unwrap();
    b.payload().unwrap();

    assert_eq!(harness.registry.len(), 2);
    assert_eq!(
        harness.registry.bytes_held(),
        5 * TestBuilder::SLICE_SIZE as u64
    );
    let entry = a.entry().unwrap();
    assert!(harness.registry.contains(entry.identifier()));
    assert_eq!(entry.regeneration_cost(), RegenerationCost::High);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pressure_unloads_but_keeps_entries() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.32", 2);
    let handle = harness.cache.get_or_create(&elements).unwrap();
    handle.payload().unwrap();

    let released = harness.registry.unload_all();
    assert_eq!(released, 2 * TestBuilder::SLICE_SIZE as u64);
    assert!(!handle.is_loaded());
    assert!(harness.registry.is_empty());

    // the entry itself survives, and regenerates its payload on the next access
    assert!(harness.cache.is_cached(&elements));
    assert_eq!(harness.tracker.live(), 2);
    handle.payload().unwrap();
    assert_eq!(harness.builder.builds(), 2);
    assert_eq!(harness.registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_locking_handle_pins_payload() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.33", 3);
    let handle = harness.cache.get_or_create(&elements).unwrap();
    let payload = handle.payload().unwrap();

    let lock = handle.create_reference(true).unwrap();
    assert!(lock.is_locking());
    assert!(!handle.is_locking());
    assert_eq!(lock, handle);
    assert!(handle.entry().unwrap().is_locked());

    assert_eq!(harness.registry.unload_all(), 0);
    assert!(!handle.unload().unwrap());
    assert!(handle.is_loaded());
    assert!(Arc::ptr_eq(&payload, &handle.payload().unwrap()));

    drop(lock);
    assert!(!handle.entry().unwrap().is_locked());
    assert_eq!(
        harness.registry.unload_all(),
        3 * TestBuilder::SLICE_SIZE as u64
    );
    assert!(!handle.is_loaded());
    assert_eq!(handle.entry().unwrap().reference_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_locks_are_counted() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.34", 1);
    let handle = harness.cache.get_or_create(&elements).unwrap();
    handle.payload().unwrap();

    let first = handle.create_reference(true).unwrap();
    let second = first.create_reference(true).unwrap();
    assert!(second.is_locking());

    drop(first);
    assert!(!handle.unload().unwrap());

    drop(second);
    assert!(handle.unload().unwrap());

    let entry = handle.entry().unwrap();
    assert_eq!(entry.unlock(), Err(CacheError::LockImbalance));
    assert!(!entry.is_locked());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pressure_during_load() {
    let harness = setup_cache(|_| {});
    harness.builder.set_latency(Duration::from_millis(10));
    let elements = frames(&harness.tracker, "1.3.6.35", 3);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    let task = handle.load_async().unwrap();
    // nothing is registered while the payload is being constructed
    assert_eq!(harness.registry.unload_all(), 0);
    task.wait().await.unwrap();

    assert!(handle.is_loaded());
    assert_eq!(harness.registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pressure_races_with_loads() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.36", 4);
    let handle = harness.cache.get_or_create(&elements).unwrap();
    let volume_size = 4 * TestBuilder::SLICE_SIZE;

    let done = AtomicBool::new(false);
    let released = std::thread::scope(|scope| {
        let pressure = scope.spawn(|| {
            let mut released = 0;
            while !done.load(Ordering::SeqCst) {
                released += harness.registry.unload_all();
                assert!(harness.registry.len() <= 1);
            }
            released
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let payload = handle.payload().unwrap();
                        assert_eq!(payload.slices.len(), 4);
                        assert_eq!(payload.voxels.len(), volume_size);
                        assert!(harness.registry.len() <= 1);
                    }
                })
            })
            .collect();
        // a panicking reader must still stop the pressure thread
        let results: Vec<_> = readers.into_iter().map(|r| r.join()).collect();
        done.store(true, Ordering::SeqCst);
        let released = pressure.join().unwrap();
        for result in results {
            result.unwrap();
        }
        released
    });

    let stats = harness.cache.stats();
    let entry = handle.entry().unwrap();
    assert_eq!(entry.reference_count(), 1);
    assert_eq!(harness.tracker.live(), 4);
    assert_eq!(harness.cache.len(), 1);
    assert_eq!(
        harness.builder.builds() as u64,
        stats.unloads + handle.is_loaded() as u64
    );
    assert_eq!(released, stats.unloads * volume_size as u64);
    assert_eq!(stats.construction_failures, 0);
}
