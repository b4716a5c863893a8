use std::sync::{Arc, Mutex};
use std::time::Duration;

use volumetric_cache::{CacheError, LargeObjectContainer};

use crate::{frames, setup_cache};

#[tokio::test(flavor = "multi_thread")]
async fn test_unload_and_reload() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.20", 3);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    // nothing to unload yet
    assert!(!handle.unload().unwrap());

    let first = handle.payload().unwrap();
    let entry = handle.entry().unwrap();
    assert_eq!(entry.bytes_held(), first.voxels.len() as u64);
    assert_eq!(entry.large_object_count(), 3);

    assert!(handle.unload().unwrap());
    assert!(!handle.is_loaded());
    assert_eq!(entry.bytes_held(), 0);
    assert_eq!(entry.large_object_count(), 0);
    assert_eq!(entry.reference_count(), 1);
    assert_eq!(harness.tracker.live(), 3);

    let second = handle.payload().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first, second);
    assert_eq!(harness.builder.builds(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_construction_failure_is_recoverable() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.21", 2);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    harness.builder.fail_builds(true);
    let err = handle.payload().unwrap_err();
    let CacheError::Construction(message) = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(message.contains("no pixel data in 1.3.6.21.0"), "{message}");
    assert!(!handle.is_loaded());
    assert_eq!(handle.progress().unwrap(), 0.0);
    assert!(harness.registry.is_empty());

    harness.builder.fail_builds(false);
    let payload = handle.payload().unwrap();
    assert_eq!(payload.slices.len(), 2);
    assert_eq!(harness.builder.builds(), 2);
    assert_eq!(harness.cache.stats().construction_failures, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_construction_panic_is_caught() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.22", 2);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    harness.builder.panic_builds(true);
    let err = handle.payload().unwrap_err();
    assert!(err.to_string().contains("slice 0 is corrupt"), "{err}");

    harness.builder.panic_builds(false);
    assert!(handle.payload().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_weight_panic_is_caught() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.28", 3);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    harness.builder.panic_weights(true);
    let err = handle.payload().unwrap_err();
    let CacheError::Construction(message) = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(message.contains("cannot weigh 3 slices"), "{message}");
    assert!(!handle.is_loaded());
    assert!(harness.registry.is_empty());
    assert_eq!(harness.cache.stats().construction_failures, 1);

    // the entry is still usable afterwards
    harness.builder.panic_weights(false);
    let payload = handle.payload().unwrap();
    assert_eq!(payload.slices.len(), 3);
    assert_eq!(harness.registry.len(), 1);

    drop(handle);
    harness.cache.wait_for_teardowns(1).await;
    assert!(harness.cache.is_empty());
    assert_eq!(harness.tracker.live(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_is_reported() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.23", 4);
    let handle = harness.cache.get_or_create(&elements).unwrap();
    assert_eq!(handle.progress().unwrap(), 0.0);

    let mut reported = vec![];
    handle.load(|done, total| reported.push((done, total))).unwrap();
    assert_eq!(reported, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
    assert_eq!(handle.progress().unwrap(), 100.0);

    // already loaded, so no progress is reported again
    reported.clear();
    handle.load(|done, total| reported.push((done, total))).unwrap();
    assert!(reported.is_empty());

    handle.unload().unwrap();
    assert_eq!(handle.progress().unwrap(), 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_subscription() {
    let harness = setup_cache(|_| {});
    harness.builder.set_latency(Duration::from_millis(5));
    let elements = frames(&harness.tracker, "1.3.6.24", 4);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    let mut progress = handle.subscribe_progress().unwrap();
    let observed = Arc::new(Mutex::new(vec![]));
    let observer = {
        let observed = observed.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let current = *progress.borrow_and_update();
                observed.lock().unwrap().push(current);
                if current >= 100.0 {
                    break;
                }
            }
        })
    };

    handle.load_async().unwrap().wait().await.unwrap();
    observer.await.unwrap();

    let observed = observed.lock().unwrap();
    assert_eq!(observed.last(), Some(&100.0));
    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{observed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_async_single_flight() {
    let harness = setup_cache(|_| {});
    harness.builder.set_latency(Duration::from_millis(20));
    let elements = frames(&harness.tracker, "1.3.6.25", 3);

    let first = harness.cache.get_or_create(&elements).unwrap();
    let second = harness.cache.get_or_create(&elements).unwrap();

    let tasks = vec![
        first.load_async().unwrap(),
        second.load_async().unwrap(),
        first.load_async().unwrap(),
    ];
    assert!(tasks.iter().all(|task| !task.was_loaded()));

    // a synchronous load joins the flight as well
    let payload = second.payload().unwrap();
    for result in futures::future::join_all(tasks.into_iter().map(|task| task.wait())).await {
        result.unwrap();
    }

    assert_eq!(harness.builder.builds(), 1);
    assert_eq!(payload.slices.len(), 3);
    assert!(first.load_async().unwrap().was_loaded());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_async_failure() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.26", 1);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    harness.builder.fail_builds(true);
    let err = handle.load_async().unwrap().wait().await.unwrap_err();
    assert!(err.is_recoverable());
    assert!(!handle.is_loaded());

    harness.builder.fail_builds(false);
    handle.load_async().unwrap().wait().await.unwrap();
    assert!(handle.is_loaded());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_access_time_is_refreshed() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.27", 1);
    let handle = harness.cache.get_or_create(&elements).unwrap();

    handle.payload().unwrap();
    let loaded_at = handle.entry().unwrap().last_access_time();
    tokio::time::sleep(Duration::from_millis(5)).await;
    handle.payload().unwrap();
    assert!(handle.entry().unwrap().last_access_time() > loaded_at);
}
