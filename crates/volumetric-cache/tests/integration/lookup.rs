use std::sync::Arc;
use std::time::Duration;

use volumetric_cache::{Fingerprint, SourceElement};

use crate::{TestBuilder, TestFrame, TestVolume, Tracker, frames, setup_cache};

#[tokio::test(flavor = "multi_thread")]
async fn test_fingerprint_equality() {
    let harness = setup_cache(|_| {});
    let tracker = &harness.tracker;

    let a = frames(tracker, "1.3.6.1", 3);
    let b = frames(tracker, "1.3.6.1", 3);
    assert_eq!(Fingerprint::compute(&a), Fingerprint::compute(&b));

    let mut reversed = a.clone();
    reversed.reverse();
    assert_ne!(Fingerprint::compute(&a), Fingerprint::compute(&reversed));
    assert_ne!(Fingerprint::compute(&a), Fingerprint::compute(&a[..2]));

    // a different frame of the same instance is a different element
    let mut other_frame = a.clone();
    other_frame[1] = TestFrame::new(tracker, "1.3.6.1", "1.3.6.1.1", 2);
    assert_ne!(Fingerprint::compute(&a), Fingerprint::compute(&other_frame));

    let metadata = Fingerprint::compute(&a[..1]);
    insta::assert_snapshot!(metadata.metadata(), @r###"
    group: "1.2.840.113619" "1.3.6.1"
    element: "1.3.6.1.0" "1"
    "###);

    // computing fingerprints never acquires any references
    assert_eq!(tracker.acquired(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_lookups_share_one_entry() {
    let harness = setup_cache(|_| {});
    harness.builder.set_latency(Duration::from_millis(10));
    let elements = frames(&harness.tracker, "1.3.6.2", 4);

    let handles: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let handle = harness.cache.get_or_create(&elements).unwrap();
                    let payload = handle.payload().unwrap();
                    (handle, payload)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(harness.cache.len(), 1);
    assert_eq!(harness.builder.builds(), 1);
    assert_eq!(harness.tracker.acquired(), 4);

    let (first, payload) = &handles[0];
    assert_eq!(first.entry().unwrap().reference_count(), 8);
    for (handle, other) in &handles[1..] {
        assert_eq!(handle, first);
        assert!(Arc::ptr_eq(payload, other));
    }
    assert_eq!(payload.slices.len(), 4);
    assert_eq!(payload.voxels.len(), 4 * TestBuilder::SLICE_SIZE);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lookup_does_not_construct() {
    let harness = setup_cache(|_| {});
    let elements = frames(&harness.tracker, "1.3.6.3", 2);

    let handle = harness.cache.get_or_create(&elements).unwrap();
    assert!(!handle.is_loaded());
    assert_eq!(harness.builder.builds(), 0);
    assert!(harness.cache.is_cached(&elements));
    assert!(harness.cache.contains(handle.fingerprint().unwrap()));
    assert!(!harness.cache.is_cached(&elements[..1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_sources_are_rejected() {
    let harness = setup_cache(|_| {});
    let mut elements = frames(&harness.tracker, "1.3.6.4", 3);
    elements.push(TestFrame::new(&harness.tracker, "1.3.6.4", "1.3.6.4.9", 0));

    let err = harness.cache.get_or_create(&elements).unwrap_err();
    assert!(err.is_recoverable());
    assert!(err.to_string().contains("invalid frame number"), "{err}");

    assert!(harness.cache.is_empty());
    assert_eq!(harness.tracker.acquired(), 4);
    assert_eq!(harness.tracker.live(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_sources_are_contained() {
    let harness = setup_cache(|_| {});
    let tracker = &harness.tracker;
    let elements = frames(tracker, "1.3.6.6", 3);

    // the third frame cannot be acquired
    tracker.panic_acquires_after(Some(2));
    let err = harness.cache.get_or_create(&elements).unwrap_err();
    assert!(err.is_recoverable());
    assert!(err.to_string().contains("1.3.6.6.2 is unavailable"), "{err}");
    assert_eq!(tracker.acquired(), 2);
    assert_eq!(tracker.live(), 0);
    assert!(harness.cache.is_empty());
    tracker.panic_acquires_after(None);

    harness.builder.panic_validations(true);
    let err = harness.cache.get_or_create(&elements).unwrap_err();
    assert!(err.to_string().contains("header is corrupt"), "{err}");
    assert_eq!(tracker.live(), 0);
    assert!(harness.cache.is_empty());
    harness.builder.panic_validations(false);

    // the table lock is still usable afterwards
    let handle = harness.cache.get_or_create(&elements).unwrap();
    assert_eq!(handle.payload().unwrap().slices.len(), 3);
    drop(handle);

    tokio::time::timeout(Duration::from_secs(10), harness.cache.wait_for_teardowns(1))
        .await
        .unwrap();
    assert!(harness.cache.is_empty());
    assert_eq!(tracker.live(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_source_list() {
    let harness = setup_cache(|_| {});
    let empty: Vec<TestFrame> = vec![];

    let handle = harness.cache.get_or_create(&empty).unwrap();
    let again = harness.cache.get_or_create(&empty).unwrap();
    assert_eq!(handle, again);

    let payload = handle.payload().unwrap();
    assert_eq!(
        *payload,
        TestVolume {
            slices: vec![],
            voxels: vec![],
        }
    );
    assert_eq!(handle.progress().unwrap(), 100.0);
}

#[test]
fn test_identity_tokens() {
    let tracker = Tracker::new();
    let frame = TestFrame::new(&tracker, "1.3.6.5", "1.3.6.5.1", 3);
    assert_eq!(frame.group_identifiers(), vec!["1.2.840.113619", "1.3.6.5"]);
    assert_eq!(frame.identity_tokens(), vec!["1.3.6.5.1", "3"]);
}
