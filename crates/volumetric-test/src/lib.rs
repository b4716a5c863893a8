//! Helpers for testing the volume cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Source frames created through [`frames`] report every acquired and released reference to
//!    their [`Tracker`]. Use [`Tracker::live`] to assert that an entry released all of its
//!    references after its teardown.
//!
//!  - The [`TestBuilder`] is cheap to clone and all clones share their counters, so keep one clone
//!    around after moving the other into the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use volumetric_cache::{PayloadBuilder, SourceElement, SourceReference};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `volumetric_cache` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("volumetric_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug)]
struct TrackerInner {
    acquired: AtomicU64,
    released: AtomicU64,
    /// Acquisitions panic once this many references were created.
    acquire_limit: AtomicU64,
    fail_releases: AtomicBool,
    panic_releases: AtomicBool,
}

impl Default for TrackerInner {
    fn default() -> Self {
        Self {
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            acquire_limit: AtomicU64::new(u64::MAX),
            fail_releases: AtomicBool::new(false),
            panic_releases: AtomicBool::new(false),
        }
    }
}

/// Counts the source references handed out by [`TestFrame`]s, and injects release failures.
#[derive(Clone, Debug, Default)]
pub struct Tracker(Arc<TrackerInner>);

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The total number of references that were created.
    pub fn acquired(&self) -> u64 {
        self.0.acquired.load(Ordering::SeqCst)
    }

    /// The total number of references that were released, including failed releases.
    pub fn released(&self) -> u64 {
        self.0.released.load(Ordering::SeqCst)
    }

    /// The number of references that are still held.
    pub fn live(&self) -> u64 {
        self.acquired() - self.released()
    }

    /// Makes acquisitions panic once `limit` references were created in total.
    ///
    /// Passing `None` removes the limit.
    pub fn panic_acquires_after(&self, limit: Option<u64>) {
        self.0
            .acquire_limit
            .store(limit.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Makes all following releases return an error.
    pub fn fail_releases(&self, fail: bool) {
        self.0.fail_releases.store(fail, Ordering::SeqCst);
    }

    /// Makes all following releases panic.
    pub fn panic_releases(&self, panic: bool) {
        self.0.panic_releases.store(panic, Ordering::SeqCst);
    }
}

/// One frame of an image series.
#[derive(Clone, Debug)]
pub struct TestFrame {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_instance_uid: String,
    pub frame_number: u32,
    tracker: Tracker,
}

impl TestFrame {
    pub fn new(
        tracker: &Tracker,
        series_uid: &str,
        sop_instance_uid: &str,
        frame_number: u32,
    ) -> Self {
        Self {
            study_uid: "1.2.840.113619".into(),
            series_uid: series_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
            frame_number,
            tracker: tracker.clone(),
        }
    }
}

impl SourceElement for TestFrame {
    type Reference = FrameReference;

    fn group_identifiers(&self) -> Vec<&str> {
        vec![self.study_uid.as_str(), self.series_uid.as_str()]
    }

    fn identity_tokens(&self) -> Vec<String> {
        vec![self.sop_instance_uid.clone(), self.frame_number.to_string()]
    }

    fn create_reference(&self) -> FrameReference {
        let tracker = &self.tracker.0;
        let limit = tracker.acquire_limit.load(Ordering::SeqCst);
        if tracker.acquired.load(Ordering::SeqCst) >= limit {
            panic!("frame {} is unavailable", self.sop_instance_uid);
        }
        tracker.acquired.fetch_add(1, Ordering::SeqCst);
        FrameReference {
            sop_instance_uid: self.sop_instance_uid.clone(),
            frame_number: self.frame_number,
            tracker: self.tracker.clone(),
        }
    }
}

/// A reference to one [`TestFrame`], as held by cache entries.
#[derive(Debug)]
pub struct FrameReference {
    pub sop_instance_uid: String,
    pub frame_number: u32,
    tracker: Tracker,
}

impl SourceReference for FrameReference {
    fn release(self) -> anyhow::Result<()> {
        let tracker = &self.tracker.0;
        tracker.released.fetch_add(1, Ordering::SeqCst);

        if tracker.panic_releases.load(Ordering::SeqCst) {
            panic!("frame {} exploded", self.sop_instance_uid);
        }
        if tracker.fail_releases.load(Ordering::SeqCst) {
            anyhow::bail!("frame {} is still in use", self.sop_instance_uid);
        }
        Ok(())
    }
}

/// Creates `count` consecutive frames of the given series.
///
/// Every frame is a separate instance, with frame number `1`.
pub fn frames(tracker: &Tracker, series_uid: &str, count: usize) -> Vec<TestFrame> {
    (0..count)
        .map(|i| TestFrame::new(tracker, series_uid, &format!("{series_uid}.{i}"), 1))
        .collect()
}

/// A volume built from a stack of frames.
#[derive(Debug, PartialEq, Eq)]
pub struct TestVolume {
    /// The `(sop_instance_uid, frame_number)` of every slice, in order.
    pub slices: Vec<(String, u32)>,
    /// The voxel data, [`TestBuilder::SLICE_SIZE`] bytes per slice.
    pub voxels: Vec<u8>,
}

#[derive(Debug, Default)]
struct BuilderInner {
    builds: AtomicUsize,
    latency_ms: AtomicU64,
    fail_builds: AtomicBool,
    panic_builds: AtomicBool,
    panic_validations: AtomicBool,
    panic_weights: AtomicBool,
}

/// A [`PayloadBuilder`] that stacks frames into a [`TestVolume`], counting its constructions.
#[derive(Clone, Debug, Default)]
pub struct TestBuilder(Arc<BuilderInner>);

impl TestBuilder {
    /// The number of voxel bytes per slice.
    pub const SLICE_SIZE: usize = 64 * 64;

    pub fn new() -> Self {
        Self::default()
    }

    /// The number of constructions that were started.
    pub fn builds(&self) -> usize {
        self.0.builds.load(Ordering::SeqCst)
    }

    /// Delays every slice of a construction by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.0
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes all following constructions fail.
    pub fn fail_builds(&self, fail: bool) {
        self.0.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Makes all following constructions panic.
    pub fn panic_builds(&self, panic: bool) {
        self.0.panic_builds.store(panic, Ordering::SeqCst);
    }

    /// Makes all following source validations panic.
    pub fn panic_validations(&self, panic: bool) {
        self.0.panic_validations.store(panic, Ordering::SeqCst);
    }

    /// Makes weighing any payload panic.
    pub fn panic_weights(&self, panic: bool) {
        self.0.panic_weights.store(panic, Ordering::SeqCst);
    }
}

impl PayloadBuilder for TestBuilder {
    type Reference = FrameReference;
    type Payload = TestVolume;

    fn validate(&self, sources: &[FrameReference]) -> anyhow::Result<()> {
        if self.0.panic_validations.load(Ordering::SeqCst) {
            panic!("header is corrupt");
        }
        if let Some(frame) = sources.iter().find(|frame| frame.frame_number == 0) {
            anyhow::bail!("frame {} has an invalid frame number", frame.sop_instance_uid);
        }
        Ok(())
    }

    fn build(
        &self,
        sources: &[FrameReference],
        progress: &mut dyn FnMut(usize, usize),
    ) -> anyhow::Result<TestVolume> {
        let inner = &self.0;
        inner.builds.fetch_add(1, Ordering::SeqCst);
        let latency = Duration::from_millis(inner.latency_ms.load(Ordering::SeqCst));

        let mut volume = TestVolume {
            slices: Vec::with_capacity(sources.len()),
            voxels: Vec::with_capacity(sources.len() * Self::SLICE_SIZE),
        };
        for (index, frame) in sources.iter().enumerate() {
            if !latency.is_zero() {
                std::thread::sleep(latency);
            }
            if inner.panic_builds.load(Ordering::SeqCst) {
                panic!("slice {index} is corrupt");
            }
            if inner.fail_builds.load(Ordering::SeqCst) {
                anyhow::bail!("no pixel data in {}", frame.sop_instance_uid);
            }

            volume
                .slices
                .push((frame.sop_instance_uid.clone(), frame.frame_number));
            volume
                .voxels
                .extend(std::iter::repeat_n(index as u8, Self::SLICE_SIZE));
            progress(index + 1, sources.len());
        }

        Ok(volume)
    }

    fn weight(&self, payload: &TestVolume) -> u64 {
        if self.0.panic_weights.load(Ordering::SeqCst) {
            panic!("cannot weigh {} slices", payload.slices.len());
        }
        payload.voxels.len() as u64
    }

    fn object_count(&self, payload: &TestVolume) -> usize {
        payload.slices.len()
    }
}
