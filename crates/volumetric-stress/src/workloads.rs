use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use volumetric_cache::VolumeCache;
use volumetric_test::{TestBuilder, TestFrame, Tracker, frames};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,

    /// How long the builder takes per slice.
    #[serde(default, with = "humantime_serde")]
    pub build_latency: Duration,

    /// How often to simulate memory pressure, unloading all unlocked entries.
    #[serde(default, with = "humantime_serde")]
    pub pressure_interval: Option<Duration>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct series the workload cycles through.
    pub series: usize,
    /// The number of frames per series.
    pub frames: usize,
    /// How long each operation holds on to its reference after reading the payload.
    #[serde(default, with = "humantime_serde")]
    pub hold: Duration,
    /// Whether to hold a locking reference, pinning the payload against memory pressure.
    #[serde(default)]
    pub locking: bool,
}

/// A workload with all of its source frames created up front.
pub struct PreparedWorkload {
    series: Vec<Vec<TestFrame>>,
    hold: Duration,
    locking: bool,
}

pub fn prepare_workload(index: usize, tracker: &Tracker, workload: &Workload) -> PreparedWorkload {
    let series = (0..workload.series.max(1))
        .map(|series| frames(tracker, &format!("1.3.6.{index}.{series}"), workload.frames))
        .collect();

    PreparedWorkload {
        series,
        hold: workload.hold,
        locking: workload.locking,
    }
}

/// Runs one operation of a workload: a lookup, followed by reading the payload.
///
/// This blocks the calling thread while the payload is constructed, and for the configured hold
/// time afterwards.
pub fn process_workload(
    cache: &VolumeCache<TestBuilder>,
    workload: &PreparedWorkload,
    iteration: usize,
) -> Result<()> {
    let elements = &workload.series[iteration % workload.series.len()];
    let handle = cache.get_or_create(elements)?;
    let lock = match workload.locking {
        true => Some(handle.create_reference(true)?),
        false => None,
    };

    let volume = handle.payload()?;
    anyhow::ensure!(
        volume.slices.len() == elements.len(),
        "volume has {} slices, expected {}",
        volume.slices.len(),
        elements.len()
    );
    drop(volume);

    if !workload.hold.is_zero() {
        std::thread::sleep(workload.hold);
    }

    drop(lock);
    drop(handle);
    Ok(())
}
