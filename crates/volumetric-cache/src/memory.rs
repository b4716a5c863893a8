//! The contract between cached entries and a global memory manager.
//!
//! Every loaded [`CacheEntry`](crate::CacheEntry) is a [`LargeObjectContainer`] that registers
//! itself with an [`EvictionAuthority`]. The authority decides, based on the reported sizes,
//! access times and regeneration costs, which containers to [`unload`](LargeObjectContainer::unload)
//! when memory runs low. How it makes that decision is up to the authority.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::CacheError;

/// How expensive it is to regenerate the contents of a container after they were unloaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegenerationCost {
    Low,
    #[default]
    Medium,
    High,
}

/// A container of large objects that can be unloaded under memory pressure.
pub trait LargeObjectContainer: Send + Sync {
    /// A stable identifier of this container.
    fn identifier(&self) -> Uuid;

    /// The number of large objects currently held.
    fn large_object_count(&self) -> usize;

    /// The approximate number of bytes currently held.
    fn bytes_held(&self) -> u64;

    /// The last time the contents of this container were accessed.
    fn last_access_time(&self) -> DateTime<Utc>;

    /// How expensive it is to regenerate the contents once unloaded.
    fn regeneration_cost(&self) -> RegenerationCost;

    /// Whether this container is currently pinned against being unloaded.
    fn is_locked(&self) -> bool;

    /// Pins the container. Locks are counted and need to be balanced by [`unlock`](Self::unlock).
    fn lock(&self);

    /// Releases one pin.
    fn unlock(&self) -> Result<(), CacheError>;

    /// Unloads the contents of this container.
    ///
    /// Returns `true` if anything was actually released. Locked containers are never unloaded.
    fn unload(&self) -> bool;
}

/// The global authority deciding which containers to unload under memory pressure.
///
/// Implementations must not call back into the container from within [`add`](Self::add) or
/// [`remove`](Self::remove), as both are called while the container holds internal locks.
pub trait EvictionAuthority: Send + Sync {
    /// Starts tracking a container that just loaded its contents.
    fn add(&self, container: Arc<dyn LargeObjectContainer>);

    /// Stops tracking the container with the given identifier.
    fn remove(&self, identifier: Uuid);
}

/// Bookkeeping shared by all [`LargeObjectContainer`] implementations.
///
/// None of these fields are guarded by the container's state lock, so the authority can read them
/// at any time without contending with an in-progress load.
#[derive(Debug)]
pub struct ContainerData {
    identifier: Uuid,
    regeneration_cost: RegenerationCost,
    large_object_count: AtomicUsize,
    bytes_held: AtomicU64,
    last_access_time: Mutex<DateTime<Utc>>,
    lock_count: Mutex<usize>,
}

impl ContainerData {
    pub fn new(regeneration_cost: RegenerationCost) -> Self {
        Self {
            identifier: Uuid::new_v4(),
            regeneration_cost,
            large_object_count: AtomicUsize::new(0),
            bytes_held: AtomicU64::new(0),
            last_access_time: Mutex::new(Utc::now()),
            lock_count: Mutex::new(0),
        }
    }

    pub fn identifier(&self) -> Uuid {
        self.identifier
    }

    pub fn regeneration_cost(&self) -> RegenerationCost {
        self.regeneration_cost
    }

    pub fn large_object_count(&self) -> usize {
        self.large_object_count.load(Ordering::Relaxed)
    }

    pub fn bytes_held(&self) -> u64 {
        self.bytes_held.load(Ordering::Relaxed)
    }

    /// Records the size of freshly loaded contents, or zeroes when unloading.
    pub fn set_held(&self, large_object_count: usize, bytes_held: u64) {
        self.large_object_count
            .store(large_object_count, Ordering::Relaxed);
        self.bytes_held.store(bytes_held, Ordering::Relaxed);
    }

    pub fn last_access_time(&self) -> DateTime<Utc> {
        *self.last_access_time.lock().unwrap()
    }

    pub fn update_last_access_time(&self) {
        let now = Utc::now();
        let mut last_access_time = self.last_access_time.lock().unwrap();
        // the clock may go backwards, but the access time never does
        if now > *last_access_time {
            *last_access_time = now;
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.lock_count.lock().unwrap() > 0
    }

    pub fn lock(&self) {
        *self.lock_count.lock().unwrap() += 1;
    }

    pub fn unlock(&self) -> Result<(), CacheError> {
        let mut lock_count = self.lock_count.lock().unwrap();
        match lock_count.checked_sub(1) {
            Some(count) => {
                *lock_count = count;
                Ok(())
            }
            None => Err(CacheError::LockImbalance),
        }
    }
}

/// A simple in-process [`EvictionAuthority`].
///
/// The registry tracks which containers are currently loaded and how much memory they hold. It
/// does not implement any eviction policy of its own. Memory pressure is signaled from the outside
/// through [`unload_all`](Self::unload_all).
#[derive(Default)]
pub struct MemoryRegistry {
    containers: Mutex<HashMap<Uuid, Weak<dyn LargeObjectContainer>>>,
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let containers = self
            .containers
            .try_lock()
            .map(|c| c.len())
            .unwrap_or_default();
        f.debug_struct("MemoryRegistry")
            .field("containers", &containers)
            .finish()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of registered containers.
    pub fn len(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a container with the given identifier is registered.
    pub fn contains(&self, identifier: Uuid) -> bool {
        self.containers.lock().unwrap().contains_key(&identifier)
    }

    /// The total number of bytes held by all registered containers.
    pub fn bytes_held(&self) -> u64 {
        self.snapshot().iter().map(|c| c.bytes_held()).sum()
    }

    /// Simulates a memory pressure event by unloading every unlocked container.
    ///
    /// Returns the number of bytes that were released.
    pub fn unload_all(&self) -> u64 {
        let mut released = 0;
        for container in self.snapshot() {
            let bytes = container.bytes_held();
            if container.unload() {
                released += bytes;
            }
        }

        tracing::debug!(released, "Unloaded containers under memory pressure");
        released
    }

    /// Collects strong references to all live containers, so they can be used without holding the
    /// registry lock.
    fn snapshot(&self) -> Vec<Arc<dyn LargeObjectContainer>> {
        let mut containers = self.containers.lock().unwrap();
        containers.retain(|_, container| container.strong_count() > 0);
        containers.values().filter_map(Weak::upgrade).collect()
    }
}

impl EvictionAuthority for MemoryRegistry {
    fn add(&self, container: Arc<dyn LargeObjectContainer>) {
        let identifier = container.identifier();
        self.containers
            .lock()
            .unwrap()
            .insert(identifier, Arc::downgrade(&container));
    }

    fn remove(&self, identifier: Uuid) {
        self.containers.lock().unwrap().remove(&identifier);
    }
}
