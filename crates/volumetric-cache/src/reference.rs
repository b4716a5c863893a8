use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::entry::{CacheEntry, LoadTask};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::memory::LargeObjectContainer;
use crate::source::PayloadBuilder;

/// A counted reference to a cached entry.
///
/// Each reference holds exactly one increment of the entry's reference count, which is given
/// back when the reference is [disposed](Self::dispose) or dropped. A *locking* reference
/// additionally pins the entry, so that its payload cannot be unloaded while the reference
/// exists.
///
/// The payload returned by [`payload`](Self::payload) should not be held on to for a significant
/// amount of time, as the entry may be unloaded at any time by the eviction authority. To keep an
/// entry around for longer, hold on to a reference instead, created via
/// [`create_reference`](Self::create_reference).
pub struct CacheReference<B: PayloadBuilder> {
    entry: Option<Arc<CacheEntry<B>>>,
    locking: bool,
}

impl<B: PayloadBuilder> CacheReference<B> {
    /// Wraps an entry whose reference count (and lock count, if `locking`) was already
    /// incremented for this reference.
    pub(crate) fn new(entry: Arc<CacheEntry<B>>, locking: bool) -> Self {
        Self {
            entry: Some(entry),
            locking,
        }
    }

    /// The referenced entry, unless this reference was already disposed.
    pub fn entry(&self) -> Result<&Arc<CacheEntry<B>>, CacheError> {
        self.entry.as_ref().ok_or(CacheError::UseAfterDispose)
    }

    /// The fingerprint of the referenced entry.
    pub fn fingerprint(&self) -> Result<&Fingerprint, CacheError> {
        Ok(self.entry()?.fingerprint())
    }

    /// Whether this reference pins the entry against being unloaded.
    ///
    /// A disposed reference pins nothing, so this is `false` after [`dispose`](Self::dispose).
    pub fn is_locking(&self) -> bool {
        self.locking
    }

    /// Whether the payload is currently resident. Always `false` for a disposed reference.
    pub fn is_loaded(&self) -> bool {
        self.entry.as_ref().is_some_and(|entry| entry.is_loaded())
    }

    /// The progress of the current or last construction, between `0` and `100`.
    pub fn progress(&self) -> Result<f32, CacheError> {
        Ok(self.entry()?.progress())
    }

    /// Subscribes to progress changes of the entry.
    pub fn subscribe_progress(&self) -> Result<watch::Receiver<f32>, CacheError> {
        Ok(self.entry()?.subscribe_progress())
    }

    /// Returns the payload, synchronously constructing it if necessary.
    pub fn payload(&self) -> Result<Arc<B::Payload>, CacheError> {
        self.entry()?.load(None)
    }

    /// Synchronously constructs the payload if necessary, reporting the progress.
    pub fn load(&self, mut progress: impl FnMut(usize, usize)) -> Result<(), CacheError> {
        self.entry()?.load(Some(&mut progress))?;
        Ok(())
    }

    /// Starts constructing the payload in the background if necessary.
    pub fn load_async(&self) -> Result<LoadTask, CacheError> {
        self.entry()?.load_async()
    }

    /// Discards the payload, unless the entry is locked.
    ///
    /// Returns `true` if a payload was released.
    pub fn unload(&self) -> Result<bool, CacheError> {
        Ok(self.entry()?.unload())
    }

    /// Creates another reference to the same entry.
    pub fn create_reference(&self, locking: bool) -> Result<Self, CacheError> {
        self.entry()?.create_reference(locking)
    }

    /// Gives back this reference's increment of the reference count.
    ///
    /// Disposing a reference more than once has no effect.
    pub fn dispose(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };

        if std::mem::take(&mut self.locking) {
            if let Err(err) = entry.unlock() {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    fingerprint = %entry.fingerprint(),
                    "Failed to unlock cache entry"
                );
            }
        }
        entry.release();
    }
}

impl<B: PayloadBuilder> Drop for CacheReference<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<B: PayloadBuilder> PartialEq for CacheReference<B> {
    /// Two references are equal if they reference the same entry.
    fn eq(&self, other: &Self) -> bool {
        match (&self.entry, &other.entry) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<B: PayloadBuilder> fmt::Debug for CacheReference<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheReference")
            .field("entry", &self.entry)
            .field("locking", &self.locking)
            .finish()
    }
}
