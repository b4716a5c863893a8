use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryContext, panic_message, release_sources};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::memory::EvictionAuthority;
use crate::reference::CacheReference;
use crate::source::{PayloadBuilder, SourceElement};

/// A snapshot of cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// The number of entries currently in the cache.
    pub entries: usize,
    /// The number of payload constructions that were started.
    pub constructions: u64,
    /// The number of payload constructions that failed.
    pub construction_failures: u64,
    /// The number of payloads that were unloaded.
    pub unloads: u64,
    /// The number of entries that were torn down.
    pub teardowns: u64,
    /// The number of source references that failed to be released.
    pub teardown_failures: u64,
}

pub(crate) struct CacheInner<B: PayloadBuilder> {
    context: Arc<EntryContext<B>>,
    entries: Mutex<HashMap<Fingerprint, Arc<CacheEntry<B>>>>,
}

impl<B: PayloadBuilder> CacheInner<B> {
    /// Removes the given entry, but only if it is still the one cached for `fingerprint`.
    ///
    /// A new entry for the same fingerprint might already have replaced it by the time the old
    /// entry is torn down.
    pub(crate) fn remove(&self, fingerprint: &Fingerprint, entry: &CacheEntry<B>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let is_same = entries
            .get(fingerprint)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), entry));
        if is_same {
            entries.remove(fingerprint);
            metric!(gauge("cache.entries") = entries.len() as u64);
        }
        is_same
    }
}

/// A cache of payloads, keyed by the [`Fingerprint`] of the source elements they are built from.
///
/// The cache is meant to be owned by the session it serves, and passed down to whoever needs it.
/// Dropping the cache does not dispose any entries: outstanding references keep their entries
/// alive until they are released.
pub struct VolumeCache<B: PayloadBuilder> {
    inner: Arc<CacheInner<B>>,
}

impl<B: PayloadBuilder> fmt::Debug for VolumeCache<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .entries
            .try_lock()
            .map(|e| e.len())
            .unwrap_or_default();
        f.debug_struct("VolumeCache")
            .field("entries", &entries)
            .finish()
    }
}

impl<B: PayloadBuilder> VolumeCache<B> {
    /// Creates a new cache.
    ///
    /// Background work, like asynchronous loads and the teardown of released entries, is spawned
    /// as blocking tasks onto `runtime`.
    pub fn new(
        config: &CacheConfig,
        builder: B,
        authority: Arc<dyn EvictionAuthority>,
        runtime: Handle,
    ) -> Self {
        let (teardowns, _) = watch::channel(0);
        let context = Arc::new(EntryContext {
            builder,
            authority,
            runtime,
            regeneration_cost: config.regeneration_cost,
            teardown_failure_warn_threshold: config.teardown_failure_warn_threshold,
            counters: Default::default(),
            teardowns,
        });

        Self {
            inner: Arc::new(CacheInner {
                context,
                entries: Default::default(),
            }),
        }
    }

    /// Returns a new reference to the entry for the given source elements, creating the entry if
    /// necessary.
    ///
    /// This never constructs the payload, which happens lazily once it is accessed through the
    /// returned reference. Creating a new entry acquires one reference per source element, and
    /// fails with [`CacheError::Construction`] if the builder rejects the sources. A panic while
    /// acquiring or validating the sources fails the same way, after releasing every reference
    /// acquired so far.
    pub fn get_or_create<S>(&self, elements: &[S]) -> Result<CacheReference<B>, CacheError>
    where
        S: SourceElement<Reference = B::Reference>,
    {
        let fingerprint = Fingerprint::compute(elements);
        metric!(counter("cache.access") += 1);

        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get(&fingerprint) {
            // a disposed entry is about to be torn down, and is replaced below
            if let Ok(reference) = entry.create_reference(false) {
                metric!(counter("cache.memory.hit") += 1);
                return Ok(reference);
            }
        }

        // the table lock is held here, so panics must not escape
        let mut sources = Vec::with_capacity(elements.len());
        let acquired = panic::catch_unwind(AssertUnwindSafe(|| {
            for element in elements {
                sources.push(element.create_reference());
            }
        }));
        let validated = match acquired {
            Ok(()) => {
                let builder = &self.inner.context.builder;
                panic::catch_unwind(AssertUnwindSafe(|| builder.validate(&sources)))
                    .unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!(
                            "validating sources panicked: {}",
                            panic_message(&*panic)
                        ))
                    })
            }
            Err(panic) => Err(anyhow::anyhow!(
                "acquiring source references panicked: {}",
                panic_message(&*panic)
            )),
        };
        if let Err(err) = validated {
            let failures = release_sources(sources, &fingerprint);
            self.inner
                .context
                .counters
                .teardown_failures
                .fetch_add(failures, Ordering::Relaxed);
            return Err(CacheError::from_construction(
                err.context(format!("invalid sources for {fingerprint}")),
            ));
        }

        tracing::debug!(%fingerprint, sources = sources.len(), "Creating cache entry");
        let entry = CacheEntry::new(
            Arc::clone(&self.inner.context),
            Arc::downgrade(&self.inner),
            fingerprint.clone(),
            sources,
        );
        let reference = entry.create_reference(false)?;
        entries.insert(fingerprint, entry);

        metric!(counter("cache.entry.created") += 1);
        metric!(gauge("cache.entries") = entries.len() as u64);
        Ok(reference)
    }

    /// Whether a live entry exists for the given source elements.
    pub fn is_cached<S: SourceElement>(&self, elements: &[S]) -> bool {
        self.contains(&Fingerprint::compute(elements))
    }

    /// Whether a live entry exists for the given fingerprint.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner
            .entries
            .lock()
            .unwrap()
            .get(fingerprint)
            .is_some_and(|entry| !entry.is_disposed())
    }

    /// The number of entries in the cache, including disposed ones that are being torn down.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.context.counters;
        CacheStats {
            entries: self.len(),
            constructions: counters.constructions.load(Ordering::Relaxed),
            construction_failures: counters.construction_failures.load(Ordering::Relaxed),
            unloads: counters.unloads.load(Ordering::Relaxed),
            teardowns: *self.inner.context.teardowns.borrow(),
            teardown_failures: counters.teardown_failures.load(Ordering::Relaxed),
        }
    }

    /// Waits until at least `count` entries have been torn down in total.
    pub async fn wait_for_teardowns(&self, count: u64) {
        let mut teardowns = self.inner.context.teardowns.subscribe();
        // the sender is owned by `self`, so the channel cannot be closed here
        let _ = teardowns.wait_for(|finished| *finished >= count).await;
    }
}
