//! Cache entries and their lifecycle.
//!
//! A [`CacheEntry`] goes through the following states:
//!
//! - `Empty`: no payload is resident.
//! - `Loading`: exactly one construction is in flight. Concurrent loaders wait for it instead of
//!   starting their own.
//! - `Loaded`: the payload is resident and registered with the [`EvictionAuthority`].
//!
//! A loaded entry goes back to `Empty` when it is unloaded, and can be loaded again any number of
//! times. Independently of that, the entry becomes *disposed* once its last [`CacheReference`] is
//! released. Disposal is final: the payload and the source references are released on a
//! background task, and the entry is removed from its [`VolumeCache`](crate::VolumeCache).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::CacheInner;
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::memory::{ContainerData, EvictionAuthority, LargeObjectContainer, RegenerationCost};
use crate::reference::CacheReference;
use crate::source::{PayloadBuilder, SourceReference};

type FlightResult = Option<Result<(), CacheError>>;

/// A freshly constructed payload, together with its object count and weight.
type Built<P> = (P, usize, u64);

enum LoadState<P> {
    Empty,
    Loading(watch::Receiver<FlightResult>),
    Loaded(Arc<P>),
}

#[derive(Debug, Default)]
struct RefCount {
    count: usize,
    disposed: bool,
}

/// Counters shared by all entries of one cache.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub constructions: AtomicU64,
    pub construction_failures: AtomicU64,
    pub unloads: AtomicU64,
    pub teardown_failures: AtomicU64,
}

/// Everything an entry needs from the cache it was created by.
///
/// This outlives the [`VolumeCache`](crate::VolumeCache) itself as long as there are outstanding
/// references to any of its entries.
pub(crate) struct EntryContext<B> {
    pub builder: B,
    pub authority: Arc<dyn EvictionAuthority>,
    pub runtime: Handle,
    pub regeneration_cost: RegenerationCost,
    pub teardown_failure_warn_threshold: u64,
    pub counters: CacheCounters,
    /// The number of finished teardowns, observable to wait for background work.
    pub teardowns: watch::Sender<u64>,
}

/// A cached payload together with the source references it is built from.
///
/// Entries are only ever handed out through [`CacheReference`]s.
pub struct CacheEntry<B: PayloadBuilder> {
    context: Arc<EntryContext<B>>,
    owner: Weak<CacheInner<B>>,
    fingerprint: Fingerprint,
    sources: Mutex<Vec<B::Reference>>,
    state: Mutex<LoadState<B::Payload>>,
    state_changed: Condvar,
    refs: Mutex<RefCount>,
    data: ContainerData,
    progress: watch::Sender<f32>,
}

impl<B: PayloadBuilder> std::fmt::Debug for CacheEntry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("fingerprint", &self.fingerprint.to_string())
            .field("identifier", &self.data.identifier())
            .field("bytes_held", &self.data.bytes_held())
            .field("progress", &self.progress())
            .finish()
    }
}

impl<B: PayloadBuilder> CacheEntry<B> {
    pub(crate) fn new(
        context: Arc<EntryContext<B>>,
        owner: Weak<CacheInner<B>>,
        fingerprint: Fingerprint,
        sources: Vec<B::Reference>,
    ) -> Arc<Self> {
        let data = ContainerData::new(context.regeneration_cost);
        let (progress, _) = watch::channel(0.0);

        Arc::new(Self {
            context,
            owner,
            fingerprint,
            sources: Mutex::new(sources),
            state: Mutex::new(LoadState::Empty),
            state_changed: Condvar::new(),
            refs: Mutex::new(RefCount::default()),
            data,
            progress,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The number of outstanding references.
    pub fn reference_count(&self) -> usize {
        self.refs.lock().unwrap().count
    }

    /// Whether the last reference to this entry was released.
    pub fn is_disposed(&self) -> bool {
        self.refs.lock().unwrap().disposed
    }

    /// Whether the payload is currently resident.
    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.lock().unwrap(), LoadState::Loaded(_))
    }

    /// The progress of the current or last construction, between `0` and `100`.
    pub fn progress(&self) -> f32 {
        *self.progress.borrow()
    }

    /// Subscribes to changes of [`progress`](Self::progress).
    pub fn subscribe_progress(&self) -> watch::Receiver<f32> {
        self.progress.subscribe()
    }

    /// Creates a new reference to this entry, optionally locking it against being unloaded.
    pub fn create_reference(
        self: &Arc<Self>,
        locking: bool,
    ) -> Result<CacheReference<B>, CacheError> {
        {
            let mut refs = self.refs.lock().unwrap();
            if refs.disposed {
                return Err(CacheError::UseAfterDispose);
            }
            refs.count += 1;
        }

        if locking {
            LargeObjectContainer::lock(&**self);
        }

        Ok(CacheReference::new(Arc::clone(self), locking))
    }

    /// Releases one reference, scheduling the teardown when it was the last one.
    pub(crate) fn release(self: &Arc<Self>) {
        let mut refs = self.refs.lock().unwrap();
        debug_assert!(refs.count > 0, "released more references than were created");
        refs.count = refs.count.saturating_sub(1);
        if refs.count > 0 || refs.disposed {
            return;
        }

        // Only mark the entry as disposed here, so that the cache treats it as absent right away,
        // and do the actual work in the background.
        refs.disposed = true;
        drop(refs);

        tracing::trace!(fingerprint = %self.fingerprint, "Scheduling teardown");
        let job = TeardownJob(Some(Arc::clone(self)));
        self.context.runtime.spawn_blocking(move || job.run());
    }

    /// Returns the payload, constructing it synchronously if it is not resident.
    ///
    /// If another construction is already in flight, this waits for it to finish and shares its
    /// outcome. Otherwise the payload is constructed on the calling thread, and `progress` is
    /// invoked with the number of processed and total work items.
    pub fn load(
        self: &Arc<Self>,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<Arc<B::Payload>, CacheError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if self.is_disposed() {
                return Err(CacheError::UseAfterDispose);
            }

            match &*state {
                LoadState::Loaded(payload) => {
                    self.data.update_last_access_time();
                    return Ok(Arc::clone(payload));
                }
                LoadState::Loading(flight) => {
                    let flight = flight.clone();
                    state = self
                        .state_changed
                        .wait_while(state, |state| matches!(state, LoadState::Loading(_)))
                        .unwrap();

                    if let Some(Err(err)) = &*flight.borrow() {
                        return Err(err.clone());
                    }
                    // the payload might have been unloaded again right away, so check once more
                }
                LoadState::Empty => {
                    let (sender, receiver) = watch::channel(None);
                    *state = LoadState::Loading(receiver);
                    drop(state);

                    let flight = Flight {
                        entry: Arc::clone(self),
                        sender: Some(sender),
                    };
                    return flight.run(progress.take());
                }
            }
        }
    }

    /// Starts constructing the payload on a background task.
    ///
    /// Returns a [`LoadTask`] which completes once the payload is resident. If a construction is
    /// already in flight, the returned task observes that one instead of starting another.
    pub fn load_async(self: &Arc<Self>) -> Result<LoadTask, CacheError> {
        let mut state = self.state.lock().unwrap();
        if self.is_disposed() {
            return Err(CacheError::UseAfterDispose);
        }

        match &*state {
            LoadState::Loaded(_) => Ok(LoadTask::completed()),
            LoadState::Loading(flight) => Ok(LoadTask::pending(flight.clone())),
            LoadState::Empty => {
                let (sender, receiver) = watch::channel(None);
                *state = LoadState::Loading(receiver.clone());
                drop(state);

                let flight = Flight {
                    entry: Arc::clone(self),
                    sender: Some(sender),
                };
                self.context.runtime.spawn_blocking(move || {
                    // errors are logged, and observed through the `LoadTask`
                    let _ = flight.run(None);
                });

                Ok(LoadTask::pending(receiver))
            }
        }
    }

    /// Discards the payload, if it is resident and the entry is not locked.
    ///
    /// Returns `true` if a payload was released.
    pub fn unload(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if self.data.is_locked() {
            tracing::trace!(fingerprint = %self.fingerprint, "Not unloading locked entry");
            return false;
        }

        let LoadState::Loaded(_) = &*state else {
            return false;
        };
        let payload = std::mem::replace(&mut *state, LoadState::Empty);

        self.context.authority.remove(self.data.identifier());
        self.data.set_held(0, 0);
        self.progress.send_replace(0.0);
        drop(state);
        drop(payload);

        self.context.counters.unloads.fetch_add(1, Ordering::Relaxed);
        metric!(counter("cache.unload") += 1);
        tracing::debug!(fingerprint = %self.fingerprint, "Unloaded payload");
        true
    }

    /// Constructs the payload from the source references.
    fn construct(
        &self,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<Built<B::Payload>, CacheError> {
        let sources = self.sources.lock().unwrap();
        self.progress.send_replace(0.0);

        let mut report = |done: usize, total: usize| {
            let percent = match total {
                0 => 100.0,
                total => (100.0 * done as f32 / total as f32).min(100.0),
            };
            // progress never goes backwards within one construction
            self.progress.send_if_modified(|current| {
                let changed = percent > *current;
                if changed {
                    *current = percent;
                }
                changed
            });
            if let Some(progress) = progress.as_deref_mut() {
                progress(done, total);
            }
        };

        let start = Instant::now();
        self.context
            .counters
            .constructions
            .fetch_add(1, Ordering::Relaxed);
        metric!(counter("cache.construction") += 1);
        tracing::debug!(fingerprint = %self.fingerprint, sources = sources.len(), "Constructing payload");

        let builder = &self.context.builder;
        let result = panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<_> {
            let payload = builder.build(&sources, &mut report)?;
            let object_count = builder.object_count(&payload);
            let weight = builder.weight(&payload);
            Ok((payload, object_count, weight))
        }));
        let result = match result {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "payload construction panicked: {}",
                panic_message(&*panic)
            )),
        };
        metric!(timer("cache.construction.duration") = start.elapsed());

        match result {
            Ok(built) => {
                self.progress.send_replace(100.0);
                Ok(built)
            }
            Err(err) => Err(self.construction_failed(err)),
        }
    }

    fn construction_failed(&self, err: anyhow::Error) -> CacheError {
        self.context
            .counters
            .construction_failures
            .fetch_add(1, Ordering::Relaxed);
        metric!(counter("cache.construction.failed") += 1);
        self.progress.send_replace(0.0);
        let err = err.context(format!("failed to construct {}", self.fingerprint));
        CacheError::from_construction(err)
    }

    /// Releases everything held by this disposed entry.
    ///
    /// The steps happen in order: deregistration from the eviction authority, releasing the
    /// payload, releasing the source references, and finally removal from the cache.
    fn teardown(&self) {
        let state = self.state.lock().unwrap();
        // an in-flight construction notices the disposal and discards its payload itself
        let mut state = self
            .state_changed
            .wait_while(state, |state| matches!(state, LoadState::Loading(_)))
            .unwrap();

        self.context.authority.remove(self.data.identifier());
        self.data.set_held(0, 0);
        let payload = std::mem::replace(&mut *state, LoadState::Empty);
        drop(state);
        drop(payload);

        let sources = std::mem::take(&mut *self.sources.lock().unwrap());
        let failures = release_sources(sources, &self.fingerprint);
        if failures > 0 {
            let total = self
                .context
                .counters
                .teardown_failures
                .fetch_add(failures, Ordering::Relaxed)
                + failures;
            metric!(counter("cache.teardown.failure") += failures as i64);

            let threshold = self.context.teardown_failure_warn_threshold;
            if threshold > 0 && total >= threshold && total - failures < threshold {
                tracing::warn!(
                    failures = total,
                    "Repeated failures releasing source references, these are being leaked"
                );
            }
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.remove(&self.fingerprint, self);
        }

        metric!(counter("cache.teardown") += 1);
        tracing::debug!(fingerprint = %self.fingerprint, "Tore down cache entry");
        self.context.teardowns.send_modify(|count| *count += 1);
    }
}

impl<B: PayloadBuilder> LargeObjectContainer for CacheEntry<B> {
    fn identifier(&self) -> Uuid {
        self.data.identifier()
    }

    fn large_object_count(&self) -> usize {
        self.data.large_object_count()
    }

    fn bytes_held(&self) -> u64 {
        self.data.bytes_held()
    }

    fn last_access_time(&self) -> DateTime<Utc> {
        self.data.last_access_time()
    }

    fn regeneration_cost(&self) -> RegenerationCost {
        self.data.regeneration_cost()
    }

    fn is_locked(&self) -> bool {
        self.data.is_locked()
    }

    fn lock(&self) {
        // taking the state lock orders this against a concurrent `unload`
        let _state = self.state.lock().unwrap();
        self.data.lock();
    }

    fn unlock(&self) -> Result<(), CacheError> {
        self.data.unlock()
    }

    fn unload(&self) -> bool {
        CacheEntry::unload(self)
    }
}

/// A single construction of the payload of an entry.
///
/// Dropping a flight that was never run (for example because the runtime is shutting down)
/// resets the entry, so that waiters are not stuck forever.
struct Flight<B: PayloadBuilder> {
    entry: Arc<CacheEntry<B>>,
    sender: Option<watch::Sender<FlightResult>>,
}

impl<B: PayloadBuilder> Flight<B> {
    fn run(
        mut self,
        progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<Arc<B::Payload>, CacheError> {
        let entry = Arc::clone(&self.entry);
        let result = entry.construct(progress);

        let mut state = entry.state.lock().unwrap();
        let result = match result {
            Ok((payload, ..)) if entry.is_disposed() => {
                // nobody may see this payload anymore
                tracing::debug!(fingerprint = %entry.fingerprint, "Discarding payload of disposed entry");
                *state = LoadState::Empty;
                drop(payload);
                Err(CacheError::UseAfterDispose)
            }
            Ok((payload, object_count, weight)) => {
                let payload = Arc::new(payload);
                entry.data.set_held(object_count, weight);
                entry.data.update_last_access_time();

                let container: Arc<dyn LargeObjectContainer> = entry.clone();
                let authority = &entry.context.authority;
                match panic::catch_unwind(AssertUnwindSafe(|| authority.add(container))) {
                    Ok(()) => {
                        metric!(histogram("cache.payload.size") = weight);
                        *state = LoadState::Loaded(Arc::clone(&payload));
                        Ok(payload)
                    }
                    Err(panic) => {
                        entry.data.set_held(0, 0);
                        *state = LoadState::Empty;
                        Err(entry.construction_failed(anyhow::anyhow!(
                            "registering with the eviction authority panicked: {}",
                            panic_message(&*panic)
                        )))
                    }
                }
            }
            Err(err) => {
                *state = LoadState::Empty;
                Err(err)
            }
        };

        self.finish(result.as_ref().map(|_| ()).map_err(Clone::clone));
        entry.state_changed.notify_all();
        drop(state);

        result
    }

    fn finish(&mut self, result: Result<(), CacheError>) {
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(result));
        }
    }
}

impl<B: PayloadBuilder> Drop for Flight<B> {
    fn drop(&mut self) {
        if self.sender.is_none() {
            return;
        }

        let entry = Arc::clone(&self.entry);
        tracing::warn!(fingerprint = %entry.fingerprint, "Payload construction was abandoned");
        // the flight may be dropped while unwinding, so this must not panic again
        let mut state = entry
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let LoadState::Loading(_) = &*state {
            *state = LoadState::Empty;
        }
        self.finish(Err(CacheError::Construction(
            "payload construction was abandoned".into(),
        )));
        entry.state_changed.notify_all();
    }
}

/// The teardown of a disposed entry.
///
/// If the job is dropped without being run, the teardown happens inline, so that source
/// references are never leaked.
struct TeardownJob<B: PayloadBuilder>(Option<Arc<CacheEntry<B>>>);

impl<B: PayloadBuilder> TeardownJob<B> {
    fn run(mut self) {
        if let Some(entry) = self.0.take() {
            entry.teardown();
        }
    }
}

impl<B: PayloadBuilder> Drop for TeardownJob<B> {
    fn drop(&mut self) {
        if let Some(entry) = self.0.take() {
            entry.teardown();
        }
    }
}

/// Releases all the given source references, returning the number of failures.
///
/// Failures are logged, and never prevent the remaining references from being released.
pub(crate) fn release_sources<R: SourceReference>(
    sources: Vec<R>,
    fingerprint: &Fingerprint,
) -> u64 {
    let mut failures = 0;
    for (index, source) in sources.into_iter().enumerate() {
        match panic::catch_unwind(AssertUnwindSafe(|| source.release())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failures += 1;
                let dynerr: &dyn std::error::Error = err.as_ref();
                tracing::error!(
                    error = dynerr,
                    %fingerprint,
                    index,
                    "Failed to release source reference"
                );
            }
            Err(panic) => {
                failures += 1;
                tracing::error!(
                    %fingerprint,
                    index,
                    "Releasing source reference panicked: {}",
                    panic_message(&*panic)
                );
            }
        }
    }
    failures
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A handle to a background construction started by [`CacheEntry::load_async`].
#[derive(Debug)]
pub struct LoadTask {
    flight: Option<watch::Receiver<FlightResult>>,
}

impl LoadTask {
    fn completed() -> Self {
        Self { flight: None }
    }

    fn pending(flight: watch::Receiver<FlightResult>) -> Self {
        Self {
            flight: Some(flight),
        }
    }

    /// Whether the payload was already resident, so no construction was necessary.
    pub fn was_loaded(&self) -> bool {
        self.flight.is_none()
    }

    /// Whether the construction has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        match &self.flight {
            Some(flight) => flight.borrow().is_some(),
            None => true,
        }
    }

    /// Waits for the construction to finish.
    pub async fn wait(self) -> Result<(), CacheError> {
        let Some(mut flight) = self.flight else {
            return Ok(());
        };

        let result = match flight.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Ok(())),
            // the sender always reports a result before going away
            Err(_) => Err(CacheError::Construction(
                "payload construction was abandoned".into(),
            )),
        };
        result
    }
}
