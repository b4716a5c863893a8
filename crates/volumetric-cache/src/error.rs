use thiserror::Error;

/// An error that happens while using a cached entry or one of its references.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The payload could not be constructed from its source elements.
    ///
    /// The attached string contains the full error chain reported by the
    /// [`PayloadBuilder`](crate::PayloadBuilder). This is recoverable: the entry stays usable and
    /// a later load will retry the construction.
    #[error("construction failed: {0}")]
    Construction(String),
    /// The entry was already disposed because its last reference was released.
    ///
    /// This is a programming error on the caller's side, which held on to a reference past its
    /// valid lifetime.
    #[error("cache entry has already been disposed")]
    UseAfterDispose,
    /// An entry was unlocked more often than it was locked.
    #[error("cache entry unlocked without a matching lock")]
    LockImbalance,
}

impl CacheError {
    /// Creates a [`Construction`](Self::Construction) error from a builder error, logging it.
    #[track_caller]
    pub fn from_construction(err: anyhow::Error) -> Self {
        let dynerr: &dyn std::error::Error = err.as_ref(); // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Failed to construct payload");
        Self::Construction(format!("{err:#}"))
    }

    /// Returns `true` if retrying the failed operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Construction(_))
    }
}
