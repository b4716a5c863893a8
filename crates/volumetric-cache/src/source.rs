//! Interfaces to the source elements a payload is built from, and to the builder itself.

use crate::fingerprint::FingerprintBuilder;

/// A counted reference to one source element, owned by a cache entry.
///
/// The cache acquires one reference per element when an entry is created, and releases each of
/// them exactly once when the entry is torn down.
pub trait SourceReference: Send + Sync + 'static {
    /// Releases this reference.
    ///
    /// Errors are logged by the cache, and do not prevent the remaining references of the same
    /// entry from being released.
    fn release(self) -> anyhow::Result<()>;
}

/// An input element that contributes to a cached payload, such as one frame of an image series.
pub trait SourceElement {
    /// The type of reference created by [`create_reference`](Self::create_reference).
    type Reference: SourceReference;

    /// Identifiers of the group this element belongs to, like the series it is part of.
    ///
    /// Only the identifiers of the first element of a list contribute to the [`Fingerprint`].
    ///
    /// [`Fingerprint`]: crate::Fingerprint
    fn group_identifiers(&self) -> Vec<&str>;

    /// Tokens that identify this element within its group, like an instance uid and a frame number.
    fn identity_tokens(&self) -> Vec<String>;

    /// Creates a new reference that keeps this element alive until it is released.
    fn create_reference(&self) -> Self::Reference;

    /// Writes the identity of this element into the given fingerprint builder.
    fn write_identity(&self, builder: &mut FingerprintBuilder) {
        builder.write_element(&self.identity_tokens());
    }
}

/// Constructs payloads from the source references held by a cache entry.
///
/// The builder runs on the thread calling [`CacheReference::payload`] or on a blocking
/// background task for [`CacheReference::load_async`], so it has to be thread safe.
///
/// [`CacheReference::payload`]: crate::CacheReference::payload
/// [`CacheReference::load_async`]: crate::CacheReference::load_async
pub trait PayloadBuilder: Send + Sync + 'static {
    /// The source references this builder consumes.
    type Reference: SourceReference;
    /// The payload being cached.
    type Payload: Send + Sync + 'static;

    /// Checks whether the given sources can be used to construct a payload at all.
    ///
    /// This runs when a new cache entry is created, before it is inserted into the cache.
    fn validate(&self, _sources: &[Self::Reference]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Constructs a new payload.
    ///
    /// `progress` should be invoked with the number of processed and total work items as the
    /// construction proceeds.
    fn build(
        &self,
        sources: &[Self::Reference],
        progress: &mut dyn FnMut(usize, usize),
    ) -> anyhow::Result<Self::Payload>;

    /// The approximate size of the payload in bytes, as reported to the eviction authority.
    fn weight(&self, payload: &Self::Payload) -> u64 {
        std::mem::size_of_val(payload) as u64
    }

    /// The number of large objects the payload consists of.
    fn object_count(&self, _payload: &Self::Payload) -> usize {
        1
    }
}
