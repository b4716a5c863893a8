//! A content-addressed, reference-counted cache for expensively constructed payloads.
//!
//! Payloads (for example volumes reconstructed from a stack of image frames) are keyed by a
//! [`Fingerprint`] over the ordered list of source elements they are built from. Callers get a
//! [`CacheReference`] from [`VolumeCache::get_or_create`] and read the payload through it, which
//! constructs the payload lazily and at most once at a time per entry.
//!
//! Every loaded entry registers itself with an [`EvictionAuthority`], which may unload the payload
//! under memory pressure while the entry itself stays cached for cheap regeneration. Locking
//! references pin an entry against such unloads.
//!
//! Once the last reference to an entry is dropped, the entry is marked as disposed right away and
//! its payload and source references are released on a background task.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod memory;
pub mod reference;
pub mod source;

pub use cache::{CacheStats, VolumeCache};
pub use entry::{CacheEntry, LoadTask};
pub use error::CacheError;
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use memory::{EvictionAuthority, LargeObjectContainer, MemoryRegistry, RegenerationCost};
pub use reference::CacheReference;
pub use source::{PayloadBuilder, SourceElement, SourceReference};
