//! # Caching infrastructure
//!
//! Both tiers of the service are built on the same in-memory primitive, the [`MemoizingCache`].
//! It deduplicates concurrent accesses so that a source is fetched, and an attribute set is
//! computed, at most once at a time per key, and it keeps successful results around according to
//! the [`EntryOptions`] chosen when the computation finishes.
//!
//! ## Tiers
//!
//! - The *sources* tier holds fetched source documents, keyed by
//!   [`SourceId`](crate::types::SourceId). Every entry owns an [`InvalidationHandle`].
//! - The *derived* tier holds computed [`Attributes`](crate::types::Attributes), keyed by a
//!   [`CacheKey`] over the source, the domain and the normalized parameters. Every entry holds a
//!   clone of its source's handle, so invalidating a source cascades to everything derived from it.
//!
//! Failures are not cached by the memoizing primitive itself. The derived tier instead caches an
//! empty sentinel result with a shorter sliding expiration, see
//! [`AttributesCache`](crate::services::AttributesCache).
//!
//! ### Metrics
//!
//! Each of these is tagged with a `cache` field that corresponds to the tier:
//!
//! - `caches.access`: All accesses through `get_or_create`.
//! - `caches.memory.hit`: Accesses served by a committed entry.
//! - `caches.channel.hit`: Accesses joining a computation that is still running.
//! - `caches.computation`: Actual computations being started.
//! - `caches.computation.stale`: Finished computations whose key was removed while they ran.
//! - `caches.invalidated`: Entries dropped because one of their handles was invalidated.
//!
//! ### Configuration
//!
//! [`Config::caches`](crate::config::Config::caches) configures the capacity and the idle timeouts
//! of both tiers. The derived tier additionally has `retry_misses_after` and
//! `retry_malformed_after`, which are the idle timeouts of its failure sentinels.

mod cache_error;
mod cache_key;
mod config;
mod handle;
mod memory;


pub use cache_error::{CacheEntry, CacheError, ComputationError, FetchError};
pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use config::CacheName;
pub use handle::{CachePriority, EntryOptions, InvalidationHandle};
pub use memory::{Computation, MemoizingCache};
