//! In-process sharded key to value cache backed by raw byte arenas.
//!
//! Values are stored in contiguous per-shard byte buffers rather than as
//! individual heap objects, so a map holding millions of entries exposes
//! only a handful of allocations to the allocator and keeps payloads
//! dense in memory. Entries expire by age of last access when an
//! expiration policy is configured; there is no size- or count-based
//! eviction, no persistence, and no cross-shard ordering.

mod expiration;
mod intmap;
mod map;
mod metrics;
mod shard;
mod slotqueue;
mod sync;

pub use expiration::{expires, ExpirationFactory, ExpirationPolicy, ExpirationService};
pub use map::{fnv64, ByteMap, ByteMapBuilder, DEFAULT_CAPACITY, DEFAULT_SHARDS};
pub use metrics::{CacheMetrics, Counter, Gauge};
pub use shard::{Shard, LENGTH_BYTES};

use thiserror::Error as ThisError;

/// Errors surfaced to callers. Everything else is reported through
/// presence flags; no operation panics on missing keys, empty values, or
/// contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The value handed to a put exceeds the map's entry size. The map is
    /// unchanged.
    #[error("value of {len} bytes exceeds entry size {entry_size}")]
    ValueTooLarge { len: usize, entry_size: usize },
}
