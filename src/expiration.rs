//! Expiration of idle entries.
//!
//! A shard optionally owns an expiration service and invokes it at fixed
//! hook points around each operation. The service keeps its own
//! hashed-key to last-access map and evicts through
//! [`Shard::unsafe_delete`], which is safe at every hook where the shard
//! guard state is documented below:
//!
//! | hook           | when                              | guard      |
//! |----------------|-----------------------------------|------------|
//! | `before_lock`  | before the guard is acquired      | none held  |
//! | `lock`         | after the guard, before the op    | held       |
//! | `access`       | after the payload write (put)     | held       |
//! | `after_access` | after the guard is released       | none held  |
//! | `remove`       | inside delete, after the guard    | held       |
//!
//! Two policies are provided. [`Passive`](ExpirationPolicy::Passive)
//! checks only the key being accessed: stale entries of keys that are
//! never touched again keep their slots until the process exits.
//! [`Sweep`](ExpirationPolicy::Sweep) walks its whole access map once per
//! expiry window, so stale entries are reclaimed within twice the
//! configured duration, at the cost of a full pass on the first operation
//! after each window while the caller holds the shard.

use std::collections::HashMap;
use std::sync::Arc;

use clocksource::precise::{Duration, Instant};
use parking_lot::Mutex;
use tracing::trace;

use crate::shard::Shard;

/// Hooks a shard fires around its operations. Implementations must be
/// thread-safe; hooks for one shard may run concurrently.
pub trait ExpirationService: Send + Sync {
    /// Before the shard guard is acquired. Safe to call back into the
    /// shard.
    fn before_lock(&self, _key: u64, _shard: &Shard) {}

    /// After the guard is acquired, before the operation touches the
    /// entry. May call [`Shard::unsafe_delete`].
    fn lock(&self, _key: u64, _shard: &Shard) {}

    /// After a put has written its payload, before the guard is released.
    /// May call [`Shard::unsafe_delete`].
    fn access(&self, _key: u64, _shard: &Shard) {}

    /// After the guard is released. Safe to call back into the shard.
    fn after_access(&self, _key: u64, _shard: &Shard) {}

    /// Inside delete, after the guard is acquired.
    fn remove(&self, _key: u64, _shard: &Shard) {}
}

/// How a shard treats entries older than the configured duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationPolicy {
    /// Evict a stale entry when its own key is next accessed. Cheap, but
    /// entries of abandoned keys are never reclaimed.
    Passive,
    /// Scan all recorded keys once per expiry window and evict every
    /// stale one. Bounded staleness, with a latency spike proportional to
    /// the shard's key count on the first operation of each window.
    Sweep,
}

/// Builds one expiration service per shard, given the shard index.
pub type ExpirationFactory = Arc<dyn Fn(usize) -> Box<dyn ExpirationService> + Send + Sync>;

/// Factory for the built-in policies.
pub fn expires(duration: std::time::Duration, policy: ExpirationPolicy) -> ExpirationFactory {
    let expires = Duration::from_nanos(duration.as_nanos() as u64);
    Arc::new(move |_shard_index| match policy {
        ExpirationPolicy::Passive => Box::new(PassiveExpiration::new(expires)),
        ExpirationPolicy::Sweep => Box::new(SweepExpiration::new(expires)),
    })
}

type AccessMap = HashMap<u64, Instant, ahash::RandomState>;

struct PassiveExpiration {
    accesses: Mutex<AccessMap>,
    expires: Duration,
}

impl PassiveExpiration {
    fn new(expires: Duration) -> Self {
        Self {
            accesses: Mutex::new(AccessMap::default()),
            expires,
        }
    }
}

impl ExpirationService for PassiveExpiration {
    fn lock(&self, key: u64, shard: &Shard) {
        let now = Instant::now();
        let mut accesses = self.accesses.lock();
        if let Some(last) = accesses.get_mut(&key) {
            if now - *last < self.expires {
                *last = now;
                return;
            }
        }
        // Stale or unknown: drop the entry. Unknown keys miss harmlessly.
        if shard.unsafe_delete(key) {
            shard.metrics().expired.increment();
        }
        accesses.remove(&key);
    }

    fn access(&self, key: u64, _shard: &Shard) {
        self.accesses.lock().insert(key, Instant::now());
    }

    fn remove(&self, key: u64, _shard: &Shard) {
        self.accesses.lock().remove(&key);
    }
}

struct SweepState {
    accesses: AccessMap,
    last_check: Instant,
}

struct SweepExpiration {
    state: Mutex<SweepState>,
    expires: Duration,
}

impl SweepExpiration {
    fn new(expires: Duration) -> Self {
        Self {
            state: Mutex::new(SweepState {
                accesses: AccessMap::default(),
                last_check: Instant::now(),
            }),
            expires,
        }
    }
}

impl ExpirationService for SweepExpiration {
    fn lock(&self, _key: u64, shard: &Shard) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if now - state.last_check < self.expires {
            return;
        }
        let before = state.accesses.len();
        state.accesses.retain(|&key, last| {
            if now - *last > self.expires {
                if shard.unsafe_delete(key) {
                    shard.metrics().expired.increment();
                }
                false
            } else {
                true
            }
        });
        state.last_check = now;
        trace!(
            scanned = before,
            remaining = state.accesses.len(),
            "sweep pass"
        );
        shard.metrics().sweep_pass.increment();
    }

    fn access(&self, key: u64, _shard: &Shard) {
        self.state.lock().accesses.insert(key, Instant::now());
    }

    fn remove(&self, key: u64, _shard: &Shard) {
        self.state.lock().accesses.remove(&key);
    }
}
