use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter.
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease.
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn add(&self, value: i64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn sub(&self, value: i64) {
        self.0.fetch_sub(value, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-map metrics for observability and testing.
///
/// Each map instance owns its metrics and all of its shards share them,
/// so multiple maps in one process stay independent and tests can assert
/// on exact counts.
pub struct CacheMetrics {
    // Operations
    pub put: Counter,
    pub put_rejected: Counter,
    pub get_hit: Counter,
    pub get_miss: Counter,
    pub delete: Counter,
    pub delete_miss: Counter,

    // Slot lifecycle
    pub slot_alloc: Counter,
    pub slot_reuse: Counter,
    pub slot_free: Counter,

    // Contention
    pub put_retry: Counter,
    pub get_retry: Counter,

    // Growth
    pub arena_grow: Counter,

    // Expiration
    pub expired: Counter,
    pub sweep_pass: Counter,

    // Current state
    pub arena_bytes: Gauge,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            put: Counter::new(),
            put_rejected: Counter::new(),
            get_hit: Counter::new(),
            get_miss: Counter::new(),
            delete: Counter::new(),
            delete_miss: Counter::new(),
            slot_alloc: Counter::new(),
            slot_reuse: Counter::new(),
            slot_free: Counter::new(),
            put_retry: Counter::new(),
            get_retry: Counter::new(),
            arena_grow: Counter::new(),
            expired: Counter::new(),
            sweep_pass: Counter::new(),
            arena_bytes: Gauge::new(),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
