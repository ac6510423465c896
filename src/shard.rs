//! A shard: one arena of fixed-size slots, its index, and the optimistic
//! synchronisation protocol tying them together.
//!
//! Values live in a single contiguous heap allocation addressed by slot
//! number. Each slot is `entry_size + 8` bytes: a little-endian `u64`
//! length prefix followed by the payload, of which only the first
//! `length` bytes are live. The arena and its parallel per-slot lock
//! array are published together behind one swappable cell, so a reader
//! always pairs bytes with the locks that guard them.
//!
//! # Synchronisation
//!
//! The shard guard is a sequence lock used optimistically: Put and Get
//! take a read token and re-verify it at the end, Delete and arena growth
//! take it exclusively. Writes to a slot additionally hold that slot's
//! own write lock, which lets puts to distinct slots run in parallel.
//! Readers copy first and validate both tokens afterwards, discarding
//! the copy on any overlap.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::expiration::ExpirationService;
use crate::intmap::IntMap;
use crate::metrics::CacheMetrics;
use crate::slotqueue::SlotQueue;
use crate::sync::{SeqLock, Spinner};
use crate::Error;

/// Bytes of the per-slot length prefix.
pub const LENGTH_BYTES: u64 = 8;

/// The arena and its per-slot locks, replaced as one unit when the shard
/// grows.
struct Storage {
    data: *mut u8,
    layout: Layout,
    len: usize,
    locks: Box<[SeqLock]>,
}

// SAFETY: Storage is safe to share across threads because:
// 1. `data` is allocated once at construction and freed only in Drop,
//    and the shard keeps superseded storages alive via Arc until the
//    last reader drops its handle.
// 2. All byte access goes through raw-pointer reads and writes that are
//    serialised by the per-slot sequence locks plus the shard guard;
//    overlapped reads are detected and discarded by token validation.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn new(len: usize, slot_bytes: usize) -> Self {
        debug_assert!(len % slot_bytes == 0);
        let layout = Layout::from_size_align(len, 8).expect("arena layout");
        // SAFETY: layout has non-zero size (at least one slot).
        let data = unsafe { alloc_zeroed(layout) };
        if data.is_null() {
            handle_alloc_error(layout);
        }
        let locks = (0..len / slot_bytes)
            .map(|_| SeqLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            data,
            layout,
            len,
            locks,
        }
    }

    /// # Safety
    /// `offset + 8 + value.len()` must be within the arena and the caller
    /// must hold the slot's write lock.
    #[inline]
    unsafe fn write_entry(&self, offset: usize, value: &[u8]) {
        let slot = self.data.add(offset);
        (slot as *mut u64).write_unaligned((value.len() as u64).to_le());
        std::ptr::copy_nonoverlapping(value.as_ptr(), slot.add(LENGTH_BYTES as usize), value.len());
    }

    /// # Safety
    /// `offset + 8` must be within the arena. The result is only
    /// meaningful once the slot token validates.
    #[inline]
    unsafe fn read_length(&self, offset: usize) -> u64 {
        u64::from_le((self.data.add(offset) as *const u64).read_unaligned())
    }

    /// # Safety
    /// `offset + 8 + dst.len()` must be within the arena. The copy may be
    /// torn; the caller validates the slot token before using it.
    #[inline]
    unsafe fn read_payload(&self, offset: usize, dst: &mut [u8]) {
        std::ptr::copy_nonoverlapping(
            self.data.add(offset + LENGTH_BYTES as usize),
            dst.as_mut_ptr(),
            dst.len(),
        );
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: `data` was allocated with `layout` in `new` and is
        // freed exactly once.
        unsafe { dealloc(self.data, self.layout) }
    }
}

/// One horizontal partition of the map.
pub struct Shard {
    guard: SeqLock,
    index: IntMap,
    storage: RwLock<Arc<Storage>>,
    free_slots: Mutex<SlotQueue>,
    /// Next never-used slot number. Slot 0 is reserved because the index
    /// uses value word 0 to mark an in-flight insert.
    high_water: AtomicU64,
    entry_size: u64,
    expiration: Option<Box<dyn ExpirationService>>,
    metrics: Arc<CacheMetrics>,
}

impl Shard {
    /// `capacity` is the initial arena size in bytes; it is rounded up to
    /// a whole number of slots. `entry_size` is the largest payload a
    /// slot can hold and is fixed for the shard's lifetime.
    pub fn new(
        capacity: u64,
        entry_size: u64,
        expiration: Option<Box<dyn ExpirationService>>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        assert!(entry_size > 0, "entry size must be non-zero");
        let slot_bytes = entry_size + LENGTH_BYTES;
        let slots = capacity.div_ceil(slot_bytes).max(1);
        let len = (slots * slot_bytes) as usize;
        metrics.arena_bytes.add(len as i64);
        Self {
            guard: SeqLock::new(),
            index: IntMap::new(),
            storage: RwLock::new(Arc::new(Storage::new(len, slot_bytes as usize))),
            free_slots: Mutex::new(SlotQueue::new()),
            high_water: AtomicU64::new(1),
            entry_size,
            expiration,
            metrics,
        }
    }

    #[inline]
    fn slot_bytes(&self) -> u64 {
        self.entry_size + LENGTH_BYTES
    }

    #[inline]
    fn expiration(&self) -> Option<&dyn ExpirationService> {
        self.expiration.as_deref()
    }

    pub(crate) fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Largest payload this shard accepts.
    pub fn entry_size(&self) -> u64 {
        self.entry_size
    }

    /// Current arena length in bytes.
    pub fn arena_len(&self) -> usize {
        self.storage.read().len
    }

    /// Number of live entries in the index.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Store `value` under the hashed key, overwriting in place when the
    /// key already has a slot.
    pub fn put(&self, key: u64, value: &[u8]) -> Result<(), Error> {
        if value.len() as u64 > self.entry_size {
            self.metrics.put_rejected.increment();
            return Err(Error::ValueTooLarge {
                len: value.len(),
                entry_size: self.entry_size as usize,
            });
        }
        if let Some(service) = self.expiration() {
            service.before_lock(key, self);
        }
        let mut spin = Spinner::default();
        loop {
            let Some(token) = self.guard.read_begin() else {
                spin.spin();
                continue;
            };
            if let Some(service) = self.expiration() {
                service.lock(key, self);
            }
            let slot = match self.index.get(key) {
                Some(slot) => slot,
                None => {
                    let slot = match self.free_slots.lock().dequeue() {
                        Some(slot) => {
                            self.metrics.slot_reuse.increment();
                            slot
                        }
                        None => {
                            let slot = self.high_water.fetch_add(1, Ordering::Relaxed);
                            self.metrics.slot_alloc.increment();
                            self.grow_check(slot);
                            slot
                        }
                    };
                    self.index.put(key, slot);
                    slot
                }
            };
            let storage = self.storage.read().clone();
            let offset = (slot * self.slot_bytes()) as usize;
            let lock = &storage.locks[slot as usize];
            lock.write_lock();
            // SAFETY: the slot was fitted when it was first allocated and
            // arenas never shrink; value.len() <= entry_size was checked
            // above; the slot write lock is held.
            unsafe { storage.write_entry(offset, value) };
            lock.write_unlock();
            if self.guard.read_validate(token) {
                break;
            }
            // A delete or arena grow overlapped; the write may have
            // landed in a superseded arena, so redo it.
            self.metrics.put_retry.increment();
            spin.spin();
        }
        self.metrics.put.increment();
        if let Some(service) = self.expiration() {
            service.access(key, self);
            service.after_access(key, self);
        }
        Ok(())
    }

    /// Fetch a copy of the value stored under the hashed key.
    pub fn get(&self, key: u64) -> Option<Vec<u8>> {
        if let Some(service) = self.expiration() {
            service.before_lock(key, self);
        }
        let mut outer = Spinner::default();
        let result = loop {
            if let Some(service) = self.expiration() {
                service.lock(key, self);
            }
            let Some(token) = self.guard.read_begin() else {
                outer.spin();
                continue;
            };
            let Some(slot) = self.index.get(key) else {
                break None;
            };
            let storage = self.storage.read().clone();
            let offset = (slot * self.slot_bytes()) as usize;
            let lock = &storage.locks[slot as usize];
            let mut spin = Spinner::default();
            let slot_token = loop {
                match lock.read_begin() {
                    Some(token) => break token,
                    None => spin.spin(),
                }
            };
            // SAFETY: the slot lies within this storage; see put.
            let length = unsafe { storage.read_length(offset) };
            if !lock.read_validate(slot_token) {
                // length may be torn; retry before allocating
                self.metrics.get_retry.increment();
                continue;
            }
            let mut buf = vec![0u8; length as usize];
            // SAFETY: the validated length is at most entry_size, so the
            // payload range is in bounds.
            unsafe { storage.read_payload(offset, &mut buf) };
            if lock.read_validate(slot_token) && self.guard.read_validate(token) {
                break Some(buf);
            }
            self.metrics.get_retry.increment();
            outer.spin();
        };
        match &result {
            Some(_) => self.metrics.get_hit.increment(),
            None => self.metrics.get_miss.increment(),
        }
        if let Some(service) = self.expiration() {
            service.after_access(key, self);
        }
        result
    }

    /// Like [`get`](Self::get) but copies into a caller-supplied buffer
    /// and returns the payload length.
    ///
    /// `dst` must be at least `entry_size` bytes so any stored payload
    /// fits.
    pub fn get_into(&self, key: u64, dst: &mut [u8]) -> Option<usize> {
        assert!(
            dst.len() as u64 >= self.entry_size,
            "destination buffer shorter than entry size"
        );
        if let Some(service) = self.expiration() {
            service.before_lock(key, self);
        }
        let mut outer = Spinner::default();
        let result = loop {
            if let Some(service) = self.expiration() {
                service.lock(key, self);
            }
            let Some(token) = self.guard.read_begin() else {
                outer.spin();
                continue;
            };
            let Some(slot) = self.index.get(key) else {
                break None;
            };
            let storage = self.storage.read().clone();
            let offset = (slot * self.slot_bytes()) as usize;
            let lock = &storage.locks[slot as usize];
            let mut spin = Spinner::default();
            let slot_token = loop {
                match lock.read_begin() {
                    Some(token) => break token,
                    None => spin.spin(),
                }
            };
            // SAFETY: the slot lies within this storage; see put.
            let length = unsafe { storage.read_length(offset) };
            if !lock.read_validate(slot_token) {
                self.metrics.get_retry.increment();
                continue;
            }
            let length = length as usize;
            // SAFETY: the validated length is at most entry_size and dst
            // is at least entry_size bytes.
            unsafe { storage.read_payload(offset, &mut dst[..length]) };
            if lock.read_validate(slot_token) && self.guard.read_validate(token) {
                break Some(length);
            }
            self.metrics.get_retry.increment();
            outer.spin();
        };
        match &result {
            Some(_) => self.metrics.get_hit.increment(),
            None => self.metrics.get_miss.increment(),
        }
        if let Some(service) = self.expiration() {
            service.after_access(key, self);
        }
        result
    }

    /// Remove the hashed key, returning whether it existed. The slot goes
    /// back on the free queue; arena bytes are left in place.
    pub fn delete(&self, key: u64) -> bool {
        self.guard.write_lock();
        if let Some(service) = self.expiration() {
            service.remove(key, self);
        }
        let existed = self.unsafe_delete(key);
        self.guard.write_unlock();
        if existed {
            self.metrics.delete.increment();
        } else {
            self.metrics.delete_miss.increment();
        }
        existed
    }

    /// Slot-releasing primitive used by expiration services, which run at
    /// hook points where the shard guard is already accounted for.
    pub fn unsafe_delete(&self, key: u64) -> bool {
        match self.index.delete(key) {
            Some(slot) => {
                self.free_slots.lock().enqueue(slot);
                self.metrics.slot_free.increment();
                true
            }
            None => false,
        }
    }

    /// Ensure the arena covers `slot`, doubling under the shard exclusive
    /// when it does not. The new (arena, locks) pair is published as one
    /// unit; writers that raced the swap fail token validation and redo
    /// their write against the new arena.
    fn grow_check(&self, slot: u64) {
        let slot_bytes = self.slot_bytes();
        let required = ((slot + 1) * slot_bytes) as usize;
        if required <= self.storage.read().len {
            return;
        }
        self.guard.write_lock();
        let current = self.storage.read().clone();
        if required > current.len {
            let mut new_len = current.len;
            while required > new_len {
                new_len *= 2;
            }
            let grown = Storage::new(new_len, slot_bytes as usize);
            // SAFETY: both allocations are at least current.len bytes and
            // disjoint.
            unsafe { std::ptr::copy_nonoverlapping(current.data, grown.data, current.len) };
            debug!(
                old_len = current.len,
                new_len,
                entry_size = self.entry_size,
                "arena grown"
            );
            self.metrics.arena_grow.increment();
            self.metrics.arena_bytes.add((new_len - current.len) as i64);
            *self.storage.write() = Arc::new(grown);
        }
        self.guard.write_unlock();
    }
}
