//! Concurrent open-addressed index mapping 64-bit hashed keys to slot
//! numbers.
//!
//! The table is an array of `(key, value)` atomic cells probed linearly
//! from a scrambled start position. Key word 0 marks an empty cell, so
//! the real key 0 lives in a dedicated side channel. Two sentinel value
//! words drive the concurrent protocol:
//!
//! - `TOMBSTONE`: the key was deleted. The key word is never cleared and
//!   entries are never shifted back, so probe chains stay intact; only a
//!   put of the same key revives the cell.
//! - `TRANSIENT`: the cell is being hoisted into the next generation.
//!   Readers and writers that observe it retry against the map, which
//!   routes them to the newer generation.
//!
//! # Growth
//!
//! The map holds one live generation plus, while a grow-and-copy is in
//! flight, a `next` generation. Once `next` is published every new insert
//! targets it. The grower swaps each old cell's value with `TRANSIENT`
//! and re-inserts live entries into `next` (skipping keys that already
//! appeared there, which are newer), then swaps `current := next`. Two
//! triggers request growth: a probe that visits `MAX_STEPS` cells without
//! placing (overstep; rebuilds at factor `1 + pressure`, which at rest
//! purges tombstones without resizing) and an insert that pushes the live
//! count past the load limit (sizebang; factor 2).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::sync::Spinner;

/// Key word marking an empty cell; the real key 0 uses the side channel.
const FREE: u64 = 0;

/// Value word of a deleted entry.
const TOMBSTONE: u64 = u64::MAX;

/// Value word of an entry being moved to the next generation.
const TRANSIENT: u64 = u64::MAX - 1;

/// Value word of a cell whose key is claimed but whose value has not been
/// installed yet. Stored values must therefore be non-zero; the shard
/// guarantees this by never handing out slot 0.
const PENDING: u64 = 0;

/// Fibonacci-derived multiplier used to scatter poorly distributed keys.
const PHI: u64 = 0x9E37_79B9;

/// Probe bound. A chain longer than this requests growth instead.
const MAX_STEPS: usize = 64;

const INITIAL_CELLS: usize = 64;

#[inline]
fn scramble(key: u64) -> u64 {
    let hash = key.wrapping_mul(PHI);
    hash ^ (hash >> 16)
}

struct Cell {
    key: AtomicU64,
    value: AtomicU64,
}

enum PutOutcome {
    /// Value installed. `sizebang` is set when this insert pushed the
    /// live count past the load limit.
    Done { sizebang: bool },
    /// Probe bound exhausted without placing the entry.
    Overstep,
    /// Hit a TRANSIENT cell; the entry belongs in a newer generation.
    Moved,
}

enum GetOutcome {
    Found(u64),
    /// Key present but deleted. Authoritative for this generation and
    /// any older one.
    Tomb,
    /// Key not in this generation.
    Empty,
    Moved,
}

enum DeleteOutcome {
    Deleted(u64),
    Tomb,
    Empty,
    Moved,
}

/// One table generation. All cell access is atomic; the struct itself is
/// immutable after construction.
struct Generation {
    cells: Box<[Cell]>,
    /// Mask over probe start positions (half the cell count).
    cap_mask: u64,
    /// Live-entry limit past which inserts request doubling.
    max_load: u64,
    live: AtomicU64,
    free_set: AtomicBool,
    free_val: AtomicU64,
}

impl Generation {
    fn new(cells: usize) -> Self {
        debug_assert!(cells.is_power_of_two());
        let cells = (0..cells)
            .map(|_| Cell {
                key: AtomicU64::new(FREE),
                value: AtomicU64::new(PENDING),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let count = cells.len() as u64;
        Self {
            cells,
            cap_mask: count / 2 - 1,
            max_load: count / 2 - count / 8,
            live: AtomicU64::new(0),
            free_set: AtomicBool::new(false),
            free_val: AtomicU64::new(0),
        }
    }

    #[inline]
    fn start(&self, key: u64) -> usize {
        (scramble(key) & self.cap_mask) as usize
    }

    #[inline]
    fn step(&self, index: usize) -> usize {
        (index + 1) & (self.cells.len() - 1)
    }

    fn put(&self, key: u64, value: u64) -> PutOutcome {
        debug_assert!(key != FREE);
        debug_assert!(value != PENDING && value < TRANSIENT);
        let mut index = self.start(key);
        for _ in 0..MAX_STEPS {
            let cell = &self.cells[index];
            let seen_key = cell.key.load(Ordering::Acquire);
            let claimed;
            if seen_key == FREE {
                match cell
                    .key
                    .compare_exchange(FREE, key, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => claimed = true,
                    Err(raced) if raced == key => claimed = false,
                    Err(_) => {
                        index = self.step(index);
                        continue;
                    }
                }
            } else if seen_key == key {
                claimed = false;
            } else {
                index = self.step(index);
                continue;
            }

            // The cell is keyed by `key`; install the value.
            loop {
                let seen_val = cell.value.load(Ordering::Acquire);
                if seen_val == TRANSIENT {
                    return PutOutcome::Moved;
                }
                if cell
                    .value
                    .compare_exchange(seen_val, value, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // The claim (or a tombstone revival) created a live
                    // entry; racing writers that lost the claim only
                    // overwrite and must not count it twice.
                    if claimed || seen_val == TOMBSTONE {
                        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
                        return PutOutcome::Done {
                            sizebang: live > self.max_load,
                        };
                    }
                    return PutOutcome::Done { sizebang: false };
                }
            }
        }
        PutOutcome::Overstep
    }

    fn get(&self, key: u64) -> GetOutcome {
        debug_assert!(key != FREE);
        let mut index = self.start(key);
        for _ in 0..MAX_STEPS {
            let cell = &self.cells[index];
            let seen_key = cell.key.load(Ordering::Acquire);
            if seen_key == FREE {
                return GetOutcome::Empty;
            }
            if seen_key == key {
                return match cell.value.load(Ordering::Acquire) {
                    TOMBSTONE => GetOutcome::Tomb,
                    TRANSIENT | PENDING => GetOutcome::Moved,
                    value => GetOutcome::Found(value),
                };
            }
            index = self.step(index);
        }
        GetOutcome::Empty
    }

    fn delete(&self, key: u64) -> DeleteOutcome {
        debug_assert!(key != FREE);
        let mut index = self.start(key);
        for _ in 0..MAX_STEPS {
            let cell = &self.cells[index];
            let seen_key = cell.key.load(Ordering::Acquire);
            if seen_key == FREE {
                return DeleteOutcome::Empty;
            }
            if seen_key == key {
                loop {
                    let seen_val = cell.value.load(Ordering::Acquire);
                    match seen_val {
                        TOMBSTONE => return DeleteOutcome::Tomb,
                        // Moved covers both a mid-flight hoist and a
                        // mid-flight insert; the caller retries either way.
                        TRANSIENT | PENDING => return DeleteOutcome::Moved,
                        value => {
                            if cell
                                .value
                                .compare_exchange(
                                    value,
                                    TOMBSTONE,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                            {
                                self.live.fetch_sub(1, Ordering::Relaxed);
                                return DeleteOutcome::Deleted(value);
                            }
                        }
                    }
                }
            }
            index = self.step(index);
        }
        DeleteOutcome::Empty
    }

    /// Insert used during migration. Keys already present in the target
    /// (in any state, tombstones included) are newer than the hoisted
    /// entry and win. Returns `false` on overstep.
    fn put_if_absent(&self, key: u64, value: u64) -> bool {
        let mut index = self.start(key);
        for _ in 0..MAX_STEPS {
            let cell = &self.cells[index];
            let seen_key = cell.key.load(Ordering::Acquire);
            if seen_key == key {
                return true;
            }
            if seen_key == FREE {
                match cell
                    .key
                    .compare_exchange(FREE, key, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        // The claim itself creates the entry even if a
                        // racing writer installs its value first.
                        self.live.fetch_add(1, Ordering::Relaxed);
                        let _ = cell.value.compare_exchange(
                            PENDING,
                            value,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        return true;
                    }
                    Err(raced) if raced == key => return true,
                    Err(_) => {}
                }
            }
            index = self.step(index);
        }
        false
    }

    fn put_free(&self, value: u64) {
        self.free_val.store(value, Ordering::Release);
        self.free_set.store(true, Ordering::Release);
    }

    fn get_free(&self) -> Option<u64> {
        if self.free_set.load(Ordering::Acquire) {
            Some(self.free_val.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn delete_free(&self) -> Option<u64> {
        if self.free_set.swap(false, Ordering::AcqRel) {
            Some(self.free_val.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn len(&self) -> u64 {
        self.live.load(Ordering::Relaxed) + u64::from(self.free_set.load(Ordering::Acquire))
    }
}

#[derive(Clone)]
struct Tables {
    current: Arc<Generation>,
    next: Option<Arc<Generation>>,
}

/// Lock-free hashed-key to slot-number index with hand-off growth.
pub struct IntMap {
    tables: RwLock<Tables>,
    grower: Mutex<()>,
}

impl IntMap {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                current: Arc::new(Generation::new(INITIAL_CELLS)),
                next: None,
            }),
            grower: Mutex::new(()),
        }
    }

    #[inline]
    fn snapshot(&self) -> Tables {
        self.tables.read().clone()
    }

    /// Newest generation: the growth target when one is in flight.
    #[inline]
    fn newest(tables: &Tables) -> &Arc<Generation> {
        tables.next.as_ref().unwrap_or(&tables.current)
    }

    pub fn put(&self, key: u64, value: u64) {
        if key == FREE {
            self.put_free(value);
            return;
        }
        let mut spin = Spinner::default();
        loop {
            let tables = self.snapshot();
            let target = Self::newest(&tables).clone();
            match target.put(key, value) {
                PutOutcome::Done { sizebang } => {
                    if sizebang {
                        self.grow(&target, 2, None);
                    }
                    return;
                }
                PutOutcome::Overstep => {
                    if self.grow(&target, 1, Some((key, value))) {
                        return;
                    }
                    // the triggering generation went stale under us
                }
                PutOutcome::Moved => spin.spin(),
            }
        }
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        if key == FREE {
            let tables = self.snapshot();
            if let Some(next) = &tables.next {
                if let Some(value) = next.get_free() {
                    return Some(value);
                }
            }
            return tables.current.get_free();
        }
        let mut spin = Spinner::default();
        loop {
            let tables = self.snapshot();
            if let Some(next) = &tables.next {
                match next.get(key) {
                    GetOutcome::Found(value) => return Some(value),
                    GetOutcome::Tomb => return None,
                    GetOutcome::Moved => {
                        spin.spin();
                        continue;
                    }
                    GetOutcome::Empty => {}
                }
            }
            match tables.current.get(key) {
                GetOutcome::Found(value) => return Some(value),
                GetOutcome::Tomb | GetOutcome::Empty => return None,
                GetOutcome::Moved => spin.spin(),
            }
        }
    }

    pub fn delete(&self, key: u64) -> Option<u64> {
        if key == FREE {
            return self.delete_free();
        }
        let mut spin = Spinner::default();
        loop {
            let tables = self.snapshot();
            if let Some(next) = &tables.next {
                match next.delete(key) {
                    DeleteOutcome::Deleted(value) => return Some(value),
                    DeleteOutcome::Tomb => return None,
                    DeleteOutcome::Moved => {
                        spin.spin();
                        continue;
                    }
                    DeleteOutcome::Empty => {}
                }
            }
            match tables.current.delete(key) {
                DeleteOutcome::Deleted(value) => return Some(value),
                DeleteOutcome::Tomb | DeleteOutcome::Empty => return None,
                DeleteOutcome::Moved => spin.spin(),
            }
        }
    }

    /// Live-entry count. Exact at rest; hoisted entries may be counted in
    /// both generations while a growth hand-off is in flight.
    pub fn len(&self) -> usize {
        let tables = self.snapshot();
        let mut count = tables.current.len();
        if let Some(next) = &tables.next {
            count += next.live.load(Ordering::Relaxed);
        }
        count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put_free(&self, value: u64) {
        loop {
            let tables = self.snapshot();
            let target = Self::newest(&tables).clone();
            target.put_free(value);
            // A hand-off that completed meanwhile may have missed the
            // store; redo against the generation that replaced the target.
            let tables = self.snapshot();
            if Arc::ptr_eq(Self::newest(&tables), &target) {
                return;
            }
        }
    }

    fn delete_free(&self) -> Option<u64> {
        let tables = self.snapshot();
        let mut prior = None;
        if let Some(next) = &tables.next {
            prior = next.delete_free();
        }
        match tables.current.delete_free() {
            Some(value) => Some(prior.unwrap_or(value)),
            None => prior,
        }
    }

    /// Grow-and-copy hand-off.
    ///
    /// Returns `false` without growing when `observed` is no longer the
    /// newest generation, which tells the caller to retry its operation.
    /// With `pending` set, the triggering entry is inserted into the new
    /// generation before the swap.
    fn grow(&self, observed: &Arc<Generation>, factor: usize, pending: Option<(u64, u64)>) -> bool {
        let _guard = self.grower.lock();
        let tables = self.snapshot();
        if !Arc::ptr_eq(Self::newest(&tables), observed) {
            return false;
        }

        // Newest first, so older hoisted values never clobber newer ones.
        let mut sources: Vec<Arc<Generation>> = Vec::with_capacity(3);
        if let Some(next) = &tables.next {
            sources.push(next.clone());
        }
        sources.push(tables.current.clone());

        let mut cells = observed.cells.len() * factor;
        loop {
            let replacement = Arc::new(Generation::new(cells));
            self.tables.write().next = Some(replacement.clone());

            let drained = sources
                .iter()
                .all(|source| Self::drain_into(source, &replacement));
            let placed = drained
                && match pending {
                    Some((key, value)) => {
                        !matches!(replacement.put(key, value), PutOutcome::Overstep)
                    }
                    None => true,
                };

            if placed {
                let mut tables = self.tables.write();
                tables.current = replacement;
                tables.next = None;
                drop(tables);
                debug!(cells, "index generation swapped");
                return true;
            }

            // Overstep during the rehash: double and retry. The abandoned
            // generation already holds hoisted and freshly inserted
            // entries, so it becomes the newest source.
            sources.insert(0, replacement);
            cells *= 2;
        }
    }

    /// Move every live entry of `source` into `target`.
    ///
    /// Each cell's value is swapped with TRANSIENT first, so a reader can
    /// never return a value that has been hoisted and a writer racing the
    /// swap fails its CAS and retries against the map. Returns `false` if
    /// `target` oversteps.
    fn drain_into(source: &Generation, target: &Generation) -> bool {
        for cell in source.cells.iter() {
            let value = cell.value.swap(TRANSIENT, Ordering::AcqRel);
            if value == TOMBSTONE || value == TRANSIENT || value == PENDING {
                continue;
            }
            let key = cell.key.load(Ordering::Acquire);
            debug_assert!(key != FREE, "live value in an unkeyed cell");
            if !target.put_if_absent(key, value) {
                return false;
            }
        }
        if source.free_set.load(Ordering::Acquire) && !target.free_set.load(Ordering::Acquire) {
            target.put_free(source.free_val.load(Ordering::Acquire));
        }
        true
    }
}

impl Default for IntMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn filled(n: u64) -> IntMap {
        let map = IntMap::new();
        for i in 1..=n {
            map.put(i, i);
        }
        map
    }

    #[test]
    fn put_then_get() {
        let map = filled(200);
        for i in 1..=200 {
            assert_eq!(map.get(i), Some(i), "key {i}");
        }
        assert_eq!(map.get(201), None);
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let map = IntMap::new();
        map.put(7, 1);
        map.put(7, 2);
        map.put(7, 3);
        assert_eq!(map.get(7), Some(3));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn delete_returns_value_once() {
        let map = filled(200);
        for i in 1..=200 {
            assert_eq!(map.delete(i), Some(i), "key {i}");
        }
        for i in 1..=200 {
            assert_eq!(map.delete(i), None, "key {i}");
        }
        assert_eq!(map.delete(201), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn zero_key_side_channel() {
        let map = IntMap::new();
        assert_eq!(map.get(0), None);
        map.put(0, 42);
        assert_eq!(map.get(0), Some(42));
        assert_eq!(map.delete(0), Some(42));
        assert_eq!(map.get(0), None);
        assert_eq!(map.delete(0), None);
    }

    #[test]
    fn tombstone_revival() {
        let map = IntMap::new();
        map.put(9, 10);
        assert_eq!(map.delete(9), Some(10));
        assert_eq!(map.get(9), None);
        map.put(9, 11);
        assert_eq!(map.get(9), Some(11));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn growth_preserves_entries() {
        let map = IntMap::new();
        for i in 1..=10_000u64 {
            map.put(i, i * 3);
        }
        for i in 1..=10_000u64 {
            assert_eq!(map.get(i), Some(i * 3), "key {i}");
        }
        assert_eq!(map.len(), 10_000);
    }

    #[test]
    fn reinsert_after_mass_delete() {
        let map = IntMap::new();
        for round in 0..3 {
            for i in 1..=1000u64 {
                map.put(i, i + round);
            }
            for i in 1..=1000u64 {
                assert_eq!(map.get(i), Some(i + round), "round {round} key {i}");
            }
            for i in 1..=1000u64 {
                assert_eq!(map.delete(i), Some(i + round), "round {round} key {i}");
            }
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn growth_carries_zero_key() {
        let map = IntMap::new();
        map.put(0, 99);
        for i in 1..=5000u64 {
            map.put(i, i);
        }
        assert_eq!(map.get(0), Some(99));
    }

    #[test]
    fn concurrent_disjoint_writers() {
        let map = Arc::new(IntMap::new());
        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                let base = worker * 100_000 + 1;
                for i in 0..5000 {
                    map.put(base + i, base + i);
                }
                for i in 0..5000 {
                    assert_eq!(map.get(base + i), Some(base + i));
                }
                for i in (0..5000).step_by(2) {
                    assert_eq!(map.delete(base + i), Some(base + i));
                }
                for i in 0..5000 {
                    let expected = if i % 2 == 0 { None } else { Some(base + i) };
                    assert_eq!(map.get(base + i), expected);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 4 * 2500);
    }

    #[test]
    fn concurrent_shared_key_hammer() {
        let map = Arc::new(IntMap::new());
        let mut handles = Vec::new();
        for worker in 1..=4u64 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    map.put(13, worker * 1_000_000 + i);
                    if let Some(value) = map.get(13) {
                        // any observed value must be one some writer put
                        assert!(value >= 1_000_000);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(map.get(13).is_some());
    }
}
