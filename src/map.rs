//! Sharded byte-array map.
//!
//! Keys are hashed with FNV-1a 64 and routed to one of N shards; each
//! shard owns its own arena, index, and free queue, so there is no global
//! lock and operations on different shards never contend. Values are
//! copied in on put and copied out on get, which keeps payload bytes out
//! of the caller's object graph entirely.

use std::sync::Arc;

use tracing::debug;

use crate::expiration::ExpirationFactory;
use crate::metrics::CacheMetrics;
use crate::shard::Shard;
use crate::Error;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Default initial arena capacity per shard, in bytes.
pub const DEFAULT_CAPACITY: u64 = 1024;

const FNV_OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// FNV-1a 64-bit hash, used for both shard dispatch and the index key.
#[inline]
pub fn fnv64(key: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Builder for a [`ByteMap`].
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use bytemap::{ByteMap, ExpirationPolicy, expires};
///
/// let map = ByteMap::builder(256)
///     .shard_count(32)
///     .initial_capacity(64 * 1024)
///     .expiration(expires(Duration::from_secs(60), ExpirationPolicy::Sweep))
///     .build();
/// ```
pub struct ByteMapBuilder {
    entry_size: u64,
    shard_count: usize,
    initial_capacity: u64,
    expiration: Option<ExpirationFactory>,
}

impl ByteMapBuilder {
    fn new(entry_size: u64) -> Self {
        Self {
            entry_size,
            shard_count: DEFAULT_SHARDS,
            initial_capacity: DEFAULT_CAPACITY,
            expiration: None,
        }
    }

    /// Number of shards (default 16). More shards lower contention at the
    /// cost of per-shard overhead; benchmark your workload to tune.
    pub fn shard_count(mut self, count: usize) -> Self {
        assert!(count >= 1, "shard count must be at least 1");
        self.shard_count = count;
        self
    }

    /// Initial arena bytes per shard (default 1024). Arenas double on
    /// demand and never shrink, so this only saves early growth steps for
    /// workloads whose size is known up front.
    pub fn initial_capacity(mut self, bytes: u64) -> Self {
        self.initial_capacity = bytes;
        self
    }

    /// Install an expiration factory; one service is built per shard.
    /// Without one, entries never expire.
    pub fn expiration(mut self, factory: ExpirationFactory) -> Self {
        self.expiration = Some(factory);
        self
    }

    pub fn build(self) -> ByteMap {
        let metrics = Arc::new(CacheMetrics::new());
        let shards = (0..self.shard_count)
            .map(|index| {
                let service = self.expiration.as_ref().map(|factory| factory(index));
                Shard::new(
                    self.initial_capacity,
                    self.entry_size,
                    service,
                    Arc::clone(&metrics),
                )
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        debug!(
            shards = shards.len(),
            entry_size = self.entry_size,
            initial_capacity = self.initial_capacity,
            expiring = self.expiration.is_some(),
            "bytemap created"
        );
        ByteMap { shards, metrics }
    }
}

/// Sharded byte-array backed key to value map.
///
/// `entry_size` fixes the largest value a slot can hold; smaller values
/// are fine, larger ones are rejected with [`Error::ValueTooLarge`].
pub struct ByteMap {
    shards: Box<[Shard]>,
    metrics: Arc<CacheMetrics>,
}

impl ByteMap {
    /// Create a map with default configuration.
    pub fn new(entry_size: u64) -> Self {
        Self::builder(entry_size).build()
    }

    /// Start building a map with explicit configuration.
    pub fn builder(entry_size: u64) -> ByteMapBuilder {
        ByteMapBuilder::new(entry_size)
    }

    /// Store a value under a key of any length. Returns
    /// [`Error::ValueTooLarge`] when the value exceeds the entry size, in
    /// which case nothing changes.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let (shard, hash) = self.select_shard(key);
        shard.put(hash, value)
    }

    /// Fetch a copy of the value stored under the key. The returned
    /// buffer is the caller's to mutate.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let (shard, hash) = self.select_shard(key);
        shard.get(hash)
    }

    /// Allocation-free variant of [`get`](Self::get): copies into `dst`
    /// and returns the payload length. `dst` must be at least
    /// `entry_size` bytes.
    pub fn get_into(&self, key: &[u8], dst: &mut [u8]) -> Option<usize> {
        let (shard, hash) = self.select_shard(key);
        shard.get_into(hash, dst)
    }

    /// Remove a key, returning whether it existed. Memory is not
    /// returned to the allocator; the entry's slot is reused by later
    /// puts.
    pub fn delete(&self, key: &[u8]) -> bool {
        let (shard, hash) = self.select_shard(key);
        shard.delete(hash)
    }

    /// The shard responsible for a key, along with the key's hash.
    pub fn select_shard(&self, key: &[u8]) -> (&Shard, u64) {
        let hash = fnv64(key);
        let shard = &self.shards[(hash % self.shards.len() as u64) as usize];
        (shard, hash)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shards in index order, for introspection.
    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter()
    }

    /// Total live entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Shard::is_empty)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::{expires, ExpirationPolicy};
    use rand::Rng;
    use std::thread::sleep;
    use std::time::Duration;

    fn random_bytes(rng: &mut impl Rng, n: usize) -> Vec<u8> {
        (0..n).map(|_| rng.gen()).collect()
    }

    #[test]
    fn fnv64_reference_vectors() {
        assert_eq!(fnv64(b""), 0xCBF2_9CE4_8422_2325);
        assert_eq!(fnv64(b"a"), 0xAF63_DC4C_8601_EC8C);
        assert_eq!(fnv64(b"foobar"), 0x8594_4171_F739_67E8);
        assert_eq!(fnv64(b"gen-0"), 0x4D0C_D49A_741E_1628);
    }

    #[test]
    fn single_key_lifecycle() {
        let map = ByteMap::new(100);
        map.put(b"k1", &[0x41; 50]).unwrap();
        assert_eq!(map.get(b"k1").as_deref(), Some(&[0x41; 50][..]));
        assert!(map.delete(b"k1"));
        assert_eq!(map.get(b"k1"), None);
        assert!(!map.delete(b"k1"));
    }

    #[test]
    fn rejected_put_leaves_old_value() {
        let map = ByteMap::new(100);
        map.put(b"k1", &[1u8; 100]).unwrap();
        assert!(matches!(
            map.put(b"k1", &[2u8; 120]),
            Err(Error::ValueTooLarge {
                len: 120,
                entry_size: 100
            })
        ));
        assert_eq!(map.get(b"k1").as_deref(), Some(&[1u8; 100][..]));
    }

    #[test]
    fn random_corpus_roundtrip() {
        let mut rng = rand::thread_rng();
        let count = 4096 * 8;
        let keys: Vec<Vec<u8>> = (0..count).map(|_| random_bytes(&mut rng, 10)).collect();
        let vals: Vec<Vec<u8>> = (0..count).map(|_| random_bytes(&mut rng, 100)).collect();

        let map = ByteMap::new(100);
        for (key, val) in keys.iter().zip(&vals) {
            map.put(key, val).unwrap();
        }
        for (key, val) in keys.iter().zip(&vals) {
            assert_eq!(map.get(key).as_deref(), Some(&val[..]));
        }
        for key in &keys {
            assert!(map.delete(key));
        }
        for (key, val) in keys.iter().zip(&vals) {
            map.put(key, val).unwrap();
        }
        for (key, val) in keys.iter().zip(&vals) {
            assert_eq!(map.get(key).as_deref(), Some(&val[..]));
        }
    }

    #[test]
    fn configured_shards_and_growth() {
        let map = ByteMap::builder(100)
            .shard_count(3)
            .initial_capacity(128)
            .build();
        assert_eq!(map.shard_count(), 3);
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let key = random_bytes(&mut rng, 12);
            map.put(&key, &[0xAAu8; 100]).unwrap();
        }
        assert!(map.shards().any(|shard| shard.arena_len() > 128));
        assert!(map.metrics().arena_grow.value() > 0);
    }

    #[test]
    fn builder_carries_expiration() {
        let map = ByteMap::builder(100)
            .shard_count(3)
            .initial_capacity(128)
            .expiration(expires(Duration::from_secs(3600), ExpirationPolicy::Passive))
            .build();
        assert_eq!(map.shard_count(), 3);
        // arena rounds the configured bytes up to whole slots
        for shard in map.shards() {
            assert!(shard.arena_len() >= 128);
            assert_eq!(shard.arena_len() % (100 + 8), 0);
        }
        map.put(b"warm", &[1u8; 32]).unwrap();
        assert!(map.get(b"warm").is_some());
    }

    #[test]
    fn sweep_expiration_end_to_end() {
        let expiry = Duration::from_millis(150);
        let map = ByteMap::builder(100)
            .expiration(expires(expiry, ExpirationPolicy::Sweep))
            .build();
        let keys: Vec<Vec<u8>> = (0..2048).map(|i| format!("gen-{i}").into_bytes()).collect();
        for key in &keys {
            map.put(key, &[0x7Fu8; 100]).unwrap();
        }
        for key in &keys {
            assert!(map.get(key).is_some());
        }
        sleep(expiry * 2);
        for key in &keys {
            assert_eq!(map.get(key), None);
        }
        assert!(map.is_empty());
    }

    #[test]
    fn passive_expiration_end_to_end() {
        let expiry = Duration::from_millis(150);
        let map = ByteMap::builder(100)
            .expiration(expires(expiry, ExpirationPolicy::Passive))
            .build();
        let keys: Vec<Vec<u8>> = (0..2048).map(|i| format!("gen-{i}").into_bytes()).collect();
        for key in &keys {
            map.put(key, &[0x55u8; 100]).unwrap();
        }
        let arena_bytes = map.metrics().arena_bytes.value();
        sleep(expiry * 2);
        for key in &keys {
            assert_eq!(map.get(key), None);
        }
        // passive eviction frees slots but never arena memory
        assert_eq!(map.metrics().arena_bytes.value(), arena_bytes);
    }

    #[test]
    fn get_into_avoids_allocation() {
        let map = ByteMap::new(100);
        map.put(b"k1", b"twelve bytes").unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(map.get_into(b"k1", &mut buf), Some(12));
        assert_eq!(&buf[..12], b"twelve bytes");
        assert_eq!(map.get_into(b"missing", &mut buf), None);
    }

    #[test]
    fn empty_key_and_empty_value() {
        let map = ByteMap::new(100);
        map.put(b"", b"value-for-empty-key").unwrap();
        assert_eq!(map.get(b"").as_deref(), Some(&b"value-for-empty-key"[..]));
        map.put(b"empty-value", b"").unwrap();
        assert_eq!(map.get(b"empty-value").as_deref(), Some(&b""[..]));
    }

    #[test]
    fn returned_buffer_is_a_copy() {
        let map = ByteMap::new(100);
        map.put(b"k1", &[9u8; 16]).unwrap();
        let mut copy = map.get(b"k1").unwrap();
        copy.iter_mut().for_each(|byte| *byte = 0);
        assert_eq!(map.get(b"k1").as_deref(), Some(&[9u8; 16][..]));
    }

    #[test]
    fn concurrent_mixed_workload() {
        let map = std::sync::Arc::new(ByteMap::new(100));
        let mut handles = Vec::new();
        for worker in 0..8usize {
            let map = std::sync::Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in 0..2000usize {
                    let key = format!("gen-{worker}-{i}");
                    let key = key.as_bytes();
                    match i % 3 {
                        0 => {
                            let mut value = vec![0u8; 100];
                            value[..8].copy_from_slice(&(i as u64).to_le_bytes());
                            map.put(key, &value).unwrap();
                        }
                        1 => {
                            // may or may not be present depending on phase
                            let _ = map.get(key);
                        }
                        _ => {
                            let _ = map.delete(key);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
