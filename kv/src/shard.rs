//! A fixed-size sharded map over the byte-oriented [`Engine`] contract.
//!
//! Each shard owns one `Engine` instance behind its own `parking_lot`
//! reader-writer lock, preserving the single-threaded "serialized access"
//! assumption documented on the trait while giving N-way write parallelism
//! for key-disjoint workloads.

use parking_lot::RwLock;

use crate::error::CResult;
use crate::storage::engine::Engine;
use crate::storage::memory::Memory;

/// Default shard count, a power of two so the index can be computed with a
/// mask instead of a modulo.
pub const DEFAULT_SHARDS: usize = 512;

fn fnv1a(key: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in key {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A sharded byte-oriented key-value map. Generic over the backing
/// [`Engine`] so tests can use `Memory` while production deployments use
/// `LogCask`.
pub struct ShardedMap<E: Engine> {
    shards: Vec<RwLock<E>>,
    mask: u64,
}

impl<E: Engine> ShardedMap<E> {
    /// Builds a sharded map from `n` pre-constructed engines. `n` must be a
    /// power of two.
    pub fn new(engines: Vec<E>) -> Self {
        let n = engines.len();
        assert!(n.is_power_of_two(), "shard count must be a power of two, got {}", n);
        Self { shards: engines.into_iter().map(RwLock::new).collect(), mask: (n as u64) - 1 }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, key: &[u8]) -> usize {
        (fnv1a(key) & self.mask) as usize
    }

    pub fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let idx = self.shard_index(key);
        self.shards[idx].write().get(key)
    }

    pub fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let idx = self.shard_index(key);
        self.shards[idx].write().set(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> CResult<i64> {
        let idx = self.shard_index(key);
        self.shards[idx].write().delete(key)
    }

    /// Groups `keys` by target shard so a caller (e.g. the apply pipeline)
    /// can lock each shard once for a batch of operations.
    pub fn group_by_shard<'a>(&self, keys: impl IntoIterator<Item = &'a [u8]>) -> Vec<Vec<&'a [u8]>> {
        let mut groups = vec![Vec::new(); self.shards.len()];
        for key in keys {
            groups[self.shard_index(key)].push(key);
        }
        groups
    }

    /// Locks a single shard for a caller that wants to apply several
    /// operations under one write-lock acquisition (the apply pipeline's
    /// per-type batch-apply step).
    pub fn with_shard_mut<R>(&self, idx: usize, f: impl FnOnce(&mut E) -> CResult<R>) -> CResult<R> {
        f(&mut self.shards[idx].write())
    }

    /// Range scan across all shards: `start <= key < end`, with an empty
    /// `end` or `end == "\x00"` meaning unbounded-high. Locks shards in
    /// fixed index order to avoid deadlock, collects, releases, then sorts
    /// and truncates.
    pub fn range(&self, start: &[u8], end: &[u8], limit: usize) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut engine = shard.write();
            let lo = std::ops::Bound::Included(start.to_vec());
            let hi = if end.is_empty() || end == b"\x00" {
                std::ops::Bound::Unbounded
            } else {
                std::ops::Bound::Excluded(end.to_vec())
            };
            for item in engine.scan_dyn((lo, hi)) {
                out.push(item?);
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        if limit > 0 && out.len() > limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Snapshot bulk read under all-shard locks, for the snapshot
    /// serializer: all live key/value pairs in no particular cross-shard
    /// order.
    pub fn get_all(&self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let mut engine = shard.write();
            for item in engine.scan_dyn((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)) {
                out.push(item?);
            }
        }
        Ok(out)
    }

    /// Bulk load, used when restoring a snapshot. Assumes the map is empty
    /// or that overwriting existing keys is acceptable.
    pub fn set_all(&self, items: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> CResult<()> {
        for (key, value) in items {
            self.set(&key, value)?;
        }
        Ok(())
    }
}

impl ShardedMap<Memory> {
    /// Convenience constructor for tests and the in-memory default
    /// deployment: `n` fresh `Memory` engines.
    pub fn new_memory(n: usize) -> Self {
        Self::new((0..n).map(|_| Memory::new()).collect())
    }
}

impl Default for ShardedMap<Memory> {
    fn default() -> Self {
        Self::new_memory(DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_always_hashes_to_same_shard() {
        let map = ShardedMap::new_memory(16);
        let a = map.shard_index(b"hello");
        let b = map.shard_index(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let map = ShardedMap::new_memory(8);
        map.set(b"a", b"1".to_vec()).unwrap();
        assert_eq!(map.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(map.delete(b"a").unwrap(), 1);
        assert_eq!(map.get(b"a").unwrap(), None);
    }

    #[test]
    fn range_sorts_and_truncates_across_shards() {
        let map = ShardedMap::new_memory(8);
        for k in [b"c".to_vec(), b"a".to_vec(), b"b".to_vec(), b"d".to_vec()] {
            map.set(&k, vec![0]).unwrap();
        }
        let got = map.range(b"\x00", b"", 2).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, b"a");
        assert_eq!(got[1].0, b"b");
    }

    #[test]
    fn range_with_nul_end_is_unbounded_above_from_a_real_start() {
        let map = ShardedMap::new_memory(8);
        for k in [b"a".to_vec(), b"b".to_vec(), b"d".to_vec()] {
            map.set(&k, vec![0]).unwrap();
        }
        let got = map.range(b"b", b"\x00", 0).unwrap();
        assert_eq!(got.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec![b"b".to_vec(), b"d".to_vec()]);
    }
}
