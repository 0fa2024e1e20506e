//! Ties the per-key [`KeyIndex`](crate::mvcc::KeyIndex) to the sharded byte
//! store, and keeps a revision-ordered history log so reads `at_rev` for a
//! revision below the current one can still be answered until compaction
//! drops it.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::mvcc::{KeyIndex, Revision};
use crate::shard::ShardedMap;
use crate::storage::engine::Engine;

/// The full record etcd calls a "key-value": the user's bytes plus the MVCC
/// bookkeeping fields callers can compare against in transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: i64,
    /// 0 means "no lease attached".
    pub lease: i64,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    key: Vec<u8>,
    kv: Option<KeyValue>,
}

pub struct MvccStore<E: Engine> {
    shards: ShardedMap<E>,
    index: RwLock<HashMap<Vec<u8>, KeyIndex>>,
    history: RwLock<BTreeMap<Revision, HistoryEntry>>,
    compacted_revision: RwLock<i64>,
}

impl<E: Engine> MvccStore<E> {
    pub fn new(shards: ShardedMap<E>) -> Self {
        Self {
            shards,
            index: RwLock::new(HashMap::new()),
            history: RwLock::new(BTreeMap::new()),
            compacted_revision: RwLock::new(0),
        }
    }

    pub fn shards(&self) -> &ShardedMap<E> {
        &self.shards
    }

    /// Applies a put at `rev`, returning the new record and the previous one
    /// (if any), for watch fan-out's `prev_kv`.
    pub fn put(&self, key: &[u8], value: Vec<u8>, lease: i64, rev: Revision) -> CResult<(KeyValue, Option<KeyValue>)> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let prev = self.get(key)?;

        let mut index = self.index.write();
        let entry = index.entry(key.to_vec()).or_default();
        entry.put(rev);
        let create_revision = entry.create_revision().unwrap_or(rev);
        let version = entry.version();
        drop(index);

        let kv = KeyValue { key: key.to_vec(), value, create_revision, mod_revision: rev, version, lease };

        self.shards.set(key, bincode::serialize(&kv)?)?;
        self.history.write().insert(rev, HistoryEntry { key: key.to_vec(), kv: Some(kv.clone()) });

        Ok((kv, prev))
    }

    /// Applies a delete at `rev`. Returns the tombstoned record, if the key
    /// existed, for watch fan-out's `prev_kv`. No-op (returns `None`) if the
    /// key was already absent.
    pub fn delete(&self, key: &[u8], rev: Revision) -> CResult<Option<KeyValue>> {
        let prev = self.get(key)?;
        if prev.is_none() {
            return Ok(None);
        }

        let mut index = self.index.write();
        if let Some(entry) = index.get_mut(key) {
            entry.tombstone(rev);
        }
        drop(index);

        self.shards.delete(key)?;
        self.history.write().insert(rev, HistoryEntry { key: key.to_vec(), kv: None });

        Ok(prev)
    }

    /// Current-state read: the live value at the key, or `None` if absent or
    /// tombstoned.
    pub fn get(&self, key: &[u8]) -> CResult<Option<KeyValue>> {
        match self.shards.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Historical read as of `at_rev`. Fails with `Compacted` if `at_rev` is
    /// below the compaction watermark, or `FutureRevision` if it's beyond
    /// what's been applied (callers pass the current revision to check
    /// that).
    pub fn get_at(&self, key: &[u8], at_rev: Revision, current_revision: Revision) -> CResult<Option<KeyValue>> {
        let compacted = *self.compacted_revision.read();
        if at_rev.main != 0 && at_rev.main < compacted {
            return Err(Error::Compacted { compacted_revision: compacted });
        }
        if at_rev.main != 0 && at_rev > current_revision {
            return Err(Error::FutureRevision { current_revision: current_revision.main });
        }
        if at_rev == Revision::ZERO {
            return self.get(key);
        }

        let index = self.index.read();
        let Some(entry) = index.get(key) else { return Ok(None) };
        let Some(rev) = entry.revision_at(at_rev) else { return Ok(None) };
        drop(index);

        let history = self.history.read();
        match history.get(&rev) {
            Some(HistoryEntry { kv, .. }) => Ok(kv.clone()),
            // Compacted out of the history log but still attested live by
            // the index: fall back to the current value (compaction keeps
            // the newest put at or before the target).
            None => self.get(key),
        }
    }

    /// Half-open range `[start, end)` over live keys, sorted and truncated
    /// to `limit` (0 = unbounded).
    pub fn range(&self, start: &[u8], end: &[u8], limit: usize) -> CResult<Vec<KeyValue>> {
        Ok(self.range_with_total(start, end, limit)?.0)
    }

    /// Same as [`range`](Self::range) but also reports the total number of
    /// matches before `limit` truncated them, for the façade's `more` flag.
    pub fn range_with_total(&self, start: &[u8], end: &[u8], limit: usize) -> CResult<(Vec<KeyValue>, usize)> {
        let raw = self.shards.range(start, end, 0)?;
        let mut out: Vec<KeyValue> =
            raw.into_iter().map(|(_, v)| bincode::deserialize::<KeyValue>(&v)).collect::<Result<_, _>>()?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        let total = out.len();
        if limit > 0 && out.len() > limit {
            out.truncate(limit);
        }
        Ok((out, total))
    }

    /// Drops history below `target` from both the key index and the
    /// revision log. A target at or below the current watermark is
    /// rejected with `Compacted`, not silently accepted -- callers that
    /// want to treat an already-compacted target as a no-op (the
    /// background auto-compactor) must catch that error themselves.
    pub fn compact(&self, target: Revision, current_revision: Revision) -> CResult<()> {
        if target > current_revision {
            return Err(Error::FutureRevision { current_revision: current_revision.main });
        }
        let mut watermark = self.compacted_revision.write();
        if target.main <= *watermark {
            return Err(Error::Compacted { compacted_revision: *watermark });
        }

        let mut index = self.index.write();
        index.retain(|_, entry| {
            entry.compact(target);
            !entry.is_empty()
        });
        drop(index);

        self.history.write().retain(|rev, _| *rev >= target);
        *watermark = target.main;
        Ok(())
    }

    pub fn compacted_revision(&self) -> i64 {
        *self.compacted_revision.read()
    }

    /// Snapshot of every live key-value pair, for the snapshot serializer.
    pub fn snapshot_all(&self) -> CResult<Vec<KeyValue>> {
        self.shards
            .get_all()?
            .into_iter()
            .map(|(_, v)| bincode::deserialize::<KeyValue>(&v).map_err(Error::from))
            .collect()
    }

    /// Restores from a snapshot: replaces the live value store and rebuilds
    /// the key index's current generation for each key. History before the
    /// snapshot's revision is not recoverable (by design: a snapshot is a
    /// compaction boundary).
    pub fn restore_all(&self, items: Vec<KeyValue>) -> CResult<()> {
        let mut index = self.index.write();
        index.clear();
        for kv in &items {
            let entry = index.entry(kv.key.clone()).or_default();
            entry.put(kv.mod_revision);
        }
        drop(index);

        self.history.write().clear();
        self.shards
            .set_all(items.into_iter().map(|kv| Ok::<_, Error>((kv.key.clone(), bincode::serialize(&kv)?))).collect::<CResult<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    fn store() -> MvccStore<Memory> {
        MvccStore::new(ShardedMap::new_memory(8))
    }

    fn r(main: i64) -> Revision {
        Revision::new(main, 0)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let s = store();
        let (kv, prev) = s.put(b"a", b"1".to_vec(), 0, r(1)).unwrap();
        assert!(prev.is_none());
        assert_eq!(kv.version, 1);
        assert_eq!(s.get(b"a").unwrap().unwrap().value, b"1");
    }

    #[test]
    fn delete_tombstones_and_clears_current_read() {
        let s = store();
        s.put(b"a", b"1".to_vec(), 0, r(1)).unwrap();
        let prev = s.delete(b"a", r(2)).unwrap();
        assert_eq!(prev.unwrap().value, b"1");
        assert!(s.get(b"a").unwrap().is_none());
    }

    #[test]
    fn get_at_sees_historical_value() {
        let s = store();
        s.put(b"a", b"1".to_vec(), 0, r(1)).unwrap();
        s.put(b"a", b"2".to_vec(), 0, r(2)).unwrap();
        let at1 = s.get_at(b"a", r(1), r(2)).unwrap().unwrap();
        assert_eq!(at1.value, b"1");
        let at2 = s.get_at(b"a", r(2), r(2)).unwrap().unwrap();
        assert_eq!(at2.value, b"2");
    }

    #[test]
    fn get_at_future_revision_errors() {
        let s = store();
        s.put(b"a", b"1".to_vec(), 0, r(1)).unwrap();
        let err = s.get_at(b"a", r(5), r(1)).unwrap_err();
        assert!(matches!(err, Error::FutureRevision { .. }));
    }

    #[test]
    fn recompacting_at_or_below_the_watermark_errors() {
        let s = store();
        s.put(b"a", b"1".to_vec(), 0, r(1)).unwrap();
        s.put(b"a", b"2".to_vec(), 0, r(2)).unwrap();
        s.compact(r(2), r(2)).unwrap();
        let err = s.compact(r(1), r(2)).unwrap_err();
        assert!(matches!(err, Error::Compacted { compacted_revision: 2 }));
        assert_eq!(s.compacted_revision(), 2);
        assert_eq!(s.get(b"a").unwrap().unwrap().value, b"2");
    }

    #[test]
    fn compacted_historical_read_errors() {
        let s = store();
        s.put(b"a", b"1".to_vec(), 0, r(1)).unwrap();
        s.put(b"a", b"2".to_vec(), 0, r(2)).unwrap();
        s.compact(r(2), r(2)).unwrap();
        let err = s.get_at(b"a", r(1), r(2)).unwrap_err();
        assert!(matches!(err, Error::Compacted { .. }));
    }
}
