//! Consumes committed entries from the Raft adapter, decodes them into user
//! operations, and applies them to the sharded map / lease table /
//! transaction evaluator while preserving submission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::codec::batch_codec::BatchCodec;
use crate::error::{CResult, Error};
use crate::lease::LeaseTable;
use crate::mvcc::{KeyValue, MvccStore, Revision};
use crate::revision::RevisionGenerator;
use crate::storage::engine::Engine;
use crate::txn::{self, Compare, TxnOp, TxnResult};
use crate::watch::{EventType, WatchRegistry};

/// One user-facing write, carrying the sequence token the proposer waits on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub seq: u64,
    pub op: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64 },
    Delete { key: Vec<u8> },
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
    Txn { compares: Vec<SerCompare>, then_ops: Vec<SerOp>, else_ops: Vec<SerOp> },
    LeaseGrant { id: i64, ttl_seconds: i64 },
    LeaseRevoke { id: i64 },
}

// `txn::Compare`/`txn::TxnOp` aren't `Serialize` (they carry enum targets
// only meaningful at evaluation time); these are the wire twins decoded
// straight back into the evaluator's types when a TXN run is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerCompare {
    pub key: Vec<u8>,
    pub target: u8,
    pub op: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SerOp {
    Range { start: Vec<u8>, end: Vec<u8>, limit: usize },
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64 },
    Delete { key: Vec<u8> },
}

fn target_from_u8(v: u8) -> txn::CompareTarget {
    use txn::CompareTarget::*;
    match v {
        0 => Version,
        1 => CreateRevision,
        2 => ModRevision,
        3 => Value,
        _ => Lease,
    }
}

fn op_from_u8(v: u8) -> txn::CompareOp {
    use txn::CompareOp::*;
    match v {
        0 => Eq,
        1 => Ne,
        2 => Lt,
        _ => Gt,
    }
}

fn target_to_u8(t: txn::CompareTarget) -> u8 {
    use txn::CompareTarget::*;
    match t {
        Version => 0,
        CreateRevision => 1,
        ModRevision => 2,
        Value => 3,
        Lease => 4,
    }
}

fn op_to_u8(o: txn::CompareOp) -> u8 {
    use txn::CompareOp::*;
    match o {
        Eq => 0,
        Ne => 1,
        Lt => 2,
        Gt => 3,
    }
}

fn to_compare(c: &SerCompare) -> Compare {
    Compare { key: c.key.clone(), target: target_from_u8(c.target), op: op_from_u8(c.op), value: c.value.clone() }
}

fn to_txn_op(o: &SerOp) -> TxnOp {
    match o {
        SerOp::Range { start, end, limit } => TxnOp::Range { start: start.clone(), end: end.clone(), limit: *limit },
        SerOp::Put { key, value, lease } => TxnOp::Put { key: key.clone(), value: value.clone(), lease: *lease },
        SerOp::Delete { key } => TxnOp::Delete { key: key.clone() },
    }
}

/// Built by a façade caller proposing a `Txn` operation; the wire twin of a
/// [`Compare`] the apply pipeline decodes back via [`to_compare`].
pub fn compare_to_wire(c: &Compare) -> SerCompare {
    SerCompare { key: c.key.clone(), target: target_to_u8(c.target), op: op_to_u8(c.op), value: c.value.clone() }
}

/// The wire twin of a [`TxnOp`], for the same reason as [`compare_to_wire`].
pub fn txn_op_to_wire(o: &TxnOp) -> SerOp {
    match o {
        TxnOp::Range { start, end, limit } => SerOp::Range { start: start.clone(), end: end.clone(), limit: *limit },
        TxnOp::Put { key, value, lease } => SerOp::Put { key: key.clone(), value: value.clone(), lease: *lease },
        TxnOp::Delete { key } => SerOp::Delete { key: key.clone() },
    }
}

/// Builds the `kv` a delete's watch event carries: a tombstone at `rev`
/// (`value` cleared, `version` zeroed), not the deleted record itself --
/// callers pass `prev` separately as `prev_kv`.
pub(crate) fn tombstone_event_kv(prev: &KeyValue, rev: Revision) -> KeyValue {
    KeyValue { key: prev.key.clone(), value: Vec::new(), create_revision: Revision::ZERO, mod_revision: rev, version: 0, lease: 0 }
}

#[derive(Debug, Clone)]
pub enum ApplyResponse {
    Put(KeyValue, Option<KeyValue>),
    Delete(Option<KeyValue>),
    DeleteRange(Vec<KeyValue>),
    Txn(TxnResult),
    LeaseGrant(crate::lease::Lease),
    LeaseRevoke,
}

type Waiter = oneshot::Sender<CResult<ApplyResponse>>;

/// The apply pipeline. Owns the revision generator (only this component
/// advances it) and coordinates the sharded map, lease table, and watch
/// registry for every committed entry.
pub struct Pipeline<E: Engine> {
    pub store: Arc<MvccStore<E>>,
    pub leases: Arc<LeaseTable>,
    pub watches: Arc<WatchRegistry>,
    pub revisions: Arc<RevisionGenerator>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    applied_index: AtomicI64,
    /// Witness nodes participate in consensus but skip data operations.
    witness: bool,
    notify_applied: RwLock<Vec<Arc<tokio::sync::Notify>>>,
}

impl<E: Engine> Pipeline<E> {
    pub fn new(
        store: Arc<MvccStore<E>>,
        leases: Arc<LeaseTable>,
        watches: Arc<WatchRegistry>,
        revisions: Arc<RevisionGenerator>,
        witness: bool,
    ) -> Self {
        Self {
            store,
            leases,
            watches,
            revisions,
            waiters: Mutex::new(HashMap::new()),
            applied_index: AtomicI64::new(0),
            witness,
            notify_applied: RwLock::new(Vec::new()),
        }
    }

    pub fn applied_index(&self) -> i64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// A waiter (typically the read-index manager) registers to be woken
    /// whenever `applied_index` advances.
    pub fn subscribe_applied(&self, notify: Arc<tokio::sync::Notify>) {
        self.notify_applied.write().push(notify);
    }

    pub fn register_waiter(&self, seq: u64, tx: Waiter) {
        self.waiters.lock().insert(seq, tx);
    }

    /// Drops a pending waiter without notifying it, so a timed-out caller's
    /// entry doesn't linger in the map: if the underlying Raft entry still
    /// commits later, `complete` will simply find no waiter and no-op.
    pub fn cancel_waiter(&self, seq: u64) {
        self.waiters.lock().remove(&seq);
    }

    /// Decodes a committed raw entry (the batcher's framed payload) and
    /// applies every proposal within it, in order.
    pub fn apply_committed_entry(&self, entry_index: i64, payload: &[u8]) -> CResult<()> {
        let codec = BatchCodec::new();
        let raw_proposals = codec.decode_frame(payload)?;
        let proposals: Vec<Proposal> =
            raw_proposals.iter().map(|b| bincode::deserialize(b).map_err(Error::from)).collect::<CResult<_>>()?;

        if self.witness {
            self.applied_index.store(entry_index, Ordering::SeqCst);
            self.wake_applied_waiters();
            return Ok(());
        }

        self.apply_ordering_preserving(proposals)?;
        self.applied_index.store(entry_index, Ordering::SeqCst);
        self.wake_applied_waiters();
        Ok(())
    }

    fn wake_applied_waiters(&self) {
        for notify in self.notify_applied.read().iter() {
            notify.notify_waiters();
        }
    }

    /// Groups proposals into runs of the same operation kind (matching
    /// submission order) and batch-applies each run, so locks are acquired
    /// once per run instead of once per op.
    fn apply_ordering_preserving(&self, proposals: Vec<Proposal>) -> CResult<()> {
        let mut iter = proposals.into_iter().peekable();
        while let Some(first) = iter.next() {
            let mut run = vec![first];
            while let Some(next) = iter.peek() {
                if std::mem::discriminant(&next.op) == std::mem::discriminant(&run[0].op) {
                    run.push(iter.next().unwrap());
                } else {
                    break;
                }
            }
            self.apply_run(run)?;
        }
        Ok(())
    }

    fn apply_run(&self, run: Vec<Proposal>) -> CResult<()> {
        match &run[0].op {
            Operation::Put { .. } => self.apply_put_run(run),
            Operation::Delete { .. } => self.apply_delete_run(run),
            Operation::DeleteRange { .. } => self.apply_delete_range_run(run),
            Operation::Txn { .. } => self.apply_txn_run(run),
            Operation::LeaseGrant { .. } => self.apply_lease_grant_run(run),
            Operation::LeaseRevoke { .. } => self.apply_lease_revoke_run(run),
        }
    }

    fn complete(&self, seq: u64, result: CResult<ApplyResponse>) {
        if let Some(tx) = self.waiters.lock().remove(&seq) {
            let _ = tx.send(result);
        }
    }

    fn apply_put_run(&self, run: Vec<Proposal>) -> CResult<()> {
        for proposal in run {
            let Operation::Put { key, value, lease } = proposal.op else { unreachable!() };
            let result = (|| -> CResult<ApplyResponse> {
                if lease != 0 && !self.leases.is_live(lease) {
                    return Err(Error::InvalidLease(lease));
                }
                let rev = self.revisions.next();
                let (kv, prev) = self.store.put(&key, value, lease, rev)?;
                if lease != 0 {
                    self.leases.attach(lease, key.clone())?;
                }
                self.watches.notify(EventType::Put, kv.clone(), prev.clone(), rev);
                Ok(ApplyResponse::Put(kv, prev))
            })();
            self.complete(proposal.seq, result);
        }
        Ok(())
    }

    /// A delete of a key that isn't currently present succeeds with
    /// `deleted=0` and does not consume a revision (source behaviour was
    /// ambiguous on this point; this is the chosen resolution, see
    /// DESIGN.md).
    fn apply_delete_run(&self, run: Vec<Proposal>) -> CResult<()> {
        for proposal in run {
            let Operation::Delete { key } = proposal.op else { unreachable!() };
            let result = (|| -> CResult<ApplyResponse> {
                if self.store.get(&key)?.is_none() {
                    return Ok(ApplyResponse::Delete(None));
                }
                let rev = self.revisions.next();
                let prev = self.store.delete(&key, rev)?;
                if let Some(kv) = &prev {
                    if kv.lease != 0 {
                        self.leases.detach(kv.lease, &key);
                    }
                    self.watches.notify(EventType::Delete, tombstone_event_kv(kv, rev), Some(kv.clone()), rev);
                }
                Ok(ApplyResponse::Delete(prev))
            })();
            self.complete(proposal.seq, result);
        }
        Ok(())
    }

    /// A whole `delete_range` is one transaction: like `txn`, it consumes a
    /// single main revision, with each additional deleted key taking the
    /// next sub-revision. An empty match consumes no revision at all (same
    /// no-op-for-absent-key resolution as a point delete).
    fn apply_delete_range_run(&self, run: Vec<Proposal>) -> CResult<()> {
        for proposal in run {
            let Operation::DeleteRange { start, end } = proposal.op else { unreachable!() };
            let result = (|| -> CResult<ApplyResponse> {
                let matched = self.store.range(&start, &end, 0)?;
                let mut deleted = Vec::new();
                let mut main_rev: Option<Revision> = None;
                for kv in matched {
                    let rev = match main_rev {
                        None => *main_rev.insert(self.revisions.next()),
                        Some(_) => self.revisions.next_sub(),
                    };
                    if let Some(prev) = self.store.delete(&kv.key, rev)? {
                        if prev.lease != 0 {
                            self.leases.detach(prev.lease, &kv.key);
                        }
                        self.watches.notify(EventType::Delete, tombstone_event_kv(&prev, rev), Some(prev.clone()), rev);
                        deleted.push(prev);
                    }
                }
                Ok(ApplyResponse::DeleteRange(deleted))
            })();
            self.complete(proposal.seq, result);
        }
        Ok(())
    }

    fn apply_txn_run(&self, run: Vec<Proposal>) -> CResult<()> {
        for proposal in run {
            let Operation::Txn { compares, then_ops, else_ops } = proposal.op else { unreachable!() };
            let compares: Vec<Compare> = compares.iter().map(to_compare).collect();
            let then_ops: Vec<TxnOp> = then_ops.iter().map(to_txn_op).collect();
            let else_ops: Vec<TxnOp> = else_ops.iter().map(to_txn_op).collect();

            let txn_revision = self.revisions.next();
            let result = txn::evaluate(
                &self.store,
                &self.leases,
                &self.watches,
                &compares,
                &then_ops,
                &else_ops,
                txn_revision,
                || self.revisions.next_sub(),
            )
            .map(ApplyResponse::Txn);
            self.complete(proposal.seq, result);
        }
        Ok(())
    }

    fn apply_lease_grant_run(&self, run: Vec<Proposal>) -> CResult<()> {
        for proposal in run {
            let Operation::LeaseGrant { id, ttl_seconds } = proposal.op else { unreachable!() };
            let result = self.leases.grant(id, ttl_seconds, tokio::time::Instant::now()).map(ApplyResponse::LeaseGrant);
            self.complete(proposal.seq, result);
        }
        Ok(())
    }

    fn apply_lease_revoke_run(&self, run: Vec<Proposal>) -> CResult<()> {
        for proposal in run {
            let Operation::LeaseRevoke { id } = proposal.op else { unreachable!() };
            let result = (|| -> CResult<ApplyResponse> {
                let keys = self.leases.revoke(id)?;
                for key in keys {
                    let rev = self.revisions.next();
                    if let Some(prev) = self.store.delete(&key, rev)? {
                        self.watches.notify(EventType::Delete, tombstone_event_kv(&prev, rev), Some(prev), rev);
                    }
                }
                Ok(ApplyResponse::LeaseRevoke)
            })();
            self.complete(proposal.seq, result);
        }
        Ok(())
    }

    /// Deletes the keys a lease's background expiry (`lease::run_expiry_task`)
    /// just revoked. The lease table entry is already gone by the time this
    /// runs; this only replays the same revision-bumping, watch-firing
    /// cascade `apply_lease_revoke_run` does for an explicit client revoke.
    pub fn apply_expired_lease_keys(&self, keys: std::collections::HashSet<Vec<u8>>) {
        for key in keys {
            let rev = self.revisions.next();
            match self.store.delete(&key, rev) {
                Ok(Some(prev)) => self.watches.notify(EventType::Delete, tombstone_event_kv(&prev, rev), Some(prev), rev),
                Ok(None) => {}
                Err(err) => log::warn!("failed to delete key for expired lease: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardedMap;
    use crate::storage::memory::Memory;

    fn pipeline() -> Pipeline<Memory> {
        Pipeline::new(
            Arc::new(MvccStore::new(ShardedMap::new_memory(8))),
            Arc::new(LeaseTable::new(None)),
            Arc::new(WatchRegistry::new(None)),
            Arc::new(RevisionGenerator::new()),
            false,
        )
    }

    fn encode(proposals: &[Proposal]) -> Vec<u8> {
        let codec = BatchCodec::new();
        let raw: Vec<Vec<u8>> = proposals.iter().map(|p| bincode::serialize(p).unwrap()).collect();
        codec.encode_flush(&raw).unwrap()
    }

    #[test]
    fn applying_a_put_advances_revision_and_updates_store() {
        let pipeline = pipeline();
        let entry = encode(&[Proposal { seq: 1, op: Operation::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 } }]);
        pipeline.apply_committed_entry(1, &entry).unwrap();
        assert_eq!(pipeline.store.get(b"a").unwrap().unwrap().value, b"1");
        assert_eq!(pipeline.applied_index(), 1);
    }

    #[test]
    fn mixed_run_preserves_order_of_revisions() {
        let pipeline = pipeline();
        let entry = encode(&[
            Proposal { seq: 1, op: Operation::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 } },
            Proposal { seq: 2, op: Operation::Put { key: b"b".to_vec(), value: b"2".to_vec(), lease: 0 } },
            Proposal { seq: 3, op: Operation::Delete { key: b"a".to_vec() } },
        ]);
        pipeline.apply_committed_entry(1, &entry).unwrap();
        assert!(pipeline.store.get(b"a").unwrap().is_none());
        assert_eq!(pipeline.store.get(b"b").unwrap().unwrap().mod_revision.main, 2);
    }

    #[tokio::test]
    async fn waiter_is_notified_with_apply_result() {
        let pipeline = pipeline();
        let (tx, rx) = oneshot::channel();
        pipeline.register_waiter(7, tx);
        let entry = encode(&[Proposal { seq: 7, op: Operation::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 } }]);
        pipeline.apply_committed_entry(1, &entry).unwrap();
        let response = rx.await.unwrap().unwrap();
        assert!(matches!(response, ApplyResponse::Put(_, _)));
    }

    #[test]
    fn delete_range_consumes_a_single_main_revision() {
        let pipeline = pipeline();
        let puts = encode(&[
            Proposal { seq: 1, op: Operation::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 } },
            Proposal { seq: 2, op: Operation::Put { key: b"b".to_vec(), value: b"2".to_vec(), lease: 0 } },
            Proposal { seq: 3, op: Operation::Put { key: b"c".to_vec(), value: b"3".to_vec(), lease: 0 } },
            Proposal { seq: 4, op: Operation::Put { key: b"d".to_vec(), value: b"4".to_vec(), lease: 0 } },
        ]);
        pipeline.apply_committed_entry(1, &puts).unwrap();
        assert_eq!(pipeline.revisions.current(), 4);

        let (tx, rx) = oneshot::channel();
        pipeline.register_waiter(5, tx);
        let delete_range = encode(&[Proposal { seq: 5, op: Operation::DeleteRange { start: b"b".to_vec(), end: b"d".to_vec() } }]);
        pipeline.apply_committed_entry(2, &delete_range).unwrap();

        assert_eq!(pipeline.revisions.current(), 5);
        let remaining = pipeline.store.range(b"a", b"\x00", 0).unwrap();
        assert_eq!(remaining.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn delete_range_over_empty_span_does_not_advance_revision() {
        let pipeline = pipeline();
        let put = encode(&[Proposal { seq: 1, op: Operation::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 } }]);
        pipeline.apply_committed_entry(1, &put).unwrap();
        let delete_range = encode(&[Proposal { seq: 2, op: Operation::DeleteRange { start: b"x".to_vec(), end: b"y".to_vec() } }]);
        pipeline.apply_committed_entry(2, &delete_range).unwrap();
        assert_eq!(pipeline.revisions.current(), 1);
    }

    #[test]
    fn lease_revoke_cascades_key_deletion() {
        let pipeline = pipeline();
        let grant = encode(&[Proposal { seq: 1, op: Operation::LeaseGrant { id: 5, ttl_seconds: 60 } }]);
        pipeline.apply_committed_entry(1, &grant).unwrap();
        let put = encode(&[Proposal { seq: 2, op: Operation::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 5 } }]);
        pipeline.apply_committed_entry(2, &put).unwrap();
        let revoke = encode(&[Proposal { seq: 3, op: Operation::LeaseRevoke { id: 5 } }]);
        pipeline.apply_committed_entry(3, &revoke).unwrap();
        assert!(pipeline.store.get(b"a").unwrap().is_none());
    }
}
