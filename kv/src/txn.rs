//! The transaction evaluator: compare-and-act over multiple keys,
//! evaluated under a single global lock so the compare and the chosen
//! branch's writes share one stable read view.

use crate::apply::tombstone_event_kv;
use crate::error::{CResult, Error};
use crate::lease::LeaseTable;
use crate::mvcc::{KeyValue, MvccStore, Revision};
use crate::storage::engine::Engine;
use crate::watch::{EventType, WatchRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareTarget {
    Version,
    CreateRevision,
    ModRevision,
    Value,
    Lease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
}

#[derive(Debug, Clone)]
pub struct Compare {
    pub key: Vec<u8>,
    pub target: CompareTarget,
    pub op: CompareOp,
    /// Comparison value encoded as bytes; numeric targets compare as i64
    /// parsed from the same representation `value.rs` would use to encode
    /// them (big-endian 8 bytes), `Value` compares the raw bytes directly.
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum TxnOp {
    Range { start: Vec<u8>, end: Vec<u8>, limit: usize },
    Put { key: Vec<u8>, value: Vec<u8>, lease: i64 },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Clone)]
pub enum TxnOpResponse {
    Range(Vec<KeyValue>),
    Put(KeyValue),
    Delete(Option<KeyValue>),
}

pub struct TxnResult {
    pub succeeded: bool,
    pub responses: Vec<TxnOpResponse>,
    pub revision: Revision,
}

fn i64_from_bytes(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    i64::from_be_bytes(buf)
}

fn compare_one(kv: Option<&KeyValue>, cmp: &Compare) -> bool {
    let ord = match cmp.target {
        CompareTarget::Version => {
            let actual = kv.map(|k| k.version).unwrap_or(0);
            actual.cmp(&i64_from_bytes(&cmp.value))
        }
        CompareTarget::CreateRevision => {
            let actual = kv.map(|k| k.create_revision.main).unwrap_or(0);
            actual.cmp(&i64_from_bytes(&cmp.value))
        }
        CompareTarget::ModRevision => {
            let actual = kv.map(|k| k.mod_revision.main).unwrap_or(0);
            actual.cmp(&i64_from_bytes(&cmp.value))
        }
        CompareTarget::Lease => {
            let actual = kv.map(|k| k.lease).unwrap_or(0);
            actual.cmp(&i64_from_bytes(&cmp.value))
        }
        CompareTarget::Value => {
            let empty = Vec::new();
            let actual = kv.map(|k| &k.value).unwrap_or(&empty);
            return match cmp.op {
                CompareOp::Eq => actual == &cmp.value,
                CompareOp::Ne => actual != &cmp.value,
                CompareOp::Lt => actual.as_slice() < cmp.value.as_slice(),
                CompareOp::Gt => actual.as_slice() > cmp.value.as_slice(),
            };
        }
    };
    match cmp.op {
        CompareOp::Eq => ord.is_eq(),
        CompareOp::Ne => ord.is_ne(),
        CompareOp::Lt => ord.is_lt(),
        CompareOp::Gt => ord.is_gt(),
    }
}

/// Evaluates one transaction's compares, then executes its `then`/`else`
/// branch, under the caller-held global transaction lock. `next_sub`
/// assigns a `(main, i)` sub-revision to each write op in the chosen
/// branch; `main` is fixed for the whole transaction.
pub fn evaluate<E: Engine>(
    store: &MvccStore<E>,
    leases: &LeaseTable,
    watches: &WatchRegistry,
    compares: &[Compare],
    then_ops: &[TxnOp],
    else_ops: &[TxnOp],
    current_revision: Revision,
    mut next_sub: impl FnMut() -> Revision,
) -> CResult<TxnResult> {
    let succeeded = compares.iter().all(|cmp| {
        let kv = store.get(&cmp.key).unwrap_or(None);
        compare_one(kv.as_ref(), cmp)
    });

    let branch = if succeeded { then_ops } else { else_ops };

    // Validate every op's preconditions before executing any of them: a
    // `Put` against a dead lease must abort the whole branch without any
    // earlier op in the same branch having left a durable write behind, so
    // the branch's writes stay atomic at a single revision (spec.md:267).
    for op in branch {
        if let TxnOp::Put { lease, .. } = op {
            if *lease != 0 && !leases.is_live(*lease) {
                return Err(Error::InvalidLease(*lease));
            }
        }
    }

    let mut responses = Vec::with_capacity(branch.len());

    for op in branch {
        let response = match op {
            TxnOp::Range { start, end, limit } => TxnOpResponse::Range(store.range(start, end, *limit)?),
            TxnOp::Put { key, value, lease } => {
                let rev = next_sub();
                let (kv, prev) = store.put(key, value.clone(), *lease, rev)?;
                if *lease != 0 {
                    leases.attach(*lease, key.clone())?;
                }
                watches.notify(EventType::Put, kv.clone(), prev, rev);
                TxnOpResponse::Put(kv)
            }
            TxnOp::Delete { key } => {
                if store.get(key)?.is_none() {
                    TxnOpResponse::Delete(None)
                } else {
                    let rev = next_sub();
                    let prev = store.delete(key, rev)?;
                    if let Some(prev_kv) = &prev {
                        if prev_kv.lease != 0 {
                            leases.detach(prev_kv.lease, key);
                        }
                        watches.notify(EventType::Delete, tombstone_event_kv(prev_kv, rev), Some(prev_kv.clone()), rev);
                    }
                    TxnOpResponse::Delete(prev)
                }
            }
        };
        responses.push(response);
    }

    Ok(TxnResult { succeeded, responses, revision: current_revision })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardedMap;
    use crate::storage::memory::Memory;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn fixture() -> (MvccStore<Memory>, LeaseTable, WatchRegistry) {
        (MvccStore::new(ShardedMap::new_memory(8)), LeaseTable::new(None), WatchRegistry::new(None))
    }

    fn sub_counter(main: i64) -> impl FnMut() -> Revision {
        let counter = AtomicI64::new(0);
        move || Revision::new(main, counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[test]
    fn missing_key_compares_against_zero_value() {
        let (store, leases, watches) = fixture();
        let compares = vec![Compare { key: b"a".to_vec(), target: CompareTarget::Version, op: CompareOp::Eq, value: 0i64.to_be_bytes().to_vec() }];
        let then_ops = vec![TxnOp::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 }];
        let result = evaluate(&store, &leases, &watches, &compares, &then_ops, &[], Revision::new(1, 0), sub_counter(1)).unwrap();
        assert!(result.succeeded);
        assert_eq!(store.get(b"a").unwrap().unwrap().value, b"1");
    }

    #[test]
    fn failed_compare_runs_else_branch() {
        let (store, leases, watches) = fixture();
        store.put(b"a", b"1".to_vec(), 0, Revision::new(1, 0)).unwrap();
        let compares = vec![Compare { key: b"a".to_vec(), target: CompareTarget::Value, op: CompareOp::Eq, value: b"wrong".to_vec() }];
        let then_ops = vec![TxnOp::Put { key: b"a".to_vec(), value: b"then".to_vec(), lease: 0 }];
        let else_ops = vec![TxnOp::Put { key: b"a".to_vec(), value: b"else".to_vec(), lease: 0 }];
        let result = evaluate(&store, &leases, &watches, &compares, &then_ops, &else_ops, Revision::new(2, 0), sub_counter(2)).unwrap();
        assert!(!result.succeeded);
        assert_eq!(store.get(b"a").unwrap().unwrap().value, b"else");
    }

    #[test]
    fn put_with_unknown_lease_aborts_transaction() {
        let (store, leases, watches) = fixture();
        let then_ops = vec![TxnOp::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 42 }];
        let err = evaluate(&store, &leases, &watches, &[], &then_ops, &[], Revision::new(1, 0), sub_counter(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidLease(42)));
        assert!(store.get(b"a").unwrap().is_none());
    }

    #[test]
    fn earlier_op_is_not_left_visible_when_a_later_op_has_a_dead_lease() {
        let (store, leases, watches) = fixture();
        let then_ops = vec![
            TxnOp::Put { key: b"a".to_vec(), value: b"1".to_vec(), lease: 0 },
            TxnOp::Put { key: b"b".to_vec(), value: b"2".to_vec(), lease: 42 },
        ];
        let err = evaluate(&store, &leases, &watches, &[], &then_ops, &[], Revision::new(1, 0), sub_counter(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidLease(42)));
        assert!(store.get(b"a").unwrap().is_none());
        assert!(store.get(b"b").unwrap().is_none());
    }
}
