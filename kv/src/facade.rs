//! The operation contracts a caller (the Raft-facing server loop, a test
//! harness, `kvcli`) drives against a concrete [`crate::store::Store`].
//! Expressed as `async_trait` traits so callers can be generic over the
//! concrete store the same way `kvapi::KVApi` is in the reference workspace,
//! without depending on its internals.

use async_trait::async_trait;

use crate::error::CResult;
use crate::lease::Lease;
use crate::mvcc::KeyValue;
use crate::raftadapter::RaftStatus;
use crate::txn::{Compare, TxnOp, TxnResult};
use crate::watch::{WatchEvent, WatchOptions};

/// Response to [`KvFacade::range`].
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    /// `true` if `limit` truncated the match set.
    pub more: bool,
    /// Total number of matches before truncation.
    pub count: usize,
    pub revision: i64,
}

/// Response to [`KvFacade::put`].
#[derive(Debug, Clone)]
pub struct PutResponse {
    pub revision: i64,
    pub prev_kv: Option<KeyValue>,
}

/// Response to [`KvFacade::delete_range`].
#[derive(Debug, Clone)]
pub struct DeleteRangeResponse {
    pub deleted_count: i64,
    pub prev_kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// The core read/write surface: range, put, delete_range, txn, compact, and
/// the current revision watermark. Every write op goes through consensus
/// (propose -> await apply); `current_revision` is a local, non-blocking
/// read of the apply pipeline's revision generator.
#[async_trait]
pub trait KvFacade {
    /// Linearizable: waits on the local read lease (or fails `NotLeader`)
    /// before serving from the sharded map, per
    /// [`crate::leaseread::ReadIndexManager::linearizable_read`].
    async fn range(&self, key: &[u8], range_end: &[u8], limit: usize, at_revision: i64) -> CResult<RangeResponse>;
    async fn put(&self, key: &[u8], value: Vec<u8>, lease_id: i64) -> CResult<PutResponse>;
    async fn delete_range(&self, key: &[u8], range_end: &[u8]) -> CResult<DeleteRangeResponse>;
    async fn txn(&self, compares: Vec<Compare>, then_ops: Vec<TxnOp>, else_ops: Vec<TxnOp>) -> CResult<TxnResult>;
    /// Compacting to a target at or above the current revision fails with
    /// `FutureRevision`; a target at or below the existing watermark fails
    /// with `Compacted { compacted_revision }` rather than silently
    /// succeeding -- only the background auto-compactor treats that case
    /// as a no-op (see [`crate::compactor::run_compactor`]).
    async fn compact(&self, revision: i64) -> CResult<()>;
    fn current_revision(&self) -> i64;
}

/// TTL-bound key bindings: grant, revoke (cascades key deletion), renew,
/// inspect remaining TTL, and list every live lease.
#[async_trait]
pub trait LeaseFacade {
    async fn lease_grant(&self, id: i64, ttl_seconds: i64) -> CResult<Lease>;
    async fn lease_revoke(&self, id: i64) -> CResult<()>;
    /// Renewing resets the lease's clock without going through consensus:
    /// a lease's liveness is purely local bookkeeping on the apply side, so
    /// there is nothing for other replicas to agree on.
    async fn lease_renew(&self, id: i64) -> CResult<i64>;
    async fn lease_time_to_live(&self, id: i64) -> CResult<i64>;
    async fn leases(&self) -> CResult<Vec<Lease>>;
}

/// Key-range subscriptions. `watch` hands back the subscription id and the
/// receiving half of its event channel; the caller owns draining it.
#[async_trait]
pub trait WatchFacade {
    async fn watch(&self, key: Vec<u8>, range_end: Vec<u8>, start_revision: i64, options: WatchOptions) -> CResult<(i64, tokio::sync::mpsc::Receiver<WatchEvent>)>;
    fn cancel_watch(&self, watch_id: i64);
}

/// Operational surface: snapshotting, consensus status, and leadership
/// handoff.
#[async_trait]
pub trait MaintenanceFacade {
    async fn get_snapshot(&self) -> CResult<Vec<u8>>;
    fn raft_status(&self) -> RaftStatus;
    /// Single-node deployments have no peer to transfer to; implementations
    /// are expected to return `NotLeader`/`Internal` rather than silently
    /// accept a no-op, per §6's handle contract.
    async fn transfer_leadership(&self, target_node_id: u64) -> CResult<()>;
}
