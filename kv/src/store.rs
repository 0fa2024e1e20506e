//! Wires every component into one running node: the apply pipeline, the
//! proposal batcher, the Raft adapter (single-node, no peer transport), the
//! lease-read manager, and the background lease-expiry/renewal/compaction
//! tasks. This is the concrete type the façade traits in [`crate::facade`]
//! are implemented against.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::apply::{self, ApplyResponse, Operation, Pipeline, Proposal};
use crate::batcher::Batcher;
use crate::compactor::{self, RevisionClock};
use crate::config::ConfigLoad;
use crate::error::{CResult, Error};
use crate::facade::{DeleteRangeResponse, KvFacade, LeaseFacade, MaintenanceFacade, PutResponse, RangeResponse, WatchFacade};
use crate::lease::{self, Lease, LeaseTable};
use crate::leaseread::{self, LeaseManager, ReadIndexManager};
use crate::mvcc::{MvccStore, Revision};
use crate::raftadapter::{default_logger, NoopTransport, RaftAdapter, RaftStatus};
use crate::revision::RevisionGenerator;
use crate::shard::ShardedMap;
use crate::snapshot::Snapshot;
use crate::storage::engine::Engine;
use crate::storage::memory::Memory;
use crate::txn::{Compare, TxnOp, TxnResult};
use crate::watch::{WatchEvent, WatchOptions, WatchRegistry};

/// Sweep interval for the background lease-expiry scan. Independent of any
/// individual lease's TTL: a 1 s granularity bounds how stale an expired
/// lease's cascading key deletion can be without adding per-lease timers.
const LEASE_EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const BATCHER_INPUT_CAPACITY: usize = 4096;
const BATCHER_OUTPUT_CAPACITY: usize = 1024;

/// A running node. Holds every long-lived component and the handful of
/// background tasks spawned alongside it; dropping the last `Arc` does not
/// stop them -- call [`Store::shutdown`] first.
pub struct Store<E: Engine> {
    pipeline: Arc<Pipeline<E>>,
    batcher: Arc<Batcher>,
    raft: Arc<RaftAdapter<E, NoopTransport>>,
    lease_manager: Arc<LeaseManager>,
    read_index: Arc<ReadIndexManager<E>>,
    leases: Arc<LeaseTable>,
    watches: Arc<WatchRegistry>,
    revision_clock: Arc<RevisionClock>,
    next_seq: AtomicU64,
    request_timeout: Duration,
    max_request_size: Option<usize>,
    shutdown: watch::Sender<bool>,
    node_id: u64,
}

impl<E: Engine + 'static> Store<E> {
    /// Builds and starts a node over an already-constructed shard map,
    /// spawning its Raft ready loop and background tasks. The returned node
    /// has already called `campaign()`, so a single-node deployment becomes
    /// its own leader immediately.
    pub fn new(config: ConfigLoad, shards: ShardedMap<E>) -> CResult<Arc<Self>> {
        let limits = config.limits();
        let mvcc = Arc::new(MvccStore::new(shards));
        let leases = Arc::new(LeaseTable::new(limits.max_lease_count));
        let watches = Arc::new(WatchRegistry::new(limits.max_watch_count));
        let revisions = Arc::new(RevisionGenerator::new());
        let pipeline = Arc::new(Pipeline::new(mvcc, leases.clone(), watches.clone(), revisions, false));

        let (batcher, committed_rx) = Batcher::spawn(config.batcher_config(), BATCHER_INPUT_CAPACITY, BATCHER_OUTPUT_CAPACITY);
        let batcher = Arc::new(batcher);

        let lease_manager = Arc::new(LeaseManager::new(config.lease_manager_config()));
        let read_index = Arc::new(ReadIndexManager::new(pipeline.clone(), lease_manager.clone(), config.read_timeout()));

        let logger = default_logger();
        let raft = Arc::new(RaftAdapter::new(config.raft_config(), pipeline.clone(), lease_manager.clone(), Arc::new(NoopTransport), &logger)?);

        let (shutdown, shutdown_rx) = watch::channel(true);

        let node = Arc::new(Self {
            pipeline,
            batcher,
            raft,
            lease_manager,
            read_index,
            leases,
            watches,
            revision_clock: Arc::new(RevisionClock::default()),
            next_seq: AtomicU64::new(1),
            request_timeout: Duration::from_secs(30),
            max_request_size: limits.max_request_size,
            shutdown,
            node_id: config.node_id(),
        });

        node.spawn_background_tasks(&config, committed_rx, shutdown_rx);

        // A single-node cluster never receives a vote from a peer; without
        // this it sits in `Follower` forever and every write times out.
        if let Err(err) = node.raft.campaign() {
            log::warn!("raft campaign failed: {}", err);
        }

        Ok(node)
    }

    fn spawn_background_tasks(self: &Arc<Self>, config: &ConfigLoad, committed_rx: mpsc::Receiver<Vec<u8>>, shutdown_rx: watch::Receiver<bool>) {
        let raft = self.raft.clone();
        let batcher = self.batcher.clone();
        let raft_cfg = config.raft_config();
        tokio::spawn(async move {
            raft.run(raft_cfg, &batcher, committed_rx).await;
        });

        let pipeline = self.pipeline.clone();
        let leases = self.leases.clone();
        tokio::spawn(lease::run_expiry_task(leases, LEASE_EXPIRY_CHECK_INTERVAL, shutdown_rx.clone(), move |_id, keys| {
            pipeline.apply_expired_lease_keys(keys)
        }));

        if config.lease_read_enabled() {
            tokio::spawn(leaseread::run_single_node_renewal(self.lease_manager.clone(), config.lease_manager_config(), shutdown_rx.clone()));
        }

        if config.compactor_enabled() {
            let mvcc = self.pipeline.store.clone();
            let clock = self.revision_clock.clone();
            let revisions = self.pipeline.revisions.clone();
            tokio::spawn(compactor::run_compactor(
                config.compactor_config(),
                mvcc,
                clock,
                move || Revision::new(revisions.current(), 0),
                shutdown_rx.clone(),
            ));
        }

        let clock = self.revision_clock.clone();
        let revisions = self.pipeline.revisions.clone();
        tokio::spawn(sample_revision_clock(clock, revisions, shutdown_rx));
    }

    /// Stops every background task started by this node. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(false);
        self.batcher.stop();
        self.raft.stop();
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Proposes one operation and awaits its application: registers a
    /// waiter under a fresh sequence token, hands the encoded proposal to
    /// the batcher, and waits for the apply pipeline to resolve it (or the
    /// request timeout to elapse, in which case the waiter is torn down so
    /// a late commit doesn't find a stale entry).
    async fn propose(&self, op: Operation) -> CResult<ApplyResponse> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let payload = bincode::serialize(&Proposal { seq, op })?;

        let (tx, rx) = oneshot::channel();
        self.pipeline.register_waiter(seq, tx);

        if self.batcher.propose(payload).await.is_err() {
            self.pipeline.cancel_waiter(seq);
            return Err(Error::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.pipeline.cancel_waiter(seq);
                Err(Error::Timeout)
            }
        }
    }
}

impl Store<Memory> {
    /// Convenience constructor for tests and the in-memory deployment mode:
    /// the default shard count over the in-memory engine.
    pub fn new_memory(config: ConfigLoad) -> CResult<Arc<Self>> {
        Self::new(config, ShardedMap::default())
    }
}

async fn sample_revision_clock(clock: Arc<RevisionClock>, revisions: Arc<RevisionGenerator>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                clock.record(Revision::new(revisions.current(), 0), std::time::Instant::now());
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || !*shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl<E: Engine + 'static> KvFacade for Store<E> {
    async fn range(&self, key: &[u8], range_end: &[u8], limit: usize, at_revision: i64) -> CResult<RangeResponse> {
        let read_index = self.lease_manager.last_commit_index() as i64;
        self.read_index.linearizable_read(read_index).await?;

        let current = self.pipeline.revisions.current();
        if at_revision != 0 && at_revision > current {
            return Err(Error::FutureRevision { current_revision: current });
        }

        let (kvs, total) = if at_revision == 0 {
            self.pipeline.store.range_with_total(key, range_end, limit)?
        } else {
            // Historical range degrades to filtering the live key set: a key
            // that was live at `at_revision` but has since been deleted and
            // dropped from the shard map is not recovered here. Point reads
            // via `MvccStore::get_at` have no such gap; only ranged
            // historical reads are approximate in this way.
            let (live, _) = self.pipeline.store.range_with_total(key, range_end, 0)?;
            let at = Revision::new(at_revision, i64::MAX);
            let mut historical = Vec::new();
            for kv in live {
                if let Some(old) = self.pipeline.store.get_at(&kv.key, at, Revision::new(current, 0))? {
                    historical.push(old);
                }
            }
            let total = historical.len();
            if limit > 0 && historical.len() > limit {
                historical.truncate(limit);
            }
            (historical, total)
        };

        Ok(RangeResponse { more: total > kvs.len(), count: total, revision: current, kvs })
    }

    async fn put(&self, key: &[u8], value: Vec<u8>, lease_id: i64) -> CResult<PutResponse> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if let Some(max) = self.max_request_size {
            if key.len() + value.len() > max {
                return Err(Error::ResourceExhausted(format!("request of {} bytes exceeds the {} byte limit", key.len() + value.len(), max)));
            }
        }
        match self.propose(Operation::Put { key: key.to_vec(), value, lease: lease_id }).await? {
            ApplyResponse::Put(kv, prev) => Ok(PutResponse { revision: kv.mod_revision.main, prev_kv: prev }),
            _ => Err(Error::Internal("apply pipeline returned the wrong response type for Put".to_string())),
        }
    }

    async fn delete_range(&self, key: &[u8], range_end: &[u8]) -> CResult<DeleteRangeResponse> {
        let response = if range_end.is_empty() {
            self.propose(Operation::Delete { key: key.to_vec() }).await?
        } else {
            self.propose(Operation::DeleteRange { start: key.to_vec(), end: range_end.to_vec() }).await?
        };
        match response {
            ApplyResponse::Delete(prev) => {
                let revision = self.pipeline.revisions.current();
                Ok(DeleteRangeResponse { deleted_count: prev.is_some() as i64, prev_kvs: prev.into_iter().collect(), revision })
            }
            ApplyResponse::DeleteRange(prev_kvs) => {
                let revision = self.pipeline.revisions.current();
                Ok(DeleteRangeResponse { deleted_count: prev_kvs.len() as i64, prev_kvs, revision })
            }
            _ => Err(Error::Internal("apply pipeline returned the wrong response type for Delete".to_string())),
        }
    }

    async fn txn(&self, compares: Vec<Compare>, then_ops: Vec<TxnOp>, else_ops: Vec<TxnOp>) -> CResult<TxnResult> {
        let op = Operation::Txn {
            compares: compares.iter().map(apply::compare_to_wire).collect(),
            then_ops: then_ops.iter().map(apply::txn_op_to_wire).collect(),
            else_ops: else_ops.iter().map(apply::txn_op_to_wire).collect(),
        };
        match self.propose(op).await? {
            ApplyResponse::Txn(result) => Ok(result),
            _ => Err(Error::Internal("apply pipeline returned the wrong response type for Txn".to_string())),
        }
    }

    async fn compact(&self, revision: i64) -> CResult<()> {
        let current = self.pipeline.revisions.current();
        self.pipeline.store.compact(Revision::new(revision, 0), Revision::new(current, 0))
    }

    fn current_revision(&self) -> i64 {
        self.pipeline.revisions.current()
    }
}

#[async_trait]
impl<E: Engine + 'static> LeaseFacade for Store<E> {
    async fn lease_grant(&self, id: i64, ttl_seconds: i64) -> CResult<Lease> {
        match self.propose(Operation::LeaseGrant { id, ttl_seconds }).await? {
            ApplyResponse::LeaseGrant(lease) => Ok(lease),
            _ => Err(Error::Internal("apply pipeline returned the wrong response type for LeaseGrant".to_string())),
        }
    }

    async fn lease_revoke(&self, id: i64) -> CResult<()> {
        match self.propose(Operation::LeaseRevoke { id }).await? {
            ApplyResponse::LeaseRevoke => Ok(()),
            _ => Err(Error::Internal("apply pipeline returned the wrong response type for LeaseRevoke".to_string())),
        }
    }

    async fn lease_renew(&self, id: i64) -> CResult<i64> {
        self.leases.renew(id, tokio::time::Instant::now())
    }

    async fn lease_time_to_live(&self, id: i64) -> CResult<i64> {
        self.leases.time_to_live(id, tokio::time::Instant::now())
    }

    async fn leases(&self) -> CResult<Vec<Lease>> {
        Ok(self.leases.snapshot())
    }
}

#[async_trait]
impl<E: Engine + 'static> WatchFacade for Store<E> {
    async fn watch(&self, key: Vec<u8>, range_end: Vec<u8>, start_revision: i64, options: WatchOptions) -> CResult<(i64, mpsc::Receiver<WatchEvent>)> {
        if start_revision > 0 {
            // Historical replay would need MVCC retention past the compact
            // watermark for the requested revision; this degrades to
            // snapshot-at-subscribe (see DESIGN.md) -- the subscriber only
            // sees events from now forward, same as start_revision == 0.
            log::debug!("watch requested start_revision {} beyond subscribe-time replay; degrading to live-only", start_revision);
        }
        let (id, rx, _cancelled) = self.watches.subscribe(key, range_end, options)?;
        Ok((id, rx))
    }

    fn cancel_watch(&self, watch_id: i64) {
        self.watches.cancel(watch_id);
    }
}

#[async_trait]
impl<E: Engine + 'static> MaintenanceFacade for Store<E> {
    async fn get_snapshot(&self) -> CResult<Vec<u8>> {
        let revision = Revision::new(self.pipeline.revisions.current(), 0);
        let kv_table = self.pipeline.store.snapshot_all()?;
        let leases = self.leases.snapshot();
        Snapshot::new(revision, kv_table, leases).encode()
    }

    fn raft_status(&self) -> RaftStatus {
        self.raft.status()
    }

    async fn transfer_leadership(&self, target_node_id: u64) -> CResult<()> {
        if target_node_id == self.node_id {
            return Ok(());
        }
        Err(Error::Internal("single-node deployment has no peer transport to transfer leadership to".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<Store<Memory>> {
        Store::new_memory(ConfigLoad::default()).unwrap()
    }

    #[tokio::test]
    async fn put_then_range_roundtrips() {
        let store = store();
        let put = store.put(b"a", b"1".to_vec(), 0).await.unwrap();
        assert_eq!(put.revision, store.current_revision());

        let range = store.range(b"a", b"", 0, 0).await.unwrap();
        assert_eq!(range.kvs.len(), 1);
        assert_eq!(range.kvs[0].value, b"1");
        store.shutdown();
    }

    #[tokio::test]
    async fn delete_range_reports_every_deleted_key() {
        let store = store();
        store.put(b"a", b"1".to_vec(), 0).await.unwrap();
        store.put(b"b", b"2".to_vec(), 0).await.unwrap();

        let deleted = store.delete_range(b"a", b"\x00").await.unwrap();
        assert_eq!(deleted.deleted_count, 2);
        let remaining = store.range(b"a", b"\x00", 0, 0).await.unwrap();
        assert!(remaining.kvs.is_empty());
        store.shutdown();
    }

    #[tokio::test]
    async fn txn_put_is_visible_after_commit() {
        let store = store();
        let result = store
            .txn(vec![], vec![TxnOp::Put { key: b"a".to_vec(), value: b"ok".to_vec(), lease: 0 }], vec![])
            .await
            .unwrap();
        assert!(result.succeeded);
        assert_eq!(store.range(b"a", b"", 0, 0).await.unwrap().kvs[0].value, b"ok");
        store.shutdown();
    }

    #[tokio::test]
    async fn lease_revoke_deletes_attached_keys() {
        let store = store();
        store.lease_grant(1, 60).await.unwrap();
        store.put(b"a", b"1".to_vec(), 1).await.unwrap();
        store.lease_revoke(1).await.unwrap();
        assert!(store.range(b"a", b"", 0, 0).await.unwrap().kvs.is_empty());
        store.shutdown();
    }

    #[tokio::test]
    async fn watch_receives_put_events() {
        let store = store();
        let (_id, mut rx) = store.watch(b"a".to_vec(), Vec::new(), 0, WatchOptions::default()).await.unwrap();
        store.put(b"a", b"1".to_vec(), 0).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kv.key, b"a");
        store.shutdown();
    }

    #[tokio::test]
    async fn empty_key_put_is_rejected_before_proposing() {
        let store = store();
        assert!(matches!(store.put(b"", b"1".to_vec(), 0).await, Err(Error::EmptyKey)));
        store.shutdown();
    }

    #[tokio::test]
    async fn put_over_the_configured_request_size_is_rejected() {
        let config = ConfigLoad { limits: Some(crate::config::Limits { max_request_size: Some(4), ..Default::default() }), ..ConfigLoad::default() };
        let store = Store::new_memory(config).unwrap();
        assert!(matches!(store.put(b"a", b"too big".to_vec(), 0).await, Err(Error::ResourceExhausted(_))));
        store.shutdown();
    }

    #[tokio::test]
    async fn watch_over_the_configured_count_is_rejected() {
        let config = ConfigLoad { limits: Some(crate::config::Limits { max_watch_count: Some(1), ..Default::default() }), ..ConfigLoad::default() };
        let store = Store::new_memory(config).unwrap();
        let _first = store.watch(b"a".to_vec(), Vec::new(), 0, WatchOptions::default()).await.unwrap();
        assert!(matches!(
            store.watch(b"b".to_vec(), Vec::new(), 0, WatchOptions::default()).await,
            Err(Error::ResourceExhausted(_))
        ));
        store.shutdown();
    }
}
