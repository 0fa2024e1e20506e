//! Bridges the `raft` crate (the consensus library TiKV's `raftstore` is
//! built on) to the batcher and apply pipeline: proposals flow in, ready
//! state is persisted and dispatched, committed entries flow to the apply
//! pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use raft::prelude::*;
use raft::storage::MemStorage;
use raft::{RawNode, StateRole};
use slog::{Drain, Logger, o};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::apply::Pipeline;
use crate::batcher::Batcher;
use crate::leaseread::LeaseManager;
use crate::storage::engine::Engine;

/// Anything the adapter needs to ship outbound Raft messages to peers. Wire
/// transport is out of scope; this is the seam a transport implementation
/// plugs into.
pub trait Transport: Send + Sync {
    fn send(&self, msg: Message);
}

/// Drops every outbound message. The correct transport for a single-node
/// deployment, which by definition has no peers to ship anything to.
#[derive(Debug, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn send(&self, _msg: Message) {}
}

/// `raft` logs through `slog`, but the rest of this crate logs through the
/// `log` facade. Bridge the two so raft-rs's internal tracing shows up
/// alongside everything else instead of going nowhere.
pub fn default_logger() -> Logger {
    let drain = slog_stdlog::StdLog.fuse();
    Logger::root(drain, o!())
}

/// Snapshot of the local node's consensus state, for `MaintenanceFacade`.
#[derive(Debug, Clone, Copy)]
pub struct RaftStatus {
    pub id: u64,
    pub term: u64,
    pub state: StateRole,
    pub applied_index: u64,
    pub leader_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    pub id: u64,
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub tick_interval: Duration,
    pub applied_snapshot_threshold: u64,
    pub pre_vote: bool,
    pub check_quorum: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: 1,
            election_tick: 10,
            heartbeat_tick: 3,
            tick_interval: Duration::from_millis(100),
            applied_snapshot_threshold: 10_000,
            pre_vote: true,
            check_quorum: true,
        }
    }
}

/// Drives one `RawNode`'s ready loop, feeding committed entries to the apply
/// pipeline and user proposals from the batcher's output channel into the
/// library.
pub struct RaftAdapter<E: Engine, T: Transport> {
    node: Mutex<RawNode<MemStorage>>,
    pipeline: Arc<Pipeline<E>>,
    lease_manager: Arc<LeaseManager>,
    transport: Arc<T>,
    applied_snapshot_index: Mutex<u64>,
    running: Arc<AtomicBool>,
}

impl<E: Engine, T: Transport + 'static> RaftAdapter<E, T> {
    pub fn new(cfg: RaftConfig, pipeline: Arc<Pipeline<E>>, lease_manager: Arc<LeaseManager>, transport: Arc<T>, logger: &Logger) -> raft::Result<Self> {
        let raft_cfg = Config {
            id: cfg.id,
            election_tick: cfg.election_tick,
            heartbeat_tick: cfg.heartbeat_tick,
            pre_vote: cfg.pre_vote,
            check_quorum: cfg.check_quorum,
            ..Default::default()
        };
        let storage = MemStorage::new_with_conf_state((vec![cfg.id], vec![]));
        let node = RawNode::new(&raft_cfg, storage, logger)?;
        Ok(Self {
            node: Mutex::new(node),
            pipeline,
            lease_manager,
            transport,
            applied_snapshot_index: Mutex::new(0),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Feeds a library-bound config change directly to the node, bypassing
    /// the batcher (config changes aren't coalesced with data proposals).
    pub fn propose_conf_change(&self, conf_change: ConfChangeV2) -> raft::Result<()> {
        self.node.lock().propose_conf_change(vec![], conf_change)
    }

    pub fn step(&self, msg: Message) -> raft::Result<()> {
        self.node.lock().step(msg)
    }

    /// Forces an election. A single-node cluster never receives votes from
    /// peers, so without this it would sit in `Follower` forever; call it
    /// once at startup to bootstrap self into `Leader`.
    pub fn campaign(&self) -> raft::Result<()> {
        self.node.lock().campaign()
    }

    pub fn is_leader(&self) -> bool {
        self.node.lock().raft.state == StateRole::Leader
    }

    pub fn status(&self) -> RaftStatus {
        let node = self.node.lock();
        RaftStatus {
            id: node.raft.id,
            term: node.raft.term,
            state: node.raft.state,
            applied_index: self.pipeline.applied_index() as u64,
            leader_id: node.raft.leader_id,
        }
    }

    /// Runs the tick + ready loop, draining the batcher's framed proposals
    /// into the library and dispatching every `Ready` it produces.
    pub async fn run(&self, cfg: RaftConfig, batcher: &Batcher, mut committed_batches: mpsc::Receiver<Vec<u8>>) {
        let mut ticker = tokio::time::interval(cfg.tick_interval);
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.node.lock().tick();
                }
                frame = committed_batches.recv() => {
                    match frame {
                        Some(payload) => {
                            if let Err(err) = self.node.lock().propose(vec![], payload) {
                                log::warn!("raft propose failed: {}", err);
                            }
                        }
                        None => break,
                    }
                }
            }

            self.drain_ready(cfg.applied_snapshot_threshold);
        }
        let _ = batcher;
    }

    fn drain_ready(&self, applied_snapshot_threshold: u64) {
        let mut node = self.node.lock();
        if !node.has_ready() {
            return;
        }
        let mut ready = node.ready();

        if !ready.messages().is_empty() {
            for msg in ready.take_messages() {
                self.transport.send(msg);
            }
        }

        if !ready.snapshot().is_empty() {
            if let Err(err) = node.mut_store().wl().apply_snapshot(ready.snapshot().clone()) {
                log::error!("failed to apply raft snapshot: {}", err);
            }
        }

        for entry in ready.committed_entries() {
            if entry.data.is_empty() {
                continue;
            }
            if let Err(err) = self.pipeline.apply_committed_entry(entry.index as i64, &entry.data) {
                log::error!("apply failed for raft index {}: {}", entry.index, err);
            }
        }

        if !ready.entries().is_empty() {
            if let Err(err) = node.mut_store().wl().append(ready.entries()) {
                log::error!("failed to persist raft entries: {}", err);
            }
        }

        if let Some(hs) = ready.hs() {
            node.mut_store().wl().set_hardstate(hs.clone());
        }

        if !ready.persisted_messages().is_empty() {
            for msg in ready.take_persisted_messages() {
                self.transport.send(msg);
            }
        }

        let mut light_ready = node.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.lease_manager.on_commit_index(commit);
        }
        for msg in light_ready.take_messages() {
            self.transport.send(msg);
        }
        for entry in light_ready.take_committed_entries() {
            if entry.data.is_empty() {
                continue;
            }
            if let Err(err) = self.pipeline.apply_committed_entry(entry.index as i64, &entry.data) {
                log::error!("apply failed for raft index {}: {}", entry.index, err);
            }
        }
        node.advance_apply();

        match node.raft.state {
            StateRole::Leader => self.lease_manager.on_became_leader(Instant::now()),
            _ => self.lease_manager.on_became_follower(),
        }

        let applied = self.pipeline.applied_index() as u64;
        let mut snapshot_index = self.applied_snapshot_index.lock();
        if applied.saturating_sub(*snapshot_index) > applied_snapshot_threshold {
            log::info!("applied - snapshot_index exceeds threshold, snapshot trigger due at index {}", applied);
            *snapshot_index = applied;
        }
    }
}
