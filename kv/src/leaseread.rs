//! The Raft leader's read lease: a time-bounded right to serve linearizable
//! reads without a round-trip through consensus, plus the read-index
//! manager that waits for the apply pipeline to catch up to a captured
//! commit index. Distinct from `lease::LeaseTable`, which tracks user TTL
//! leases attached to keys -- the two concepts just share a name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::apply::Pipeline;
use crate::error::{CResult, Error};
use crate::storage::engine::Engine;

#[derive(Debug, Clone, Copy)]
pub struct LeaseManagerConfig {
    pub election_timeout: Duration,
    pub heartbeat_tick: Duration,
    pub clock_drift: Duration,
}

impl Default for LeaseManagerConfig {
    /// Same-DC defaults: 100 ms drift against a 1 s election timeout.
    fn default() -> Self {
        Self { election_timeout: Duration::from_secs(1), heartbeat_tick: Duration::from_millis(100), clock_drift: Duration::from_millis(100) }
    }
}

impl LeaseManagerConfig {
    /// `min(election_timeout/2, heartbeat_tick*3) - clock_drift`, per the
    /// lease-duration formula. Requires `clock_drift < election_timeout`,
    /// panics otherwise since a lease that can't exceed zero duration is a
    /// misconfiguration, not a runtime condition.
    pub fn lease_duration(&self) -> Duration {
        assert!(self.clock_drift < self.election_timeout, "clock_drift must be smaller than election_timeout");
        let half_election = self.election_timeout / 2;
        let triple_heartbeat = self.heartbeat_tick * 3;
        half_election.min(triple_heartbeat).saturating_sub(self.clock_drift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Leader,
}

struct LeaseState {
    role: Role,
    expiry: Option<Instant>,
}

/// Tracks whether this node currently holds the local read lease: a
/// follower<->leader state machine with a renewable expiry. `on_commit_index`
/// renews on every commit-index advance while leader, since a Raft commit
/// index only moves forward once a quorum has acknowledged -- the same
/// signal the spec calls "quorum heartbeats" for the purpose of this lease.
/// For a single-node cluster, where no other peer ever sends an ack, a
/// dedicated timer (`run_single_node_renewal`) takes over instead.
pub struct LeaseManager {
    cfg: LeaseManagerConfig,
    state: RwLock<LeaseState>,
    last_commit_index: AtomicU64,
}

impl LeaseManager {
    pub fn new(cfg: LeaseManagerConfig) -> Self {
        Self { cfg, state: RwLock::new(LeaseState { role: Role::Follower, expiry: None }), last_commit_index: AtomicU64::new(0) }
    }

    pub fn on_became_leader(&self, now: Instant) {
        self.state.write().role = Role::Leader;
        self.renew(now);
    }

    pub fn on_became_follower(&self) {
        let mut state = self.state.write();
        state.role = Role::Follower;
        state.expiry = None;
    }

    /// Called whenever the Raft adapter observes the commit index advance.
    /// A commit-index advance implies a quorum has replicated up to that
    /// point, so it doubles as the "quorum reported recent_active" signal
    /// for multi-node clusters.
    pub fn on_commit_index(&self, commit_index: u64) {
        self.last_commit_index.store(commit_index, Ordering::SeqCst);
        if self.is_leader() {
            self.renew(Instant::now());
        }
    }

    pub fn renew(&self, now: Instant) {
        let mut state = self.state.write();
        if state.role != Role::Leader {
            return;
        }
        state.expiry = Some(now + self.cfg.lease_duration());
    }

    fn is_leader(&self) -> bool {
        self.state.read().role == Role::Leader
    }

    /// Valid when this node is (still believed to be) leader and `now` is
    /// at or before the last-renewed expiry.
    pub fn is_valid(&self, now: Instant) -> bool {
        let state = self.state.read();
        state.role == Role::Leader && state.expiry.is_some_and(|expiry| now <= expiry)
    }

    pub fn last_commit_index(&self) -> u64 {
        self.last_commit_index.load(Ordering::SeqCst)
    }
}

/// Smart-sizing sub-component (§4.11): for a single-node cluster, no peer
/// ever reports `recent_active`, so `on_commit_index` never fires. This task
/// renews on a timer instead, at `heartbeat_tick/2`, and is the fallback the
/// spec calls out for clock jumps: if the monotonic clock misbehaves badly
/// enough that renewals stop landing inside the lease window, reads simply
/// see `is_valid` go false and fall back to the full read-index round.
pub async fn run_single_node_renewal(lease_manager: Arc<LeaseManager>, cfg: LeaseManagerConfig, mut running: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval((cfg.heartbeat_tick / 2).max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                lease_manager.renew(Instant::now());
            }
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
        }
    }
}

/// Waits for the apply pipeline's `applied_index` to reach a captured
/// `read_index`, using `Pipeline::subscribe_applied` to avoid polling.
pub struct ReadIndexManager<E: Engine> {
    pipeline: Arc<Pipeline<E>>,
    lease_manager: Arc<LeaseManager>,
    read_timeout: Duration,
}

impl<E: Engine> ReadIndexManager<E> {
    pub fn new(pipeline: Arc<Pipeline<E>>, lease_manager: Arc<LeaseManager>, read_timeout: Duration) -> Self {
        Self { pipeline, lease_manager, read_timeout }
    }

    /// Serves a linearizable read: if the local lease is valid, waits for
    /// `applied_index >= read_index` (the just-observed commit index) and
    /// returns. Otherwise returns `NotLeader` so the caller falls back to a
    /// full library read-index round -- the core does not implement that
    /// round itself, per §6's Raft contract (it's the library's job).
    pub async fn linearizable_read(&self, read_index: i64) -> CResult<()> {
        if !self.lease_manager.is_valid(Instant::now()) {
            return Err(Error::NotLeader { leader_hint: None });
        }
        self.wait_applied(read_index).await
    }

    async fn wait_applied(&self, read_index: i64) -> CResult<()> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            if self.pipeline.applied_index() >= read_index {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let notify = Arc::new(Notify::new());
            self.pipeline.subscribe_applied(notify.clone());
            if tokio::time::timeout(remaining, notify.notified()).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LeaseManagerConfig {
        LeaseManagerConfig { election_timeout: Duration::from_millis(200), heartbeat_tick: Duration::from_millis(20), clock_drift: Duration::from_millis(10) }
    }

    #[test]
    fn lease_duration_takes_the_tighter_bound() {
        let c = cfg();
        // half_election = 100ms, triple_heartbeat = 60ms -> 60ms - 10ms drift
        assert_eq!(c.lease_duration(), Duration::from_millis(50));
    }

    #[test]
    fn follower_lease_is_never_valid() {
        let manager = LeaseManager::new(cfg());
        assert!(!manager.is_valid(Instant::now()));
    }

    #[test]
    fn leader_lease_is_valid_until_it_expires() {
        let manager = LeaseManager::new(cfg());
        let now = Instant::now();
        manager.on_became_leader(now);
        assert!(manager.is_valid(now));
        assert!(!manager.is_valid(now + Duration::from_secs(1)));
    }

    #[test]
    fn stepping_down_invalidates_the_lease() {
        let manager = LeaseManager::new(cfg());
        let now = Instant::now();
        manager.on_became_leader(now);
        manager.on_became_follower();
        assert!(!manager.is_valid(now));
    }

    #[test]
    fn commit_index_advance_renews_while_leader() {
        let manager = LeaseManager::new(cfg());
        let now = Instant::now();
        manager.on_became_leader(now);
        manager.on_commit_index(5);
        assert_eq!(manager.last_commit_index(), 5);
        assert!(manager.is_valid(Instant::now()));
    }
}
