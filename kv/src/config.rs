//! Layered configuration surface (§6 of the design): a `ConfigLoad`-style
//! struct of plain `Option<_>` fields with accessor methods that fall back
//! to documented defaults, mirroring `kvcli::server::config::ConfigLoad`
//! rather than a `Default`-derive-everything approach. Intended to be
//! loaded from TOML/JSON via `confy`, same as the CLI's own config.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::batcher::BatcherConfig;
use crate::compactor::{CompactionMode, CompactorConfig};
use crate::leaseread::LeaseManagerConfig;
use crate::raftadapter::RaftConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    pub max_connections: Option<usize>,
    pub max_watch_count: Option<usize>,
    pub max_lease_count: Option<usize>,
    pub max_request_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    node_id: Option<u64>,

    raft_tick_interval_ms: Option<u64>,
    raft_election_tick: Option<usize>,
    raft_heartbeat_tick: Option<usize>,
    raft_pre_vote: Option<bool>,
    raft_check_quorum: Option<bool>,
    raft_applied_snapshot_threshold: Option<u64>,

    batcher_enable: Option<bool>,
    batcher_min_batch_size: Option<usize>,
    batcher_max_batch_size: Option<usize>,
    batcher_min_timeout_ms: Option<u64>,
    batcher_max_timeout_ms: Option<u64>,
    batcher_load_threshold: Option<f64>,

    lease_read_enable: Option<bool>,
    lease_read_clock_drift_ms: Option<u64>,
    lease_read_timeout_ms: Option<u64>,
    election_timeout_ms: Option<u64>,

    compactor_enable: Option<bool>,
    /// `"revision"` or `"periodic"`; anything else falls back to `"revision"`.
    compactor_mode: Option<String>,
    compactor_retention: Option<i64>,
    compactor_period_secs: Option<u64>,
    compactor_check_interval_secs: Option<u64>,

    pub limits: Option<Limits>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            node_id: Some(1),
            raft_tick_interval_ms: Some(100),
            raft_election_tick: Some(10),
            raft_heartbeat_tick: Some(1),
            raft_pre_vote: Some(true),
            raft_check_quorum: Some(true),
            raft_applied_snapshot_threshold: Some(10_000),
            batcher_enable: Some(true),
            batcher_min_batch_size: Some(1),
            batcher_max_batch_size: Some(256),
            batcher_min_timeout_ms: Some(5),
            batcher_max_timeout_ms: Some(20),
            batcher_load_threshold: Some(0.7),
            lease_read_enable: Some(true),
            lease_read_clock_drift_ms: Some(100),
            lease_read_timeout_ms: Some(5_000),
            election_timeout_ms: Some(1_000),
            compactor_enable: Some(true),
            compactor_mode: Some("revision".to_string()),
            compactor_retention: Some(1_000),
            compactor_period_secs: Some(3_600),
            compactor_check_interval_secs: Some(60),
            limits: Some(Limits::default()),
        }
    }
}

impl ConfigLoad {
    pub fn node_id(&self) -> u64 {
        self.node_id.unwrap_or(1)
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            id: self.node_id(),
            election_tick: self.raft_election_tick.unwrap_or(10),
            heartbeat_tick: self.raft_heartbeat_tick.unwrap_or(1),
            tick_interval: Duration::from_millis(self.raft_tick_interval_ms.unwrap_or(100)),
            applied_snapshot_threshold: self.raft_applied_snapshot_threshold.unwrap_or(10_000),
            pre_vote: self.raft_pre_vote.unwrap_or(true),
            check_quorum: self.raft_check_quorum.unwrap_or(true),
        }
    }

    pub fn batcher_enabled(&self) -> bool {
        self.batcher_enable.unwrap_or(true)
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            min_batch_size: self.batcher_min_batch_size.unwrap_or(1),
            max_batch_size: self.batcher_max_batch_size.unwrap_or(256),
            min_timeout: Duration::from_millis(self.batcher_min_timeout_ms.unwrap_or(5)),
            max_timeout: Duration::from_millis(self.batcher_max_timeout_ms.unwrap_or(20)),
            load_threshold: self.batcher_load_threshold.unwrap_or(0.7),
        }
    }

    pub fn lease_read_enabled(&self) -> bool {
        self.lease_read_enable.unwrap_or(true)
    }

    pub fn lease_manager_config(&self) -> LeaseManagerConfig {
        LeaseManagerConfig {
            election_timeout: Duration::from_millis(self.election_timeout_ms.unwrap_or(1_000)),
            heartbeat_tick: Duration::from_millis(self.raft_tick_interval_ms.unwrap_or(100) * self.raft_heartbeat_tick.unwrap_or(1) as u64),
            clock_drift: Duration::from_millis(self.lease_read_clock_drift_ms.unwrap_or(100)),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_read_timeout_ms.unwrap_or(5_000))
    }

    pub fn compactor_enabled(&self) -> bool {
        self.compactor_enable.unwrap_or(true)
    }

    pub fn compactor_config(&self) -> CompactorConfig {
        let mode = match self.compactor_mode.as_deref() {
            Some("periodic") => CompactionMode::Periodic { retain: Duration::from_secs(self.compactor_period_secs.unwrap_or(3_600)) },
            _ => CompactionMode::Revision { retain: self.compactor_retention.unwrap_or(1_000) },
        };
        CompactorConfig { mode, check_interval: Duration::from_secs(self.compactor_check_interval_secs.unwrap_or(60)) }
    }

    pub fn limits(&self) -> Limits {
        self.limits.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_recommendations() {
        let cfg = ConfigLoad::default();
        assert_eq!(cfg.batcher_config().max_batch_size, 256);
        assert_eq!(cfg.batcher_config().min_timeout, Duration::from_millis(5));
        assert!(cfg.raft_config().pre_vote);
        assert!(cfg.raft_config().check_quorum);
    }

    #[test]
    fn compactor_mode_falls_back_to_revision_on_unknown_string() {
        let mut cfg = ConfigLoad::default();
        cfg.compactor_mode = Some("bogus".to_string());
        assert!(matches!(cfg.compactor_config().mode, CompactionMode::Revision { .. }));
    }

    #[test]
    fn partial_toml_like_overrides_leave_other_defaults_intact() {
        let cfg = ConfigLoad { batcher_max_batch_size: Some(64), ..ConfigLoad::default() };
        assert_eq!(cfg.batcher_config().max_batch_size, 64);
        assert_eq!(cfg.batcher_config().min_batch_size, 1);
    }
}
