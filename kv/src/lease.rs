//! The lease table: `lease id -> (ttl, grant time, attached keys)`, with a
//! background expiry task. Not to be confused with the Raft leader's
//! read-lease tracked in `leaseread` -- the two share a name but nothing
//! else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::{CResult, Error};

#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    pub ttl_seconds: i64,
    pub grant_time: Instant,
    pub keys: HashSet<Vec<u8>>,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.grant_time) >= Duration::from_secs(self.ttl_seconds.max(0) as u64)
    }

    pub fn remaining_ttl(&self, now: Instant) -> i64 {
        let elapsed = now.duration_since(self.grant_time).as_secs() as i64;
        (self.ttl_seconds - elapsed).max(0)
    }
}

/// Table of live leases, guarded by a single lock: grants, revokes, and
/// attach/detach are all infrequent relative to KV point ops, so a coarse
/// lock (matching the transaction lock's granularity) is simpler than
/// sharding leases too.
pub struct LeaseTable {
    leases: RwLock<HashMap<i64, Lease>>,
    max_leases: Option<usize>,
}

impl LeaseTable {
    pub fn new(max_leases: Option<usize>) -> Self {
        Self { leases: RwLock::new(HashMap::new()), max_leases }
    }

    pub fn grant(&self, id: i64, ttl_seconds: i64, now: Instant) -> CResult<Lease> {
        let mut leases = self.leases.write();
        if leases.contains_key(&id) {
            return Err(Error::InvalidLease(id));
        }
        if let Some(max) = self.max_leases {
            if leases.len() >= max {
                return Err(Error::ResourceExhausted(format!("lease count at cap {}", max)));
            }
        }
        let lease = Lease { id, ttl_seconds, grant_time: now, keys: HashSet::new() };
        leases.insert(id, lease.clone());
        Ok(lease)
    }

    /// Revokes a lease, returning the set of keys that were attached to it
    /// (the caller, typically the apply pipeline, is responsible for
    /// deleting each through the normal delete path so watches fire).
    pub fn revoke(&self, id: i64) -> CResult<HashSet<Vec<u8>>> {
        let mut leases = self.leases.write();
        leases.remove(&id).map(|l| l.keys).ok_or(Error::LeaseNotFound(id))
    }

    pub fn renew(&self, id: i64, now: Instant) -> CResult<i64> {
        let mut leases = self.leases.write();
        let lease = leases.get_mut(&id).ok_or(Error::LeaseNotFound(id))?;
        lease.grant_time = now;
        Ok(lease.ttl_seconds)
    }

    pub fn time_to_live(&self, id: i64, now: Instant) -> CResult<i64> {
        let leases = self.leases.read();
        let lease = leases.get(&id).ok_or(Error::LeaseNotFound(id))?;
        Ok(lease.remaining_ttl(now))
    }

    pub fn attach(&self, id: i64, key: Vec<u8>) -> CResult<()> {
        let mut leases = self.leases.write();
        let lease = leases.get_mut(&id).ok_or(Error::InvalidLease(id))?;
        lease.keys.insert(key);
        Ok(())
    }

    pub fn detach(&self, id: i64, key: &[u8]) {
        let mut leases = self.leases.write();
        if let Some(lease) = leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    pub fn is_live(&self, id: i64) -> bool {
        self.leases.read().contains_key(&id)
    }

    /// Ids of every lease past its TTL as of `now`.
    pub fn expired_ids(&self, now: Instant) -> Vec<i64> {
        self.leases.read().values().filter(|l| l.is_expired(now)).map(|l| l.id).collect()
    }

    pub fn snapshot(&self) -> Vec<Lease> {
        self.leases.read().values().cloned().collect()
    }

    pub fn restore(&self, leases: Vec<Lease>) {
        let mut table = self.leases.write();
        table.clear();
        for lease in leases {
            table.insert(lease.id, lease);
        }
    }
}

/// Runs on an interval, revoking every lease whose TTL has elapsed. Revoked
/// leases' attached keys are handed to `on_expire` (the apply pipeline) so
/// each deletion goes through the normal revision-bumping, watch-firing
/// path rather than being silently dropped here.
pub async fn run_expiry_task<F>(table: Arc<LeaseTable>, check_interval: Duration, mut running: tokio::sync::watch::Receiver<bool>, on_expire: F)
where
    F: Fn(i64, HashSet<Vec<u8>>) + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(check_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                for id in table.expired_ids(now) {
                    match table.revoke(id) {
                        Ok(keys) => {
                            log::debug!("lease {} expired, revoking {} attached keys", id, keys.len());
                            on_expire(id, keys);
                        }
                        Err(err) => log::warn!("expiry race revoking lease {}: {}", id, err),
                    }
                }
            }
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_rejects_duplicate_id() {
        let table = LeaseTable::new(None);
        table.grant(1, 60, Instant::now()).unwrap();
        assert!(table.grant(1, 60, Instant::now()).is_err());
    }

    #[test]
    fn revoke_returns_attached_keys() {
        let table = LeaseTable::new(None);
        table.grant(1, 60, Instant::now()).unwrap();
        table.attach(1, b"a".to_vec()).unwrap();
        table.attach(1, b"b".to_vec()).unwrap();
        let keys = table.revoke(1).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(table.revoke(1).is_err());
    }

    #[test]
    fn grant_beyond_cap_fails() {
        let table = LeaseTable::new(Some(1));
        table.grant(1, 60, Instant::now()).unwrap();
        assert!(matches!(table.grant(2, 60, Instant::now()), Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn attach_to_unknown_lease_is_invalid() {
        let table = LeaseTable::new(None);
        assert!(matches!(table.attach(99, b"a".to_vec()), Err(Error::InvalidLease(99))));
    }
}
