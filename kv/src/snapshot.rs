//! Dual-format snapshot (de)serializer: a compact `bincode`-encoded format
//! prefixed with a magic tag, and a legacy `serde_json` textual format
//! without one, matching the existing `codec::json_codec` convention.

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::lease::Lease;
use crate::mvcc::{KeyValue, Revision};

const MAGIC_TAG: &[u8] = b"SNAP-PB:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseSnapshot {
    id: i64,
    ttl_seconds: i64,
    keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub revision: Revision,
    pub kv_table: Vec<KeyValue>,
    lease_table: Vec<LeaseSnapshot>,
}

impl Snapshot {
    pub fn new(revision: Revision, kv_table: Vec<KeyValue>, leases: Vec<Lease>) -> Self {
        let lease_table =
            leases.into_iter().map(|l| LeaseSnapshot { id: l.id, ttl_seconds: l.ttl_seconds, keys: l.keys.into_iter().collect() }).collect();
        Self { revision, kv_table, lease_table }
    }

    /// Reconstructs leases with a fresh grant time; callers that restore a
    /// snapshot into a running node reset TTL clocks at restore.
    pub fn leases(&self, grant_time: tokio::time::Instant) -> Vec<Lease> {
        self.lease_table
            .iter()
            .map(|l| Lease { id: l.id, ttl_seconds: l.ttl_seconds, grant_time, keys: l.keys.iter().cloned().collect() })
            .collect()
    }

    /// Structured encoding: `"SNAP-PB:"` followed by a `bincode` payload.
    pub fn encode(&self) -> CResult<Vec<u8>> {
        let mut out = MAGIC_TAG.to_vec();
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    /// Legacy textual encoding: plain `serde_json`, no tag.
    pub fn encode_legacy(&self) -> CResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Sniffs the magic tag to dispatch between the structured and legacy
    /// formats.
    pub fn decode(bytes: &[u8]) -> CResult<Self> {
        if let Some(body) = bytes.strip_prefix(MAGIC_TAG) {
            bincode::deserialize(body).map_err(Error::from)
        } else {
            serde_json::from_slice(bytes).map_err(Error::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        let kv = KeyValue {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            create_revision: Revision::new(1, 0),
            mod_revision: Revision::new(1, 0),
            version: 1,
            lease: 0,
        };
        Snapshot::new(Revision::new(1, 0), vec![kv], vec![])
    }

    #[test]
    fn structured_roundtrip_carries_magic_tag() {
        let snap = sample();
        let bytes = snap.encode().unwrap();
        assert!(bytes.starts_with(MAGIC_TAG));
        let decoded = Snapshot::decode(&bytes).unwrap();
        assert_eq!(decoded.revision, snap.revision);
        assert_eq!(decoded.kv_table.len(), 1);
    }

    #[test]
    fn legacy_roundtrip_has_no_magic_tag() {
        let snap = sample();
        let bytes = snap.encode_legacy().unwrap();
        assert!(!bytes.starts_with(MAGIC_TAG));
        let decoded = Snapshot::decode(&bytes).unwrap();
        assert_eq!(decoded.kv_table[0].value, b"1");
    }
}
