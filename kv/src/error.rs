//! The single error type shared by every module in this crate.
//!
//! Follows the convention already used at the call sites throughout
//! `storage/log.rs` and `storage/log_cask.rs`: a flat enum with hand-written
//! `From` conversions for the handful of external error types we actually
//! propagate, rather than a derive-macro crate.

use std::fmt;

pub type CResult<T> = Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A write carried a zero-length key.
    EmptyKey,

    /// A read targeted a key that does not exist (or is tombstoned) at the
    /// requested revision.
    KeyNotFound,

    /// A read or compact targeted a revision below the compaction watermark.
    Compacted { compacted_revision: i64 },

    /// A read or compact targeted a revision above the current revision.
    FutureRevision { current_revision: i64 },

    /// A put referenced an unknown or expired lease, or a grant reused a
    /// live lease id.
    InvalidLease(i64),

    /// A revoke/renew/ttl targeted an unknown lease id.
    LeaseNotFound(i64),

    /// A waiter did not observe an apply notification within its deadline.
    Timeout,

    /// The caller's context was cancelled before completion.
    Cancelled,

    /// The operation was attempted on a component that has shut down.
    Closed,

    /// A configured limit (connections, watches, leases, request size) was
    /// exceeded.
    ResourceExhausted(String),

    /// A linearizable operation was attempted on a non-leader node.
    NotLeader { leader_hint: Option<u64> },

    /// An encode/decode step failed.
    Parse(String),

    /// Catch-all for I/O, lock, or other internal failures that don't carry
    /// caller-actionable semantics of their own.
    Internal(String),

    /// A byte value could not be interpreted as valid UTF-8/etc. by a value
    /// transform.
    Value(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EmptyKey => write!(f, "key must not be empty"),
            Error::KeyNotFound => write!(f, "key not found"),
            Error::Compacted { compacted_revision } => {
                write!(f, "required revision has been compacted, compacted revision is {}", compacted_revision)
            }
            Error::FutureRevision { current_revision } => {
                write!(f, "required revision is a future revision, current revision is {}", current_revision)
            }
            Error::InvalidLease(id) => write!(f, "invalid lease: {}", id),
            Error::LeaseNotFound(id) => write!(f, "lease not found: {}", id),
            Error::Timeout => write!(f, "request timed out waiting for apply notification"),
            Error::Cancelled => write!(f, "request was cancelled"),
            Error::Closed => write!(f, "component is closed"),
            Error::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            Error::NotLeader { leader_hint } => match leader_hint {
                Some(id) => write!(f, "not leader, current leader is {}", id),
                None => write!(f, "not leader, no known leader"),
            },
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Value(msg) => write!(f, "value error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

