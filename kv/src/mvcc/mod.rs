//! Multi-version storage for user keys: a `Revision` clock, a per-key
//! generation index (`keyindex`), and the `MvccStore` that ties the index to
//! the sharded byte-oriented [`Engine`](crate::storage::engine::Engine)
//! backend defined in `storage`.

pub mod keyindex;
pub mod store;

use serde_derive::{Deserialize, Serialize};
use std::cmp::Ordering;

pub use keyindex::{Generation, KeyIndex};
pub use store::{KeyValue, MvccStore};

/// A `(main, sub)` pair identifying a single committed write. `main` is the
/// transaction's position in the apply order; `sub` distinguishes multiple
/// operations applied atomically within the same transaction. Compares
/// lexicographically, so `(5, 0) < (5, 1) < (6, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

impl Revision {
    pub const ZERO: Revision = Revision { main: 0, sub: 0 };

    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.main, self.sub).cmp(&(other.main, other.sub))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.main, self.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_order_lexicographically() {
        assert!(Revision::new(5, 0) < Revision::new(5, 1));
        assert!(Revision::new(5, 9) < Revision::new(6, 0));
        assert_eq!(Revision::new(1, 1), Revision::new(1, 1));
    }
}
