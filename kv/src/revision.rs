//! The process-wide revision counter.
//!
//! Only the apply pipeline (`apply::Pipeline`) ever advances this; every
//! other component treats it as a read-only, strictly monotonic clock. See
//! `mvcc::Revision` for the `(main, sub)` pair this generator produces.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::mvcc::Revision;

/// A single atomic `main` counter with a co-located `sub` counter for
/// sub-operations inside one batched transaction.
#[derive(Debug, Default)]
pub struct RevisionGenerator {
    main: AtomicI64,
    sub: AtomicI64,
}

impl RevisionGenerator {
    pub fn new() -> Self {
        Self { main: AtomicI64::new(0), sub: AtomicI64::new(0) }
    }

    /// Restores the generator to a known `main` value, e.g. after loading a
    /// snapshot. Not safe to call concurrently with `next`.
    pub fn restore(&self, main: i64) {
        self.main.store(main, Ordering::SeqCst);
        self.sub.store(0, Ordering::SeqCst);
    }

    /// Advances to the next transaction: bumps `main`, resets `sub` to 0.
    /// Returns the revision for the transaction's first (or only) op.
    pub fn next(&self) -> Revision {
        let main = self.main.fetch_add(1, Ordering::SeqCst) + 1;
        self.sub.store(0, Ordering::SeqCst);
        Revision::new(main, 0)
    }

    /// Advances only `sub`, for the Nth sub-operation of the transaction
    /// currently in flight. Must be called after `next()` for that
    /// transaction.
    pub fn next_sub(&self) -> Revision {
        let main = self.main.load(Ordering::SeqCst);
        let sub = self.sub.fetch_add(1, Ordering::SeqCst) + 1;
        Revision::new(main, sub)
    }

    /// The current `main` revision, with no side effects.
    pub fn current(&self) -> i64 {
        self.main.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_strictly_monotonic() {
        let gen = RevisionGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert!(b > a);
        assert_eq!(a.sub, 0);
        assert_eq!(b.sub, 0);
    }

    #[test]
    fn next_sub_shares_main_and_increments() {
        let gen = RevisionGenerator::new();
        let first = gen.next();
        let sub1 = gen.next_sub();
        let sub2 = gen.next_sub();
        assert_eq!(sub1.main, first.main);
        assert_eq!(sub2.main, first.main);
        assert_eq!(sub1.sub, 1);
        assert_eq!(sub2.sub, 2);
    }

    #[test]
    fn restore_resets_current() {
        let gen = RevisionGenerator::new();
        gen.next();
        gen.next();
        gen.restore(100);
        assert_eq!(gen.current(), 100);
        let next = gen.next();
        assert_eq!(next.main, 101);
    }
}
