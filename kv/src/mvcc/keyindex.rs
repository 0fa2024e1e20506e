//! Per-key revision history: a list of *generations*, each a run of live
//! revisions terminated by an optional tombstone. A key that has been put,
//! deleted, and put again has two generations; the second is still open.

use crate::mvcc::Revision;

/// One uninterrupted lifetime of a key: the revisions at which it was
/// written, and, if the generation is closed, the revision of the delete
/// that closed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub revisions: Vec<Revision>,
    pub tombstone: Option<Revision>,
}

impl Generation {
    fn is_closed(&self) -> bool {
        self.tombstone.is_some()
    }

    /// The greatest revision in this generation that is `<= at`, ignoring
    /// whether the generation is closed (callers check that separately).
    fn floor(&self, at: Revision) -> Option<Revision> {
        self.revisions.iter().rev().find(|r| **r <= at).copied()
    }
}

/// The full revision history of one user key.
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    pub generations: Vec<Generation>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self { generations: Vec::new() }
    }

    /// True if the key currently exists (its last generation is open).
    pub fn is_live(&self) -> bool {
        matches!(self.generations.last(), Some(g) if !g.is_closed())
    }

    /// Records a put at `rev`. Opens a new generation if the key is
    /// currently deleted (or has no history yet).
    pub fn put(&mut self, rev: Revision) {
        if self.is_live() {
            self.generations.last_mut().unwrap().revisions.push(rev);
        } else {
            self.generations.push(Generation { revisions: vec![rev], tombstone: None });
        }
    }

    /// Records a delete at `rev`, closing the current generation. No-op if
    /// the key is already deleted (or never existed).
    pub fn tombstone(&mut self, rev: Revision) {
        if let Some(gen) = self.generations.last_mut() {
            if !gen.is_closed() {
                gen.tombstone = Some(rev);
                return;
            }
        }
    }

    /// The create revision of the current (live) generation, if any.
    pub fn create_revision(&self) -> Option<Revision> {
        if !self.is_live() {
            return None;
        }
        self.generations.last().and_then(|g| g.revisions.first().copied())
    }

    /// The number of puts in the current (live) generation, i.e. etcd's
    /// `version` field. Zero if the key is not live.
    pub fn version(&self) -> i64 {
        if !self.is_live() {
            return 0;
        }
        self.generations.last().map(|g| g.revisions.len() as i64).unwrap_or(0)
    }

    /// Finds the revision of the value visible at `at_rev`, if the key was
    /// live (in some generation) at that point.
    pub fn revision_at(&self, at_rev: Revision) -> Option<Revision> {
        for gen in self.generations.iter().rev() {
            if let Some(tomb) = gen.tombstone {
                if at_rev >= tomb {
                    // `at_rev` sees this generation's death (or a later
                    // one); no live value here.
                    continue;
                }
            }
            if let Some(r) = gen.floor(at_rev) {
                return Some(r);
            }
        }
        None
    }

    /// The most recent mod revision as of `at_rev` across all generations,
    /// used to answer `mod_revision` for a live key (`at_rev` = now).
    pub fn last_mod_revision(&self) -> Option<Revision> {
        self.generations.last().and_then(|g| g.tombstone.or_else(|| g.revisions.last().copied()))
    }

    /// Drops history below `target`, keeping only what's needed to answer
    /// reads at `target` or later: for each generation entirely below
    /// `target`, drop it unless it's the last one that can still answer a
    /// read at `target` (i.e. the most recent put at or before `target`).
    pub fn compact(&mut self, target: Revision) {
        // Find the generation (if any) whose tombstone is >= target, or the
        // live generation: everything strictly older can be collapsed. If
        // every generation closes at or before `target`, there is nothing
        // left to keep at all.
        let mut keep_from = self.generations.len();
        for (i, gen) in self.generations.iter().enumerate() {
            match gen.tombstone {
                Some(t) if t <= target => continue,
                _ => {
                    keep_from = i;
                    break;
                }
            }
        }
        self.generations.drain(..keep_from);

        for gen in &mut self.generations {
            if gen.revisions.is_empty() {
                continue;
            }
            // Keep the newest revision <= target (so reads at `target`
            // still resolve) plus everything newer than `target`.
            let split = match gen.revisions.iter().rposition(|r| *r <= target) {
                Some(idx) => idx,
                None => 0,
            };
            if split > 0 {
                gen.revisions.drain(..split);
            }
        }
        self.generations.retain(|g| !g.revisions.is_empty() || g.tombstone.is_some());
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }
}
