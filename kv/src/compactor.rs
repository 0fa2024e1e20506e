//! Background auto-compaction: either retain-last-N-revisions or
//! retain-a-time-window, ticking on its own interval.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::mvcc::{MvccStore, Revision};
use crate::storage::engine::Engine;

#[derive(Debug, Clone, Copy)]
pub enum CompactionMode {
    Revision { retain: i64 },
    Periodic { retain: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct CompactorConfig {
    pub mode: CompactionMode,
    pub check_interval: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self { mode: CompactionMode::Revision { retain: 1000 }, check_interval: Duration::from_secs(60) }
    }
}

/// A history of `(revision, wall-clock time)` samples, coarse enough to let
/// periodic mode estimate "the revision as of T seconds ago" without
/// needing every revision's timestamp stored forever.
#[derive(Default)]
pub struct RevisionClock {
    samples: parking_lot::RwLock<Vec<(Revision, std::time::Instant)>>,
}

impl RevisionClock {
    pub fn record(&self, revision: Revision, at: std::time::Instant) {
        let mut samples = self.samples.write();
        samples.push((revision, at));
        if samples.len() > 4096 {
            let excess = samples.len() - 4096;
            samples.drain(..excess);
        }
    }

    /// The newest revision recorded at or before `cutoff`, or `Revision::ZERO`
    /// if the window predates all samples (i.e. nothing to compact yet).
    pub fn revision_before(&self, cutoff: std::time::Instant) -> Revision {
        self.samples.read().iter().rev().find(|(_, t)| *t <= cutoff).map(|(r, _)| *r).unwrap_or(Revision::ZERO)
    }
}

pub fn target_revision(mode: CompactionMode, clock: &RevisionClock, current: Revision, now: std::time::Instant) -> Revision {
    match mode {
        CompactionMode::Revision { retain } => Revision::new((current.main - retain).max(0), 0),
        CompactionMode::Periodic { retain } => clock.revision_before(now - retain),
    }
}

/// Runs the compaction loop until `running` flips to `false`. A target at
/// or below the watermark (e.g. two ticks racing the same window) comes
/// back as `Compacted`, which this loop treats as an already-done no-op
/// rather than a failure -- only a client-initiated compact should see
/// that as an error.
pub async fn run_compactor<E: Engine>(
    cfg: CompactorConfig,
    store: Arc<MvccStore<E>>,
    clock: Arc<RevisionClock>,
    current_revision: impl Fn() -> Revision + Send + 'static,
    mut running: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.check_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = current_revision();
                let target = target_revision(cfg.mode, &clock, current, std::time::Instant::now());
                if target.main <= 0 {
                    continue;
                }
                match store.compact(target, current) {
                    Ok(()) => log::info!("compacted to revision {}", target),
                    Err(Error::Compacted { .. }) => {}
                    Err(err) => log::warn!("compaction to {} failed: {}", target, err),
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
    fn revision_mode_retains_last_n() {
        let clock = RevisionClock::default();
        let target = target_revision(CompactionMode::Revision { retain: 1000 }, &clock, Revision::new(1500, 0), std::time::Instant::now());
        assert_eq!(target.main, 500);
    }

    #[test]
    fn revision_mode_never_targets_below_zero() {
        let clock = RevisionClock::default();
        let target = target_revision(CompactionMode::Revision { retain: 1000 }, &clock, Revision::new(10, 0), std::time::Instant::now());
        assert_eq!(target.main, 0);
    }

    #[test]
    fn periodic_mode_uses_clock_samples() {
        let clock = RevisionClock::default();
        let t0 = std::time::Instant::now();
        clock.record(Revision::new(10, 0), t0);
        let later = t0 + Duration::from_secs(30);
        clock.record(Revision::new(20, 0), later);

        let target = target_revision(CompactionMode::Periodic { retain: Duration::from_secs(10) }, &clock, Revision::new(20, 0), later);
        assert_eq!(target.main, 20);
    }
}
