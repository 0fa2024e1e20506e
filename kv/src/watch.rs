//! Subscription registry for key/range watches: fan-out of KV mutation
//! events with bounded per-subscriber channels and slow-watcher eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{CResult, Error};
use crate::mvcc::{KeyValue, Revision};

pub const DEFAULT_CHANNEL_DEPTH: usize = 100;
pub const SLOW_WATCHER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchFilters {
    pub no_put: bool,
    pub no_delete: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub prev_kv: bool,
    pub progress_notify: bool,
    pub filters: WatchFilters,
    pub fragment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub watch_id: i64,
    pub event_type: EventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
    pub revision: Revision,
}

struct Subscription {
    key: Vec<u8>,
    /// Empty = single key; `"\x00"` = open-ended; otherwise half-open
    /// `[key, range_end)`.
    range_end: Vec<u8>,
    options: WatchOptions,
    sender: mpsc::Sender<WatchEvent>,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    fn matches(&self, key: &[u8]) -> bool {
        if self.range_end.is_empty() {
            return key == self.key.as_slice();
        }
        if self.range_end == b"\x00" {
            return key >= self.key.as_slice();
        }
        key >= self.key.as_slice() && key < self.range_end.as_slice()
    }
}

pub struct WatchRegistry {
    subscriptions: RwLock<HashMap<i64, Subscription>>,
    next_id: AtomicI64,
    max_watches: Option<usize>,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WatchRegistry {
    pub fn new(max_watches: Option<usize>) -> Self {
        Self { subscriptions: RwLock::new(HashMap::new()), next_id: AtomicI64::new(1), max_watches }
    }

    /// Registers a new subscription and returns its id plus the receiving
    /// end of its bounded channel. `backfill` (best-effort snapshot replay
    /// for `start_revision > 0`) is the caller's responsibility: the
    /// registry only fans out events from this point forward.
    pub fn subscribe(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        options: WatchOptions,
    ) -> CResult<(i64, mpsc::Receiver<WatchEvent>, Arc<AtomicBool>)> {
        let mut subscriptions = self.subscriptions.write();
        if let Some(max) = self.max_watches {
            if subscriptions.len() >= max {
                return Err(Error::ResourceExhausted(format!("watch count at cap {}", max)));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
        let cancelled = Arc::new(AtomicBool::new(false));
        subscriptions.insert(id, Subscription { key, range_end, options, sender: tx, cancelled: cancelled.clone() });
        Ok((id, rx, cancelled))
    }

    /// Idempotent: cancelling an already-cancelled or unknown id is a no-op.
    pub fn cancel(&self, id: i64) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            sub.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Called by the apply pipeline after every mutation. Builds the list
    /// of matching subscriptions under a read lock, releases it, then
    /// delivers -- so a slow subscriber's retry loop never holds up the
    /// next mutation.
    pub fn notify(&self, event_type: EventType, kv: KeyValue, prev_kv: Option<KeyValue>, revision: Revision) {
        let key = kv.key.clone();
        let matches: Vec<(i64, WatchOptions, mpsc::Sender<WatchEvent>, Arc<AtomicBool>)> = {
            let subs = self.subscriptions.read();
            subs.iter()
                .filter(|(_, sub)| sub.matches(&key))
                .map(|(id, sub)| (*id, sub.options, sub.sender.clone(), sub.cancelled.clone()))
                .collect()
        };

        for (watch_id, options, sender, cancelled) in matches {
            if cancelled.load(Ordering::SeqCst) {
                continue;
            }
            if options.filters.no_put && event_type == EventType::Put {
                continue;
            }
            if options.filters.no_delete && event_type == EventType::Delete {
                continue;
            }

            let event = WatchEvent {
                watch_id,
                event_type,
                kv: kv.clone(),
                prev_kv: if options.prev_kv { prev_kv.clone() } else { None },
                revision,
            };

            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.spawn_deferred_retry(sender, event, cancelled);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.cancel(watch_id);
                }
            }
        }
    }

    fn spawn_deferred_retry(&self, sender: mpsc::Sender<WatchEvent>, event: WatchEvent, cancelled: Arc<AtomicBool>) {
        let watch_id = event.watch_id;
        tokio::spawn(async move {
            let send = sender.send_timeout(event, SLOW_WATCHER_TIMEOUT);
            if send.await.is_err() {
                log::warn!("watch {} did not drain within {:?}, evicting slow watcher", watch_id, SLOW_WATCHER_TIMEOUT);
                cancelled.store(true, Ordering::SeqCst);
            }
        });
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &[u8]) -> KeyValue {
        KeyValue { key: key.to_vec(), value: b"v".to_vec(), create_revision: Revision::new(1, 0), mod_revision: Revision::new(1, 0), version: 1, lease: 0 }
    }

    #[tokio::test]
    async fn single_key_watch_sees_matching_events_only() {
        let registry = WatchRegistry::new(None);
        let (_id, mut rx, _cancel) = registry.subscribe(b"a".to_vec(), Vec::new(), WatchOptions::default()).unwrap();

        registry.notify(EventType::Put, kv(b"b"), None, Revision::new(1, 0));
        registry.notify(EventType::Put, kv(b"a"), None, Revision::new(2, 0));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kv.key, b"a");
        assert_eq!(event.revision, Revision::new(2, 0));
    }

    #[tokio::test]
    async fn range_watch_matches_half_open_interval() {
        let registry = WatchRegistry::new(None);
        let (_id, mut rx, _cancel) = registry.subscribe(b"a".to_vec(), b"c".to_vec(), WatchOptions::default()).unwrap();

        registry.notify(EventType::Put, kv(b"a"), None, Revision::new(1, 0));
        registry.notify(EventType::Put, kv(b"c"), None, Revision::new(2, 0));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kv.key, b"a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_put_filter_suppresses_put_events() {
        let registry = WatchRegistry::new(None);
        let options = WatchOptions { filters: WatchFilters { no_put: true, no_delete: false }, ..Default::default() };
        let (_id, mut rx, _cancel) = registry.subscribe(b"a".to_vec(), Vec::new(), options).unwrap();

        registry.notify(EventType::Put, kv(b"a"), None, Revision::new(1, 0));
        registry.notify(EventType::Delete, kv(b"a"), Some(kv(b"a")), Revision::new(2, 0));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Delete);
    }

    #[test]
    fn cancel_is_idempotent() {
        let registry = WatchRegistry::new(None);
        let (id, _rx, _cancel) = registry.subscribe(b"a".to_vec(), Vec::new(), WatchOptions::default()).unwrap();
        registry.cancel(id);
        registry.cancel(id);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn subscribe_beyond_cap_fails() {
        let registry = WatchRegistry::new(Some(1));
        registry.subscribe(b"a".to_vec(), Vec::new(), WatchOptions::default()).unwrap();
        assert!(matches!(
            registry.subscribe(b"b".to_vec(), Vec::new(), WatchOptions::default()),
            Err(Error::ResourceExhausted(_))
        ));
    }
}
