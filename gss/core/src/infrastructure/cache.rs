// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Upcall Cache
//!
//! Generic keyed cache whose entries are filled in by an external helper.
//!
//! ## Entry states
//!
//! ```text
//! lookup()  → new (expires after new_entry_ttl)
//! check()   → pending (request line sent to the helper, once per entry)
//! update()  → valid, or valid + negative
//! sweep()   → removed once expired; waiters are woken
//! ```
//!
//! An entry that is already valid is never modified in place: `update()`
//! installs a fresh entry and expires the old one, so holders of the old
//! `Arc` keep a consistent view.
//!
//! Lock order is table lock, then entry lock.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::domain::clock;

/// Describes one concrete cache: its key/value types and upcall encoding.
pub trait CacheDetail: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Send + Sync + fmt::Debug;
    /// Request data kept alongside the key but not part of it.
    type Meta: Send + Sync;
    type Value: Send + Sync;

    fn name(&self) -> &'static str;

    /// Line sent to the helper for a pending entry. `None` when the cache
    /// has no upcall and is only filled by explicit installs.
    fn encode_request(&self, _key: &Self::Key, _meta: &Self::Meta) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Valid, positive and unexpired.
    Ready,
    /// Valid but negative, or expired.
    Negative,
    /// Waiting for the helper.
    Pending,
    /// Not valid and nobody can fill it in.
    Unavailable,
}

#[derive(Debug)]
struct HeadState {
    valid: bool,
    negative: bool,
    pending: bool,
    expiry: DateTime<Utc>,
}

pub struct CacheHead<D: CacheDetail> {
    key: D::Key,
    meta: D::Meta,
    state: Mutex<HeadState>,
    value: OnceLock<D::Value>,
    changed: Notify,
}

impl<D: CacheDetail> CacheHead<D> {
    fn new(key: D::Key, meta: D::Meta, expiry: DateTime<Utc>) -> Self {
        Self {
            key,
            meta,
            state: Mutex::new(HeadState {
                valid: false,
                negative: false,
                pending: false,
                expiry,
            }),
            value: OnceLock::new(),
            changed: Notify::new(),
        }
    }

    pub fn key(&self) -> &D::Key {
        &self.key
    }

    pub fn meta(&self) -> &D::Meta {
        &self.meta
    }

    /// The value of a valid, positive entry.
    pub fn value(&self) -> Option<&D::Value> {
        let state = self.state.lock();
        if state.valid && !state.negative {
            self.value.get()
        } else {
            None
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn is_negative(&self) -> bool {
        self.state.lock().negative
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.state.lock().expiry
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.lock().expiry <= now
    }

    /// Usable for real traffic at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        state.valid && !state.negative && state.expiry > now
    }

    pub fn set_expiry(&self, expiry: DateTime<Utc>) {
        self.state.lock().expiry = expiry;
    }

    /// Turns the entry negative so it is never matched again, expiring at `expiry`.
    pub fn make_negative(&self, expiry: DateTime<Utc>) {
        {
            let mut state = self.state.lock();
            state.valid = true;
            state.negative = true;
            state.pending = false;
            state.expiry = expiry;
        }
        self.changed.notify_waiters();
    }

    fn expire_now(&self) {
        self.state.lock().expiry = DateTime::<Utc>::MIN_UTC;
        self.changed.notify_waiters();
    }
}

impl<D: CacheDetail> fmt::Debug for CacheHead<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHead")
            .field("key", &self.key)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Pipe between a cache and its helper. At most one reader is attached.
#[derive(Debug, Default)]
pub struct UpcallChannel {
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl UpcallChannel {
    /// Attaches a reader, replacing any previous one.
    pub fn open(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        rx
    }

    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn has_listener(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn send(&self, line: String) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }
}

pub struct UpcallCache<D: CacheDetail> {
    detail: D,
    table: RwLock<HashMap<D::Key, Arc<CacheHead<D>>>>,
    channel: UpcallChannel,
    new_entry_ttl: Duration,
}

impl<D: CacheDetail> UpcallCache<D> {
    pub fn new(detail: D, new_entry_ttl: Duration) -> Self {
        Self {
            detail,
            table: RwLock::new(HashMap::new()),
            channel: UpcallChannel::default(),
            new_entry_ttl,
        }
    }

    pub fn detail(&self) -> &D {
        &self.detail
    }

    pub fn name(&self) -> &'static str {
        self.detail.name()
    }

    pub fn channel(&self) -> &UpcallChannel {
        &self.channel
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    fn new_entry_expiry(&self) -> DateTime<Utc> {
        clock::deadline(Utc::now(), self.new_entry_ttl)
    }

    /// Returns the entry for `key`, creating a new one when absent or expired.
    pub fn lookup(&self, key: D::Key, meta: D::Meta) -> Arc<CacheHead<D>> {
        let now = Utc::now();
        if let Some(head) = self.table.read().get(&key) {
            if !head.is_expired(now) {
                return head.clone();
            }
        }

        let mut table = self.table.write();
        if let Some(head) = table.get(&key) {
            if !head.is_expired(now) {
                return head.clone();
            }
        }
        let head = Arc::new(CacheHead::new(key.clone(), meta, self.new_entry_expiry()));
        if let Some(old) = table.insert(key, head.clone()) {
            old.changed.notify_waiters();
        }
        head
    }

    /// Returns the entry for `key` without creating one.
    pub fn find(&self, key: &D::Key) -> Option<Arc<CacheHead<D>>> {
        self.table.read().get(key).cloned()
    }

    /// Stores the helper's answer. `None` makes the entry negative.
    ///
    /// A not-yet-valid entry is filled in place and its waiters woken; a valid
    /// one is replaced by a fresh entry.
    pub fn update(
        &self,
        key: D::Key,
        meta: D::Meta,
        value: Option<D::Value>,
        expiry: DateTime<Utc>,
    ) -> Arc<CacheHead<D>> {
        let mut table = self.table.write();

        if let Some(head) = table.get(&key) {
            let mut state = head.state.lock();
            if !state.valid {
                state.valid = true;
                state.pending = false;
                state.negative = value.is_none();
                state.expiry = expiry;
                if let Some(value) = value {
                    if head.value.set(value).is_err() {
                        warn!(cache = self.name(), key = ?head.key, "entry filled twice");
                    }
                }
                drop(state);
                head.changed.notify_waiters();
                return head.clone();
            }
        }

        let head = Arc::new(CacheHead::new(key.clone(), meta, expiry));
        {
            let mut state = head.state.lock();
            state.valid = true;
            state.negative = value.is_none();
        }
        if let Some(value) = value {
            let _ = head.value.set(value);
        }
        if let Some(old) = table.insert(key, head.clone()) {
            old.expire_now();
        }
        head
    }

    /// Fills the entry for `key` only if it is still waiting on the helper.
    /// The check and the fill happen under one table lock, so of two racing
    /// answers exactly one lands. Returns `None` when nothing was pending.
    pub fn fill_pending(
        &self,
        key: &D::Key,
        value: Option<D::Value>,
        expiry: DateTime<Utc>,
    ) -> Option<Arc<CacheHead<D>>> {
        let table = self.table.write();
        let head = table.get(key)?;

        let mut state = head.state.lock();
        if state.valid || !state.pending {
            return None;
        }
        state.valid = true;
        state.pending = false;
        state.negative = value.is_none();
        state.expiry = expiry;
        if let Some(value) = value {
            if head.value.set(value).is_err() {
                warn!(cache = self.name(), key = ?head.key, "entry filled twice");
            }
        }
        drop(state);
        head.changed.notify_waiters();
        Some(head.clone())
    }

    /// Classifies `head`, sending its upcall if it still needs one.
    pub fn check(&self, head: &CacheHead<D>) -> CacheStatus {
        let now = Utc::now();
        let mut state = head.state.lock();

        if state.valid {
            return if state.negative || state.expiry <= now {
                CacheStatus::Negative
            } else {
                CacheStatus::Ready
            };
        }
        if state.pending {
            return CacheStatus::Pending;
        }

        let Some(line) = self.detail.encode_request(&head.key, &head.meta) else {
            return CacheStatus::Unavailable;
        };
        if !self.channel.send(line) {
            warn!(cache = self.name(), "no helper is listening for upcalls");
            return CacheStatus::Unavailable;
        }
        state.pending = true;
        metrics::counter!("lgss_cache_upcalls_total", "cache" => self.name()).increment(1);
        debug!(cache = self.name(), key = ?head.key, "upcall sent");
        CacheStatus::Pending
    }

    /// Waits until `head` changes or `timeout` passes. Returns false on timeout.
    pub async fn wait(&self, head: &CacheHead<D>, timeout: Duration) -> bool {
        let notified = head.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let state = head.state.lock();
            if state.valid || !state.pending {
                return true;
            }
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    /// Removes every entry expired at `now`. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = Vec::new();
        {
            let mut table = self.table.write();
            table.retain(|_, head| {
                if head.is_expired(now) {
                    evicted.push(head.clone());
                    false
                } else {
                    true
                }
            });
        }

        for head in &evicted {
            head.changed.notify_waiters();
            debug!(cache = self.name(), key = ?head.key, "entry evicted");
        }
        if !evicted.is_empty() {
            metrics::counter!("lgss_cache_evictions_total", "cache" => self.name())
                .increment(evicted.len() as u64);
        }
        evicted.len()
    }

    /// Drops every entry.
    pub fn purge(&self) -> usize {
        let drained: Vec<_> = self.table.write().drain().map(|(_, head)| head).collect();
        for head in &drained {
            head.changed.notify_waiters();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl CacheDetail for Echo {
        type Key = String;
        type Meta = ();
        type Value = u32;

        fn name(&self) -> &'static str {
            "echo"
        }

        fn encode_request(&self, key: &String, _meta: &()) -> Option<String> {
            Some(format!("{}\n", key))
        }
    }

    fn cache() -> UpcallCache<Echo> {
        UpcallCache::new(Echo, Duration::from_secs(120))
    }

    #[test]
    fn test_lookup_converges_on_one_entry() {
        let cache = cache();
        let a = cache.lookup("k".to_string(), ());
        let b = cache.lookup("k".to_string(), ());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_check_without_listener_is_unavailable() {
        let cache = cache();
        let head = cache.lookup("k".to_string(), ());
        assert_eq!(cache.check(&head), CacheStatus::Unavailable);
        assert!(!head.is_pending());
    }

    #[test]
    fn test_upcall_sent_once() {
        let cache = cache();
        let mut rx = cache.channel().open();
        let head = cache.lookup("k".to_string(), ());
        assert_eq!(cache.check(&head), CacheStatus::Pending);
        assert_eq!(cache.check(&head), CacheStatus::Pending);
        assert_eq!(rx.try_recv().unwrap(), "k\n");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_update_fills_pending_entry_in_place() {
        let cache = cache();
        let _rx = cache.channel().open();
        let head = cache.lookup("k".to_string(), ());
        cache.check(&head);

        let expiry = Utc::now() + chrono::Duration::hours(1);
        let updated = cache.update("k".to_string(), (), Some(7), expiry);
        assert!(Arc::ptr_eq(&head, &updated));
        assert_eq!(head.value(), Some(&7));
        assert_eq!(cache.check(&head), CacheStatus::Ready);
    }

    #[test]
    fn test_update_replaces_valid_entry() {
        let cache = cache();
        let expiry = Utc::now() + chrono::Duration::hours(1);
        let first = cache.update("k".to_string(), (), Some(1), expiry);
        let second = cache.update("k".to_string(), (), Some(2), expiry);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.value(), Some(&1));
        assert!(first.is_expired(Utc::now()));
        assert_eq!(cache.find(&"k".to_string()).unwrap().value(), Some(&2));
    }

    #[test]
    fn test_fill_pending_only_once() {
        let cache = cache();
        let _rx = cache.channel().open();
        let expiry = Utc::now() + chrono::Duration::hours(1);
        assert!(cache.fill_pending(&"k".to_string(), Some(1), expiry).is_none());

        let head = cache.lookup("k".to_string(), ());
        assert!(cache.fill_pending(&"k".to_string(), Some(1), expiry).is_none());
        cache.check(&head);

        let filled = cache.fill_pending(&"k".to_string(), Some(2), expiry).unwrap();
        assert!(Arc::ptr_eq(&head, &filled));
        assert!(cache.fill_pending(&"k".to_string(), Some(3), expiry).is_none());
        assert_eq!(head.value(), Some(&2));
        assert!(!head.is_expired(Utc::now()));
    }

    #[test]
    fn test_negative_entry_has_no_value() {
        let cache = cache();
        let expiry = Utc::now() + chrono::Duration::hours(1);
        let head = cache.update("k".to_string(), (), None, expiry);
        assert_eq!(head.value(), None);
        assert_eq!(cache.check(&head), CacheStatus::Negative);
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let cache = cache();
        cache.lookup("stale".to_string(), ());
        cache.update(
            "fresh".to_string(),
            (),
            Some(1),
            Utc::now() + chrono::Duration::days(1),
        );

        assert_eq!(cache.sweep(Utc::now()), 0);
        assert_eq!(cache.sweep(Utc::now() + chrono::Duration::seconds(121)), 1);
        assert!(cache.find(&"stale".to_string()).is_none());
        assert!(cache.find(&"fresh".to_string()).is_some());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_update() {
        let cache = Arc::new(cache());
        let _rx = cache.channel().open();
        let head = cache.lookup("k".to_string(), ());
        assert_eq!(cache.check(&head), CacheStatus::Pending);

        let filler = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            filler.update(
                "k".to_string(),
                (),
                Some(9),
                Utc::now() + chrono::Duration::hours(1),
            );
        });

        assert!(cache.wait(&head, Duration::from_secs(5)).await);
        assert_eq!(head.value(), Some(&9));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let cache = cache();
        let _rx = cache.channel().open();
        let head = cache.lookup("k".to_string(), ());
        cache.check(&head);
        assert!(!cache.wait(&head, Duration::from_millis(20)).await);
    }
}
