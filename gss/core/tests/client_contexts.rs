// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end behaviour of client security domains against an in-process
//! keyring and a recording helper launcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;

use lgss_core::application::client_manager::{ClientContextManager, SecDescriptor};
use lgss_core::application::downcall::Downcall;
use lgss_core::application::keyring_type::GssKeyType;
use lgss_core::domain::config::ClientConfig;
use lgss_core::domain::credentials::{ImportInfo, SecPart, ServiceLevel, UserCred};
use lgss_core::domain::handle::RawHandle;
use lgss_core::domain::errors::GssError;
use lgss_core::domain::slot::{Delivery, KeyUpcall, SecureSlotStore, Slot};
use lgss_core::infrastructure::keyring::{ChannelLauncher, KeyringStore};
use lgss_core::infrastructure::null_mech::{NullMechanism, NullToken};

struct Domain {
    manager: Arc<ClientContextManager>,
    store: Arc<KeyringStore>,
    upcalls: UnboundedReceiver<KeyUpcall>,
}

fn descriptor() -> SecDescriptor {
    SecDescriptor {
        sec_id: 7,
        part: SecPart::Cli,
        service: ServiceLevel::Integrity,
        import: ImportInfo {
            obd_name: "fsX-OST0003-osc-0001".to_string(),
            obd_type: "osc".to_string(),
            peer_nid: 0x2000_0000_0a00_0003,
            self_nid: 0x2000_0000_0a00_0001,
            refpid: 1,
            target_part: SecPart::Ost,
        },
        reverse: false,
        root_only: false,
    }
}

fn domain(config: ClientConfig) -> Domain {
    let (launcher, upcalls) = ChannelLauncher::new();
    let store = Arc::new(KeyringStore::with_launcher(
        Arc::new(GssKeyType),
        Arc::new(launcher),
    ));
    let manager = ClientContextManager::new(
        descriptor(),
        Arc::new(NullMechanism),
        store.clone(),
        config,
        None,
    );
    Domain {
        manager,
        store,
        upcalls,
    }
}

fn established(win: u32) -> Vec<u8> {
    Downcall::Established {
        win,
        handle: RawHandle::from_index(0x5151),
        mech_token: NullToken::new(Utc::now() + chrono::Duration::hours(2), b"session".to_vec())
            .encode(),
    }
    .encode()
}

fn answer(store: &KeyringStore, serial: u32, payload: &[u8]) {
    store.deliver(serial, Delivery::Instantiate(&[])).unwrap();
    store.deliver(serial, Delivery::Update(payload)).unwrap();
}

#[tokio::test]
async fn test_user_context_established_and_reused() {
    let mut d = domain(ClientConfig::default());
    let cred = UserCred::new(1000, 1000);

    let ctx = d.manager.lookup_ctx(cred, true).unwrap();
    assert!(!ctx.is_refreshed());
    let upcall = d.upcalls.try_recv().unwrap();
    assert_eq!(upcall.description, "1000@7");

    answer(&d.store, upcall.serial, &established(128));
    assert!(d.manager.wait_refreshed(&ctx, Duration::from_secs(1)).await);
    assert!(ctx.is_ready());
    assert_eq!(ctx.window(), 128);
    assert!(!d.manager.validate_ctx(&ctx));

    let again = d.manager.lookup_ctx(cred, true).unwrap();
    assert!(Arc::ptr_eq(&ctx, &again));
    assert!(d.upcalls.try_recv().is_err());
    assert_eq!(d.manager.nctx(), 1);

    assert!(!d.manager.release_ctx(&again, true));
    assert!(!d.manager.release_ctx(&ctx, true));
    d.manager.verify_bindings().unwrap();
}

#[tokio::test]
async fn test_busy_contexts_survive_graceful_flush() {
    let mut d = domain(ClientConfig::default());
    let contexts: Vec<_> = (1..=3)
        .map(|uid| d.manager.lookup_ctx(UserCred::new(uid, uid), true).unwrap())
        .collect();
    for _ in 0..3 {
        let upcall = d.upcalls.try_recv().unwrap();
        answer(&d.store, upcall.serial, &established(64));
    }

    let report = d.manager.flush_ctx_cache(None, true, false);
    assert_eq!(report.flushed, 0);
    assert_eq!(report.busy, 3);
    assert_eq!(d.manager.cached_contexts().len(), 3);

    let report = d.manager.flush_ctx_cache(None, false, true);
    assert_eq!(report.flushed, 3);
    assert_eq!(report.busy, 3);
    assert!(d.manager.cached_contexts().is_empty());
    assert_eq!(d.store.live_slots(), 0);

    for ctx in &contexts {
        assert!(!ctx.is_cached());
        assert!(!ctx.is_bound());
        assert!(!ctx.is_ready());
        assert!(d.manager.validate_ctx(ctx));
    }

    // the flush queued nothing; the callers hold the last references
    assert_eq!(d.manager.reap_released(), 0);
    for ctx in &contexts {
        assert!(d.manager.release_ctx(ctx, true));
        assert!(ctx.is_destroyed());
    }
    assert_eq!(d.manager.nctx(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_share_one_negotiation() {
    let mut d = domain(ClientConfig::default());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = d.manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.lookup_ctx(UserCred::new(500, 500), true).unwrap()
        }));
    }
    let mut found = Vec::new();
    for task in tasks {
        found.push(task.await.unwrap());
    }

    assert!(found.iter().all(|ctx| Arc::ptr_eq(ctx, &found[0])));
    assert!(d.upcalls.try_recv().is_ok());
    assert!(d.upcalls.try_recv().is_err());
    assert_eq!(d.manager.nctx(), 1);
    // every caller plus the list and the slot
    assert_eq!(found[0].refcount(), 16 + 2);
    d.manager.verify_bindings().unwrap();
}

#[tokio::test]
async fn test_release_is_exactly_once() {
    let mut d = domain(ClientConfig::default());
    let ctx = d.manager.lookup_ctx(UserCred::new(42, 42), true).unwrap();
    d.upcalls.try_recv().unwrap();

    d.manager.die_ctx(&ctx, false);
    assert_eq!(ctx.refcount(), 1);
    assert!(d.manager.release_ctx(&ctx, true));
    assert!(ctx.is_destroyed());
    assert!(!d.manager.release_ctx(&ctx, true));
    assert_eq!(d.manager.nctx(), 0);
}

/// Counts revocations and unlinks passing through to the real store.
struct CountingStore {
    inner: KeyringStore,
    revoked: AtomicUsize,
    unlinked: AtomicUsize,
}

impl SecureSlotStore for CountingStore {
    fn request(&self, description: &str, callout: Option<&str>) -> Result<Arc<Slot>, GssError> {
        self.inner.request(description, callout)
    }

    fn slot(&self, serial: u32) -> Option<Arc<Slot>> {
        self.inner.slot(serial)
    }

    fn deliver(&self, serial: u32, delivery: Delivery<'_>) -> Result<(), GssError> {
        self.inner.deliver(serial, delivery)
    }

    fn revoke(&self, slot: &Slot) {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        self.inner.revoke(slot)
    }

    fn unlink(&self, slot: &Slot) {
        self.unlinked.fetch_add(1, Ordering::SeqCst);
        self.inner.unlink(slot)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_release_tears_down_once() {
    let (launcher, mut upcalls) = ChannelLauncher::new();
    let store = Arc::new(CountingStore {
        inner: KeyringStore::with_launcher(Arc::new(GssKeyType), Arc::new(launcher)),
        revoked: AtomicUsize::new(0),
        unlinked: AtomicUsize::new(0),
    });
    let manager = ClientContextManager::new(
        descriptor(),
        Arc::new(NullMechanism),
        store.clone(),
        ClientConfig::default(),
        None,
    );

    const CALLERS: usize = 8;
    let cred = UserCred::new(600, 600);
    let held: Vec<_> = (0..CALLERS)
        .map(|_| manager.lookup_ctx(cred, true).unwrap())
        .collect();
    let serial = upcalls.try_recv().unwrap().serial;
    store
        .deliver(serial, Delivery::Instantiate(&[]))
        .unwrap();
    store
        .deliver(serial, Delivery::Update(&established(64)))
        .unwrap();
    let ctx = held[0].clone();
    assert_eq!(ctx.refcount(), CALLERS + 2);

    let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));
    let mut tasks = Vec::new();
    for (i, mine) in held.into_iter().enumerate() {
        let manager = manager.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            if i % 2 == 0 {
                manager.die_ctx(&mine, false);
            }
            manager.release_ctx(&mine, false)
        }));
    }
    let mut last = 0;
    for task in tasks {
        if task.await.unwrap() {
            last += 1;
        }
    }

    assert_eq!(last, 1);
    assert!(!ctx.is_cached());
    assert!(!ctx.is_bound());
    assert!(manager.cached_contexts().is_empty());
    assert_eq!(store.revoked.load(Ordering::SeqCst), 1);
    assert_eq!(store.unlinked.load(Ordering::SeqCst), 1);
    assert!(!ctx.is_destroyed());

    assert_eq!(manager.reap_released(), 1);
    assert!(ctx.is_destroyed());
    assert_eq!(manager.reap_released(), 0);
    assert_eq!(manager.nctx(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_configured_helper_establishes_context() {
    let script = format!(
        "echo instantiate; echo update {}",
        hex::encode(established(96))
    );
    let config = ClientConfig {
        helper_path: "sh".into(),
        helper_args: vec!["-c".to_string(), script, "lgss-helper".to_string()],
        helper_retry_interval_ms: 10,
        ..ClientConfig::default()
    };
    let store = KeyringStore::with_helper(Arc::new(GssKeyType), &config);
    let manager = ClientContextManager::new(
        descriptor(),
        Arc::new(NullMechanism),
        store.clone(),
        config,
        None,
    );

    let ctx = manager.lookup_ctx(UserCred::new(1200, 1200), true).unwrap();
    assert!(manager.wait_refreshed(&ctx, Duration::from_secs(5)).await);
    assert!(ctx.is_ready());
    assert_eq!(ctx.window(), 96);
    assert!(!manager.validate_ctx(&ctx));
    manager.verify_bindings().unwrap();
}

#[tokio::test]
async fn test_bindings_stay_consistent_across_churn() {
    let mut d = domain(ClientConfig::default());
    let mut held = Vec::new();
    for uid in 10..20 {
        held.push(d.manager.lookup_ctx(UserCred::new(uid, uid), true).unwrap());
    }
    while let Ok(upcall) = d.upcalls.try_recv() {
        answer(&d.store, upcall.serial, &established(32));
    }
    d.manager.verify_bindings().unwrap();

    d.manager.flush_ctx_cache(Some(12), false, false);
    d.manager.die_ctx(&held[5], true);
    d.manager.verify_bindings().unwrap();

    for ctx in &held {
        if let Some(slot) = ctx.bound_slot() {
            let payload = slot.lock();
            assert!(Arc::ptr_eq(payload.as_ref().unwrap(), ctx));
        }
    }
    assert_eq!(d.manager.cached_contexts().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_upcall_times_out() {
    let config = ClientConfig {
        upcall_timeout_secs: 5,
        ..ClientConfig::default()
    };
    let mut d = domain(config);
    let ctx = d.manager.lookup_ctx(UserCred::new(77, 77), true).unwrap();
    let upcall = d.upcalls.try_recv().unwrap();
    let slot = ctx.bound_slot().unwrap();

    assert!(!d.manager.wait_refreshed(&ctx, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;

    assert!(ctx.is_dead());
    assert!(!ctx.has_timer());
    assert!(slot.is_revoked());
    assert!(d.manager.validate_ctx(&ctx));
    assert!(!ctx.is_cached());

    // a late answer finds nothing to deliver to
    assert!(d
        .store
        .deliver(upcall.serial, Delivery::Instantiate(&[]))
        .is_err());
}
