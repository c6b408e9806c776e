// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Client Security Context
//!
//! A negotiated session for one (security domain, user) pair, as seen by the
//! RPC client.
//!
//! ## Lifecycle
//!
//! ```text
//! created (no status bits, upcall timer armed)
//!   ├─ helper update succeeds  → UPTODATE
//!   ├─ helper update fails     → DEAD | ERROR
//!   └─ upcall timer fires      → DEAD
//! UPTODATE
//!   └─ expiry passes / die / flush → DEAD (UPTODATE cleared unless early-expire or grace)
//! ```
//!
//! ## Invariants
//!
//! - A context is never refreshed twice: once any status bit is set, later
//!   helper updates are ignored.
//! - While bound, the slot's payload points back at exactly this context
//!   (see [`crate::domain::slot::Binding`]).
//! - The context is destroyed exactly once, after it is unlisted, unbound and
//!   its last reference is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::domain::credentials::UserCred;
use crate::domain::errors::GssError;
use crate::domain::handle::RawHandle;
use crate::domain::mechanism::MechContext;
use crate::domain::slot::{Binding, Slot, SlotPayload};

/// Context state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CtxFlags(u32);

impl CtxFlags {
    pub const UPTODATE: u32 = 1 << 0;
    pub const DEAD: u32 = 1 << 1;
    pub const ERROR: u32 = 1 << 2;
    /// Listed in its security domain.
    pub const CACHED: u32 = 1 << 3;

    pub const STATUS_MASK: u32 = Self::UPTODATE | Self::DEAD | Self::ERROR;

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn status(&self) -> u32 {
        self.0 & Self::STATUS_MASK
    }
}

impl fmt::Display for CtxFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::UPTODATE, "uptodate"),
            (Self::DEAD, "dead"),
            (Self::ERROR, "error"),
            (Self::CACHED, "cached"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("new")
        } else {
            f.write_str(&set.join(","))
        }
    }
}

/// Callbacks from the capability store back into the security domain that
/// owns a context.
pub trait SecOps: Send + Sync {
    /// Completes a pending upcall with the helper's downcall. Runs with the
    /// slot lock held; `payload` is the locked payload of `slot`.
    fn complete_upcall(
        &self,
        slot: &Slot,
        payload: &mut SlotPayload,
        ctx: &Arc<ClientContext>,
        data: &[u8],
    ) -> Result<(), GssError>;
}

/// Fields that change together during refresh and reverse installation.
struct ContextState {
    expire: Option<DateTime<Utc>>,
    early_expire: bool,
    handle: RawHandle,
    svc_handle: RawHandle,
    win: u32,
    mech: Option<Box<dyn MechContext>>,
}

pub struct ClientContext {
    id: u64,
    sec_id: u32,
    cred: UserCred,
    reverse: bool,
    sec: Weak<dyn SecOps>,
    refcount: AtomicUsize,
    flags: AtomicU32,
    seq: AtomicU32,
    state: Mutex<ContextState>,
    binding: Mutex<Option<Binding>>,
    timer: Mutex<Option<AbortHandle>>,
    refreshed: Notify,
    destroyed: AtomicBool,
}

impl ClientContext {
    /// A new context holds no references; the creator takes the first one.
    pub(crate) fn new(
        id: u64,
        sec_id: u32,
        cred: UserCred,
        reverse: bool,
        sec: Weak<dyn SecOps>,
        expire: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            sec_id,
            cred,
            reverse,
            sec,
            refcount: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            seq: AtomicU32::new(0),
            state: Mutex::new(ContextState {
                expire,
                early_expire: false,
                handle: RawHandle::empty(),
                svc_handle: RawHandle::empty(),
                win: 0,
                mech: None,
            }),
            binding: Mutex::new(None),
            timer: Mutex::new(None),
            refreshed: Notify::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sec_id(&self) -> u32 {
        self.sec_id
    }

    pub fn cred(&self) -> UserCred {
        self.cred
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    pub(crate) fn sec(&self) -> Option<Arc<dyn SecOps>> {
        self.sec.upgrade()
    }

    // --- references -------------------------------------------------------

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference. Returns the remaining count, or `None` when the
    /// count was already zero.
    pub(crate) fn put_ref(&self) -> Option<usize> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    /// Returns false if the context had already been destroyed.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    // --- flags ------------------------------------------------------------

    pub fn flags(&self) -> CtxFlags {
        CtxFlags(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    /// Sets `bit`; returns whether it was already set.
    pub(crate) fn test_and_set(&self, bit: u32) -> bool {
        self.flags.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Clears `bit`; returns whether it was set.
    pub(crate) fn test_and_clear(&self, bit: u32) -> bool {
        self.flags.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Established and usable.
    pub fn is_ready(&self) -> bool {
        self.flags().status() == CtxFlags::UPTODATE
    }

    /// The upcall has produced an outcome, good or bad.
    pub fn is_refreshed(&self) -> bool {
        self.flags().status() != 0
    }

    pub fn is_dead(&self) -> bool {
        self.flags().contains(CtxFlags::DEAD | CtxFlags::ERROR)
    }

    pub fn is_cached(&self) -> bool {
        self.flags().contains(CtxFlags::CACHED)
    }

    /// Marks the context dead. UPTODATE is kept for early-expired contexts
    /// so in-flight RPCs may still complete. Returns true if this call killed it.
    pub fn expire(&self) -> bool {
        if self.test_and_set(CtxFlags::DEAD) {
            return false;
        }
        if !self.state.lock().early_expire {
            self.clear_flag(CtxFlags::UPTODATE);
        }
        tracing::info!(
            uid = self.cred.uid,
            sec_id = self.sec_id,
            flags = %self.flags(),
            "context expired"
        );
        true
    }

    /// True when the context is dead or its expiry has passed (which also kills it).
    pub fn check_death(&self, now: DateTime<Utc>) -> bool {
        if self.is_dead() {
            return true;
        }
        match self.expiry() {
            Some(expire) if now > expire => {
                self.expire();
                true
            }
            _ => false,
        }
    }

    // --- negotiated state -------------------------------------------------

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expire
    }

    pub fn is_early_expire(&self) -> bool {
        self.state.lock().early_expire
    }

    /// Pulls the expiry in to `deadline` if it is later, flagging early expiry.
    pub(crate) fn shorten_expiry(&self, deadline: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match state.expire {
            Some(expire) if expire <= deadline => false,
            _ => {
                state.expire = Some(deadline);
                state.early_expire = true;
                true
            }
        }
    }

    pub fn handle(&self) -> RawHandle {
        self.state.lock().handle.clone()
    }

    pub fn svc_handle(&self) -> RawHandle {
        self.state.lock().svc_handle.clone()
    }

    pub(crate) fn set_svc_handle(&self, handle: RawHandle) {
        self.state.lock().svc_handle = handle;
    }

    pub fn window(&self) -> u32 {
        self.state.lock().win
    }

    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Sequence number for the next outgoing RPC.
    pub fn next_sequence(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn set_sequence(&self, seq: u32) {
        self.seq.store(seq, Ordering::Release);
    }

    /// Exported mechanism context, if negotiated.
    pub fn mech_export(&self) -> Option<Vec<u8>> {
        self.state.lock().mech.as_ref().map(|mech| mech.export())
    }

    pub fn mech_description(&self) -> Option<String> {
        self.state.lock().mech.as_ref().map(|mech| mech.describe())
    }

    /// Applies negotiated state. UPTODATE is set separately by the caller.
    pub(crate) fn establish(
        &self,
        win: u32,
        handle: RawHandle,
        mech: Box<dyn MechContext>,
        expire: DateTime<Utc>,
    ) {
        let mut state = self.state.lock();
        state.win = win;
        state.handle = handle;
        state.mech = Some(mech);
        state.expire = Some(expire);
    }

    /// Runs `f` against the mechanism context while holding the state lock.
    pub(crate) fn with_mech<T>(&self, f: impl FnOnce(&dyn MechContext) -> T) -> Option<T> {
        let state = self.state.lock();
        state.mech.as_deref().map(f)
    }

    pub(crate) fn drop_mech(&self) {
        self.state.lock().mech = None;
    }

    // --- waiters ----------------------------------------------------------

    pub(crate) fn wakeup(&self) {
        self.refreshed.notify_waiters();
    }

    /// Waits until the upcall for this context has an outcome, up to `timeout`.
    pub async fn wait_refreshed(&self, timeout: Duration) -> bool {
        let notified = self.refreshed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_refreshed() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.is_refreshed()
    }

    // --- upcall timer -----------------------------------------------------

    pub(crate) fn arm_timer(&self, handle: AbortHandle) {
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancels the upcall timer. Safe to call any number of times.
    pub(crate) fn clear_timer(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.lock().is_some()
    }

    // --- slot binding -----------------------------------------------------

    pub fn bound_slot(&self) -> Option<Arc<Slot>> {
        self.binding.lock().as_ref().map(|binding| binding.slot().clone())
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }

    pub(crate) fn attach_binding(&self, binding: Binding) {
        *self.binding.lock() = Some(binding);
    }

    pub(crate) fn detach_binding(&self) -> Option<Binding> {
        self.binding.lock().take()
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("id", &self.id)
            .field("sec_id", &self.sec_id)
            .field("uid", &self.cred.uid)
            .field("refcount", &self.refcount())
            .field("flags", &self.flags().to_string())
            .finish()
    }
}

/// Listing entry for one cached context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub uid: u32,
    pub refcount: usize,
    pub expire: Option<DateTime<Utc>>,
    pub remaining_secs: i64,
    pub flags: String,
    pub seq: u32,
    pub win: u32,
    pub slot_serial: Option<u32>,
    pub handle: String,
    pub svc_handle: String,
    pub mech: Option<String>,
}

impl ContextSummary {
    pub fn of(ctx: &ClientContext, now: DateTime<Utc>) -> Self {
        let expire = ctx.expiry();
        Self {
            uid: ctx.cred().uid,
            refcount: ctx.refcount(),
            expire,
            remaining_secs: expire.map(|e| (e - now).num_seconds()).unwrap_or(0),
            flags: ctx.flags().to_string(),
            seq: ctx.sequence(),
            win: ctx.window(),
            slot_serial: ctx.bound_slot().map(|slot| slot.serial()),
            handle: ctx.handle().to_string(),
            svc_handle: ctx.svc_handle().to_string(),
            mech: ctx.mech_description(),
        }
    }
}
