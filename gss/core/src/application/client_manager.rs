// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Client Context Manager
//!
//! One manager per security domain. Contexts live in capability slots keyed
//! by `"{uid}@{sec_id:x}"`; the first lookup for a user creates the slot,
//! binds a fresh context to it and lets the privileged helper negotiate. The
//! helper's answer arrives through [`SecOps::complete_upcall`].
//!
//! ## Reference accounting
//!
//! A freshly created context holds three references: the caller's, the
//! list's and the slot's. Anything above two on a listed context means an
//! RPC is using it. Reverse contexts are never bound, so they carry the list
//! reference only.
//!
//! ## Locking
//!
//! Slot lock, then the domain's list lock. The list lock is never held while
//! a slot lock is taken; code that starts from a context unlists first and
//! then locks the slot to unbind.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::application::binding;
use crate::application::downcall::{is_restart, Downcall};
use crate::domain::client_context::{ClientContext, ContextSummary, CtxFlags, SecOps};
use crate::domain::clock;
use crate::domain::config::ClientConfig;
use crate::domain::credentials::{ImportInfo, SecPart, ServiceLevel, UserCred};
use crate::domain::errors::GssError;
use crate::domain::handle::ContextIndex;
use crate::domain::mechanism::Mechanism;
use crate::domain::sequence_window::GSS_SEQ_WIN;
use crate::domain::slot::{SecureSlotStore, Slot, SlotPayload};
use crate::infrastructure::context_cache::{ContextCache, SvcContextRef};

/// Static description of a security domain.
#[derive(Debug, Clone)]
pub struct SecDescriptor {
    pub sec_id: u32,
    /// Local role.
    pub part: SecPart,
    pub service: ServiceLevel,
    pub import: ImportInfo,
    /// Serves callbacks from a peer over a context it established with us.
    pub reverse: bool,
    /// Every user shares the root context.
    pub root_only: bool,
}

/// Server-side caches a forward domain installs reverse entries into.
#[derive(Clone)]
pub struct ServerLink {
    pub contexts: Arc<ContextCache>,
    pub index: Arc<ContextIndex>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    /// Contexts found in use; skipped unless the flush was forced.
    pub busy: usize,
}

#[derive(Default)]
struct SecState {
    contexts: Vec<Arc<ClientContext>>,
    /// Also listed in `contexts`; holds no reference of its own.
    root: Option<Arc<ClientContext>>,
}

pub struct ClientContextManager {
    this: Weak<ClientContextManager>,
    desc: SecDescriptor,
    mech: Arc<dyn Mechanism>,
    config: ClientConfig,
    store: Arc<dyn SecureSlotStore>,
    svc_cache: Option<Arc<ContextCache>>,
    ctx_index: Arc<ContextIndex>,
    state: Mutex<SecState>,
    root_upcall: Mutex<()>,
    rvs_hdl: AtomicU64,
    next_ctx_id: AtomicU64,
    nctx: AtomicUsize,
    released: Mutex<Vec<Arc<ClientContext>>>,
}

impl ClientContextManager {
    pub fn new(
        desc: SecDescriptor,
        mech: Arc<dyn Mechanism>,
        store: Arc<dyn SecureSlotStore>,
        config: ClientConfig,
        server: Option<ServerLink>,
    ) -> Arc<Self> {
        let (svc_cache, ctx_index) = match server {
            Some(link) => (Some(link.contexts), link.index),
            None => (None, Arc::new(ContextIndex::new())),
        };
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            desc,
            mech,
            config,
            store,
            svc_cache,
            ctx_index,
            state: Mutex::new(SecState::default()),
            root_upcall: Mutex::new(()),
            rvs_hdl: AtomicU64::new(0),
            next_ctx_id: AtomicU64::new(1),
            nctx: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        })
    }

    pub fn descriptor(&self) -> &SecDescriptor {
        &self.desc
    }

    /// Contexts alive (created and not yet destroyed).
    pub fn nctx(&self) -> usize {
        self.nctx.load(Ordering::Acquire)
    }

    /// Index under which the next reverse server entry is installed.
    pub fn reverse_handle_index(&self) -> u64 {
        self.rvs_hdl.load(Ordering::Acquire)
    }

    pub fn cached_contexts(&self) -> Vec<Arc<ClientContext>> {
        self.state.lock().contexts.clone()
    }

    pub fn root_context(&self) -> Option<Arc<ClientContext>> {
        self.state.lock().root.clone()
    }

    fn slot_description(&self, uid: u32) -> String {
        format!("{}@{:x}", uid, self.desc.sec_id)
    }

    fn is_root_user(&self, cred: UserCred) -> bool {
        self.desc.root_only || cred.is_root()
    }

    // --- lookup -----------------------------------------------------------

    /// Returns the context for `cred`, starting a negotiation when none
    /// exists. The caller owns one reference and must release it.
    pub fn lookup_ctx(&self, cred: UserCred, create: bool) -> Result<Arc<ClientContext>, GssError> {
        let is_root = self.is_root_user(cred);

        if is_root {
            if let Some(ctx) = self.lookup_root() {
                return Ok(ctx);
            }
            // reverse domains only ever get contexts installed from the server side
            if self.desc.reverse {
                return Err(GssError::NoContext);
            }
        }
        if !create {
            return Err(GssError::NoContext);
        }

        let _root_guard = is_root.then(|| self.root_upcall.lock());
        let (part_flags, svc_flag) = if is_root {
            if let Some(ctx) = self.lookup_root() {
                return Ok(ctx);
            }
            self.rvs_hdl.store(self.ctx_index.next(), Ordering::Release);
            (self.desc.part.upcall_flags()?, self.desc.service.flag())
        } else {
            ("", '-')
        };

        let import = &self.desc.import;
        import.obd_type().inspect_err(|_| {
            error!(obd = %import.obd_name, "device is not supported");
        })?;

        let description = self.slot_description(cred.uid);
        let pid = if !self.config.check_upcall_ns {
            0
        } else if is_root {
            import.refpid
        } else {
            std::process::id()
        };
        let callout = format!(
            "{}:{}:{}:{}:{}:{}:{}:{:#x}:{}:{:#x}:{}",
            self.desc.sec_id,
            self.mech.name(),
            cred.uid,
            cred.gid,
            part_flags,
            svc_flag,
            import.target_part.service() as u32,
            import.peer_nid,
            import.obd_name,
            import.self_nid,
            pid
        );

        debug!(description = %description, "requesting slot");
        let slot = self
            .store
            .request(&description, Some(&callout))
            .map_err(|e| {
                error!(description = %description, "failed to request slot: {}", e);
                GssError::UpcallFailure(e.to_string())
            })?;

        let (ctx, created) = {
            let mut payload = slot.lock();
            match payload.as_ref() {
                // dead contexts are returned too; validation replaces them
                Some(ctx) => {
                    ctx.get();
                    (ctx.clone(), false)
                }
                None => {
                    let ctx = self.create_ctx(cred);
                    self.enlist(&ctx, is_root);
                    binding::bind(&slot, &mut payload, &ctx);
                    self.arm_upcall_timer(&ctx);
                    (ctx, true)
                }
            }
        };

        if created {
            metrics::counter!("lgss_client_upcalls_total").increment(1);
            if is_root {
                self.store.unlink(&slot);
            }
        }
        Ok(ctx)
    }

    fn lookup_root(&self) -> Option<Arc<ClientContext>> {
        let mut state = self.state.lock();
        if state.root.is_none() && self.desc.reverse {
            // prefer the context most likely to have an established peer
            let shortest = state
                .contexts
                .iter()
                .min_by_key(|ctx| ctx.expiry().unwrap_or(chrono::DateTime::<Utc>::MAX_UTC))
                .cloned();
            state.root = shortest;
        }
        let ctx = state.root.clone()?;
        ctx.get();
        Some(ctx)
    }

    fn create_ctx(&self, cred: UserCred) -> Arc<ClientContext> {
        let sec: Weak<dyn SecOps> = self.this.clone();
        let expire = clock::deadline(Utc::now(), self.config.upcall_timeout());
        let ctx = Arc::new(ClientContext::new(
            self.next_ctx_id.fetch_add(1, Ordering::Relaxed),
            self.desc.sec_id,
            cred,
            self.desc.reverse,
            sec,
            Some(expire),
        ));
        ctx.get();
        self.nctx.fetch_add(1, Ordering::AcqRel);
        metrics::counter!("lgss_client_contexts_created_total").increment(1);
        debug!(ctx = ctx.id(), uid = cred.uid, sec_id = self.desc.sec_id, "context created");
        ctx
    }

    fn arm_upcall_timer(&self, ctx: &Arc<ClientContext>) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(ctx = ctx.id(), "no runtime, upcall timer not armed");
            return;
        };
        let timeout = self.config.upcall_timeout();
        let weak_ctx = Arc::downgrade(ctx);
        let weak_sec = self.this.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let (Some(ctx), Some(sec)) = (weak_ctx.upgrade(), weak_sec.upgrade()) {
                sec.upcall_timed_out(&ctx, timeout);
            }
        });
        ctx.arm_timer(task.abort_handle());
        debug!(ctx = ctx.id(), ?timeout, "upcall timer started");
    }

    fn upcall_timed_out(&self, ctx: &Arc<ClientContext>, timeout: Duration) {
        warn!(
            ctx = ctx.id(),
            uid = ctx.cred().uid,
            "{}",
            GssError::UpcallTimeout(timeout)
        );
        ctx.expire();
        if let Some(slot) = ctx.bound_slot() {
            self.store.revoke(&slot);
        }
        ctx.wakeup();
        ctx.clear_timer();
    }

    // --- list membership ----------------------------------------------------

    fn enlist(&self, ctx: &Arc<ClientContext>, is_root: bool) {
        let mut state = self.state.lock();
        Self::enlist_locked(&mut state, ctx, is_root);
    }

    fn enlist_locked(state: &mut SecState, ctx: &Arc<ClientContext>, is_root: bool) {
        debug_assert!(!ctx.is_cached(), "context listed twice");
        ctx.get();
        ctx.set_flag(CtxFlags::CACHED);
        state.contexts.push(ctx.clone());
        if is_root {
            state.root = Some(ctx.clone());
        }
    }

    /// Returns false when someone else already unlisted `ctx`.
    fn unlist(&self, ctx: &Arc<ClientContext>) -> bool {
        let mut state = self.state.lock();
        self.unlist_locked(&mut state, ctx)
    }

    fn unlist_locked(&self, state: &mut SecState, ctx: &Arc<ClientContext>) -> bool {
        if !ctx.test_and_clear(CtxFlags::CACHED) {
            return false;
        }
        if state.root.as_ref().is_some_and(|root| Arc::ptr_eq(root, ctx)) {
            state.root = None;
        }
        state.contexts.retain(|listed| !Arc::ptr_eq(listed, ctx));
        self.put(ctx, false);
        true
    }

    // --- binding ------------------------------------------------------------

    /// Unbinds `ctx` from its slot, starting from the context side.
    fn unbind_ctx(&self, ctx: &Arc<ClientContext>) {
        let Some(slot) = ctx.bound_slot() else {
            return;
        };
        let unbound = {
            let mut payload = slot.lock();
            binding::unbind(self.store.as_ref(), &slot, &mut payload, ctx)
        };
        if unbound {
            self.store.unlink(&slot);
            self.put(ctx, true);
        }
    }

    fn kill_ctx(&self, ctx: &Arc<ClientContext>) {
        if self.unlist(ctx) {
            self.unbind_ctx(ctx);
        }
    }

    /// Unlists and unbinds the slot's context. Runs with the slot lock held.
    fn kill_slot_locked(&self, slot: &Slot, payload: &mut SlotPayload) {
        let Some(ctx) = payload.clone() else {
            return;
        };
        if self.unlist(&ctx) && binding::unbind(self.store.as_ref(), slot, payload, &ctx) {
            self.put(&ctx, true);
        }
    }

    /// Checks that every listed, bound context agrees with its slot.
    pub fn verify_bindings(&self) -> Result<(), String> {
        for ctx in self.cached_contexts() {
            binding::verify(&ctx)?;
        }
        Ok(())
    }

    // --- release ------------------------------------------------------------

    /// Drops one reference. Returns true when it was the last one.
    fn put(&self, ctx: &Arc<ClientContext>, sync: bool) -> bool {
        match ctx.put_ref() {
            Some(0) => {
                if sync {
                    self.destroy(ctx);
                } else {
                    ctx.get();
                    self.released.lock().push(ctx.clone());
                }
                true
            }
            Some(_) => false,
            None => {
                warn!(ctx = ctx.id(), "release of context without references");
                false
            }
        }
    }

    fn destroy(&self, ctx: &Arc<ClientContext>) {
        if !ctx.mark_destroyed() {
            return;
        }
        debug_assert!(!ctx.is_cached(), "destroying a listed context");
        ctx.clear_timer();

        if !ctx.is_reverse() {
            let svc_handle = ctx.svc_handle();
            if let (false, Some(cache)) = (svc_handle.is_empty(), self.svc_cache.as_ref()) {
                // the peer's callbacks over our reverse entry have to stop soon
                cache.expire_reverse(&svc_handle);
            }
        }
        ctx.drop_mech();
        ctx.wakeup();
        self.nctx.fetch_sub(1, Ordering::AcqRel);
        metrics::counter!("lgss_client_contexts_destroyed_total").increment(1);
        debug!(ctx = ctx.id(), uid = ctx.cred().uid, "context destroyed");
    }

    /// Releases the caller's reference. With `sync` unset, a context losing
    /// its last reference is queued for the collector instead of destroyed.
    pub fn release_ctx(&self, ctx: &Arc<ClientContext>, sync: bool) -> bool {
        self.put(ctx, sync)
    }

    /// Destroys contexts queued by asynchronous releases.
    pub fn reap_released(&self) -> usize {
        let queued = std::mem::take(&mut *self.released.lock());
        let count = queued.len();
        for ctx in queued {
            self.put(&ctx, true);
        }
        count
    }

    // --- context operations -------------------------------------------------

    /// True when the context needs a refresh; dead contexts are also killed.
    pub fn validate_ctx(&self, ctx: &Arc<ClientContext>) -> bool {
        if ctx.check_death(Utc::now()) {
            self.kill_ctx(ctx);
            return true;
        }
        !ctx.is_ready()
    }

    /// Kills the context. Without `grace` it stops being usable at once,
    /// even if it was early-expired.
    pub fn die_ctx(&self, ctx: &Arc<ClientContext>, grace: bool) {
        ctx.expire();
        if !grace {
            ctx.clear_flag(CtxFlags::UPTODATE);
        }
        self.kill_ctx(ctx);
    }

    /// Propagates a reverse context's sequence to its server entry.
    pub fn refresh_ctx(&self, ctx: &ClientContext) -> bool {
        if !self.desc.reverse {
            return false;
        }
        let svc_handle = ctx.svc_handle();
        match (svc_handle.is_empty(), self.svc_cache.as_ref()) {
            (false, Some(cache)) => cache.update_sequence(&svc_handle, ctx.sequence()),
            _ => false,
        }
    }

    pub async fn wait_refreshed(&self, ctx: &ClientContext, timeout: Duration) -> bool {
        ctx.wait_refreshed(timeout).await
    }

    /// Final steps for contexts taken off the list; each carries one
    /// reference owned by the caller.
    fn dispose(&self, freelist: Vec<Arc<ClientContext>>) {
        for ctx in freelist {
            // a replacement reverse context copies this sequence right away
            self.refresh_ctx(&ctx);
            ctx.wakeup();
            self.unbind_ctx(&ctx);
            self.put(&ctx, false);
        }
    }

    /// Flushes cached contexts. `Some(uid)` other than root flushes that
    /// user's slots through the store; `None` or root walks the list.
    pub fn flush_ctx_cache(&self, uid: Option<u32>, grace: bool, force: bool) -> FlushReport {
        debug!(
            sec_id = self.desc.sec_id,
            nctx = self.nctx(),
            ?uid,
            grace,
            force,
            "flushing context cache"
        );
        match uid {
            Some(uid) if uid != 0 => self.flush_user(uid),
            _ => self.flush_list(uid, grace, force),
        }
    }

    fn flush_user(&self, uid: u32) -> FlushReport {
        let mut report = FlushReport::default();
        if self.desc.reverse || self.desc.root_only {
            return report;
        }

        let description = self.slot_description(uid);
        while let Ok(slot) = self.store.request(&description, None) {
            {
                let mut payload = slot.lock();
                if payload.is_some() {
                    report.flushed += 1;
                }
                self.kill_slot_locked(&slot, &mut payload);
                self.store.revoke(&slot);
            }
            self.store.unlink(&slot);
        }
        debug!(uid, flushed = report.flushed, "user contexts flushed");
        report
    }

    fn flush_list(&self, uid: Option<u32>, grace: bool, force: bool) -> FlushReport {
        let mut report = FlushReport::default();
        let mut freelist = Vec::new();
        {
            let mut state = self.state.lock();
            let listed = state.contexts.clone();
            for ctx in listed {
                if uid.is_some_and(|uid| uid != ctx.cred().uid) {
                    continue;
                }
                // the list and the slot hold the two base references
                let refs = ctx.refcount();
                if refs > 2 {
                    report.busy += 1;
                    if !force {
                        continue;
                    }
                    warn!(
                        ctx = ctx.id(),
                        uid = ctx.cred().uid,
                        target = %self.desc.import.obd_name,
                        "flush busy ctx (extra ref {})",
                        refs - 2
                    );
                }

                ctx.set_flag(CtxFlags::DEAD);
                if !grace {
                    ctx.clear_flag(CtxFlags::UPTODATE);
                }
                ctx.get();
                if self.unlist_locked(&mut state, &ctx) {
                    freelist.push(ctx);
                } else {
                    ctx.put_ref();
                }
            }
        }

        report.flushed = freelist.len();
        self.dispose(freelist);
        report
    }

    /// Collects contexts that are dead or expired.
    pub fn gc_ctx(&self) -> usize {
        let now = Utc::now();
        let mut freelist = Vec::new();
        {
            let mut state = self.state.lock();
            let listed = state.contexts.clone();
            for ctx in listed {
                ctx.get();
                if ctx.check_death(now) && self.unlist_locked(&mut state, &ctx) {
                    debug!(ctx = ctx.id(), "unhashed dead context");
                    freelist.push(ctx);
                } else {
                    ctx.put_ref();
                }
            }
        }
        let collected = freelist.len();
        self.dispose(freelist);
        collected
    }

    pub fn display(&self) -> Vec<ContextSummary> {
        let now = Utc::now();
        self.cached_contexts()
            .iter()
            .map(|ctx| ContextSummary::of(ctx, now))
            .collect()
    }

    /// Installs a root context copied from a server entry the peer
    /// established with us. Existing contexts keep working for a short
    /// while so in-flight callbacks can finish.
    pub fn install_reverse_ctx(&self, svc: &SvcContextRef) -> Result<(), GssError> {
        if !self.desc.reverse {
            return Err(GssError::UnsupportedService(
                "reverse contexts need a reverse security domain".to_string(),
            ));
        }

        let ctx = self.create_ctx(UserCred::ROOT);
        let mech = match svc.mech().copy_reverse() {
            Ok(mech) => mech,
            Err(e) => {
                error!(handle = %svc.handle(), "failed to copy reverse context: {}", e);
                self.put(&ctx, true);
                return Err(e.into());
            }
        };
        ctx.establish(GSS_SEQ_WIN, svc.reverse_handle(), mech, svc.expiry());
        ctx.set_svc_handle(svc.handle().clone());
        ctx.set_sequence(svc.reverse_sequence());
        ctx.set_flag(CtxFlags::UPTODATE);

        {
            let mut state = self.state.lock();
            let deadline = clock::deadline(Utc::now(), self.config.reverse_expire_nice());
            for listed in &state.contexts {
                listed.shorten_expiry(deadline);
            }
            let is_root = state.root.is_none();
            Self::enlist_locked(&mut state, &ctx, is_root);
        }
        info!(
            ctx = ctx.id(),
            handle = %ctx.handle(),
            svc_handle = %svc.handle(),
            "reverse context installed"
        );

        self.put(&ctx, true);
        Ok(())
    }

    /// Flushes everything and destroys what was queued.
    pub fn shutdown(&self) -> FlushReport {
        let report = self.flush_ctx_cache(None, false, true);
        self.reap_released();
        report
    }

    // --- upcall completion --------------------------------------------------

    fn apply_downcall(&self, ctx: &ClientContext, data: &[u8]) -> Result<(), GssError> {
        match Downcall::parse(data)? {
            Downcall::Failed { rpc_err, gss_err } => {
                error!(ctx = ctx.id(), rpc_err, gss_err = %format!("{:#x}", gss_err), "negotiation failed");
                if is_restart(rpc_err) {
                    Err(GssError::Restart)
                } else if rpc_err != 0 {
                    Err(GssError::UpcallFailure(format!("rpc error {}", rpc_err)))
                } else {
                    Err(GssError::AuthenticationFailure {
                        major: gss_err,
                        minor: 0,
                    })
                }
            }
            Downcall::Established {
                win,
                handle,
                mech_token,
            } => {
                let mech = self.mech.import(&mech_token)?;
                let expire = mech.expiry()?;
                ctx.establish(win, handle, mech, expire);
                Ok(())
            }
        }
    }

    fn ctx_uptodate(&self, ctx: &Arc<ClientContext>) {
        let now = Utc::now();
        if ctx.expiry().is_some_and(|expire| expire <= now) {
            warn!(ctx = ctx.id(), "negotiated context already expired");
            ctx.expire();
            ctx.wakeup();
            return;
        }

        // someone may have killed it meanwhile; UPTODATE still lets the
        // server side be torn down properly
        ctx.set_flag(CtxFlags::UPTODATE);
        info!(
            ctx = ctx.id(),
            uid = ctx.cred().uid,
            target = %self.desc.import.obd_name,
            expire = ?ctx.expiry(),
            "client refreshed ctx"
        );

        if ctx.cred().is_root() && !self.desc.reverse {
            if let Some(cache) = self.svc_cache.as_ref() {
                let index = self.reverse_handle_index();
                let import = &self.desc.import;
                let installed = ctx.with_mech(|mech| {
                    cache.install_reverse(index, mech, import.target_part, &import.obd_name)
                });
                match installed {
                    Some(Ok(svc)) => ctx.set_svc_handle(svc.handle().clone()),
                    Some(Err(e)) => warn!(ctx = ctx.id(), "failed to install reverse server context: {}", e),
                    None => {}
                }
            }
        }
        ctx.wakeup();
    }
}

impl SecOps for ClientContextManager {
    fn complete_upcall(
        &self,
        slot: &Slot,
        payload: &mut SlotPayload,
        ctx: &Arc<ClientContext>,
        data: &[u8],
    ) -> Result<(), GssError> {
        ctx.clear_timer();
        if ctx.is_refreshed() {
            warn!(ctx = ctx.id(), flags = %ctx.flags(), "ctx already done refresh");
            return Ok(());
        }

        ctx.get();
        match self.apply_downcall(ctx, data) {
            Ok(()) => self.ctx_uptodate(ctx),
            Err(e) => {
                warn!(ctx = ctx.id(), serial = slot.serial(), "upcall failed: {}", e);
                // revokes the slot before waiters look at it again
                self.kill_slot_locked(slot, payload);
                ctx.expire();
                if e != GssError::Restart {
                    ctx.set_flag(CtxFlags::ERROR);
                }
                ctx.wakeup();
            }
        }
        self.put(ctx, true);
        // the helper always sees success once a context was found
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::downcall::ERESTART;
    use crate::application::keyring_type::GssKeyType;
    use crate::domain::config::ServerConfig;
    use crate::domain::handle::RawHandle;
    use crate::domain::mechanism::MechanismRegistry;
    use crate::domain::slot::{Delivery, KeyUpcall};
    use crate::infrastructure::keyring::{ChannelLauncher, KeyringStore};
    use crate::infrastructure::null_mech::{NullMechanism, NullToken};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        manager: Arc<ClientContextManager>,
        store: Arc<KeyringStore>,
        upcalls: UnboundedReceiver<KeyUpcall>,
        contexts: Arc<ContextCache>,
    }

    fn descriptor(reverse: bool) -> SecDescriptor {
        SecDescriptor {
            sec_id: 0x2a,
            part: SecPart::Cli,
            service: ServiceLevel::Integrity,
            import: ImportInfo {
                obd_name: "fsX-MDT0000-mdc-0001".to_string(),
                obd_type: "mdc".to_string(),
                peer_nid: 0x2000_0000_0a00_0002,
                self_nid: 0x2000_0000_0a00_0001,
                refpid: 4242,
                target_part: SecPart::Mdt,
            },
            reverse,
            root_only: false,
        }
    }

    fn fixture(desc: SecDescriptor) -> Fixture {
        let (launcher, upcalls) = ChannelLauncher::new();
        let store = Arc::new(KeyringStore::with_launcher(
            Arc::new(GssKeyType),
            Arc::new(launcher),
        ));
        let registry = MechanismRegistry::new().with(Arc::new(NullMechanism));
        let contexts = Arc::new(ContextCache::new(
            Arc::new(registry),
            &ServerConfig::default(),
        ));
        let manager = ClientContextManager::new(
            desc,
            Arc::new(NullMechanism),
            store.clone(),
            ClientConfig::default(),
            Some(ServerLink {
                contexts: contexts.clone(),
                index: Arc::new(ContextIndex::starting_at(500)),
            }),
        );
        Fixture {
            manager,
            store,
            upcalls,
            contexts,
        }
    }

    fn established(win: u32) -> Vec<u8> {
        Downcall::Established {
            win,
            handle: RawHandle::from_index(0xabc),
            mech_token: NullToken::new(Utc::now() + chrono::Duration::hours(1), b"k".to_vec())
                .encode(),
        }
        .encode()
    }

    fn answer(f: &Fixture, serial: u32, payload: &[u8]) {
        f.store.deliver(serial, Delivery::Instantiate(&[])).unwrap();
        f.store.deliver(serial, Delivery::Update(payload)).unwrap();
    }

    #[tokio::test]
    async fn test_user_callout_format() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::new(1000, 100), true).unwrap();
        assert_eq!(ctx.refcount(), 3);
        assert!(ctx.is_cached());
        assert!(ctx.has_timer());

        let upcall = f.upcalls.try_recv().unwrap();
        assert_eq!(upcall.description, "1000@2a");
        assert_eq!(
            upcall.callout,
            format!(
                "42:null:1000:100::-:1:0x200000000a000002:fsX-MDT0000-mdc-0001:0x200000000a000001:{}",
                std::process::id()
            )
        );
        f.manager.verify_bindings().unwrap();
    }

    #[tokio::test]
    async fn test_root_callout_and_unlinked_slot() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::ROOT, true).unwrap();
        let upcall = f.upcalls.try_recv().unwrap();
        assert_eq!(upcall.description, "0@2a");
        assert!(upcall.callout.contains(":0:0:r:i:1:"));
        assert!(upcall.callout.ends_with(":4242"));
        assert_eq!(f.manager.reverse_handle_index(), 500);

        let slot = ctx.bound_slot().unwrap();
        assert!(!slot.is_linked());

        // the root fast path does not issue another upcall
        let again = f.manager.lookup_ctx(UserCred::ROOT, true).unwrap();
        assert!(Arc::ptr_eq(&ctx, &again));
        assert!(f.upcalls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsupported_device_type() {
        let mut desc = descriptor(false);
        desc.import.obd_type = "lov".to_string();
        let mut f = fixture(desc);
        assert!(matches!(
            f.manager.lookup_ctx(UserCred::new(5, 5), true),
            Err(GssError::UnsupportedService(_))
        ));
        assert!(f.upcalls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_namespace_check_disabled_reports_pid_zero() {
        let (launcher, mut upcalls) = ChannelLauncher::new();
        let store = Arc::new(KeyringStore::with_launcher(
            Arc::new(GssKeyType),
            Arc::new(launcher),
        ));
        let config = ClientConfig {
            check_upcall_ns: false,
            ..ClientConfig::default()
        };
        let manager = ClientContextManager::new(
            descriptor(false),
            Arc::new(NullMechanism),
            store,
            config,
            None,
        );
        manager.lookup_ctx(UserCred::new(7, 7), true).unwrap();
        assert!(upcalls.try_recv().unwrap().callout.ends_with(":0"));
    }

    #[tokio::test]
    async fn test_successful_update_makes_context_ready() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::ROOT, true).unwrap();
        let serial = f.upcalls.try_recv().unwrap().serial;
        answer(&f, serial, &established(128));

        assert!(ctx.is_ready());
        assert!(!ctx.has_timer());
        assert_eq!(ctx.window(), 128);
        assert!(!f.manager.validate_ctx(&ctx));

        // root forward contexts install a reverse server entry
        assert_eq!(ctx.svc_handle(), RawHandle::from_index(500));
        let svc = f.contexts.lookup_by_handle(&RawHandle::from_index(500)).unwrap();
        assert_eq!(svc.target().as_deref(), Some("fsX-MDT0000-mdc-0001"));
        assert!(svc.role().mds);
    }

    #[tokio::test]
    async fn test_second_update_is_ignored() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::new(9, 9), true).unwrap();
        let serial = f.upcalls.try_recv().unwrap().serial;
        answer(&f, serial, &established(64));
        f.store
            .deliver(serial, Delivery::Update(&established(999)))
            .unwrap();
        assert_eq!(ctx.window(), 64);
    }

    #[tokio::test]
    async fn test_failed_negotiation_kills_context() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::new(9, 9), true).unwrap();
        let serial = f.upcalls.try_recv().unwrap().serial;
        let slot = ctx.bound_slot().unwrap();

        let failure = Downcall::Failed {
            rpc_err: 0,
            gss_err: 0x0d_0000,
        };
        answer(&f, serial, &failure.encode());

        assert!(ctx.flags().contains(CtxFlags::ERROR | CtxFlags::DEAD));
        assert!(!ctx.is_cached());
        assert!(!ctx.is_bound());
        assert!(slot.is_revoked());
        assert!(f.manager.validate_ctx(&ctx));
        // only the caller's reference is left
        assert_eq!(ctx.refcount(), 1);
        assert!(f.manager.release_ctx(&ctx, true));
        assert!(ctx.is_destroyed());
        assert_eq!(f.manager.nctx(), 0);
    }

    #[tokio::test]
    async fn test_restartable_failure_leaves_no_error() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::new(9, 9), true).unwrap();
        let serial = f.upcalls.try_recv().unwrap().serial;
        let slot = ctx.bound_slot().unwrap();

        let failure = Downcall::Failed {
            rpc_err: (ERESTART as i32).wrapping_neg() as u32,
            gss_err: 0,
        };
        answer(&f, serial, &failure.encode());

        assert!(ctx.is_dead());
        assert!(!ctx.flags().contains(CtxFlags::ERROR));
        assert!(slot.is_revoked());
        assert!(f.manager.validate_ctx(&ctx));
        assert!(f.manager.release_ctx(&ctx, true));

        // the next lookup negotiates again
        let fresh = f.manager.lookup_ctx(UserCred::new(9, 9), true).unwrap();
        assert!(!Arc::ptr_eq(&ctx, &fresh));
        assert!(f.upcalls.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_update_before_bind_asks_to_retry() {
        let f = fixture(descriptor(false));
        let slot = f.store.request("77@2a", Some("c")).unwrap();
        f.store
            .deliver(slot.serial(), Delivery::Instantiate(&[]))
            .unwrap();
        assert_eq!(
            f.store
                .deliver(slot.serial(), Delivery::Update(&established(1))),
            Err(GssError::TryAgain)
        );
    }

    #[tokio::test]
    async fn test_release_async_then_reap() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::new(3, 3), true).unwrap();
        f.upcalls.try_recv().unwrap();

        f.manager.die_ctx(&ctx, false);
        assert!(!ctx.is_cached());
        // slot and list references are gone, ours is the last
        assert!(f.manager.release_ctx(&ctx, false));
        assert!(!ctx.is_destroyed());
        assert_eq!(f.manager.reap_released(), 1);
        assert!(ctx.is_destroyed());
        assert_eq!(f.manager.nctx(), 0);
    }

    #[tokio::test]
    async fn test_flush_user_revokes_slot() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::new(1000, 1000), true).unwrap();
        let slot = ctx.bound_slot().unwrap();
        f.upcalls.try_recv().unwrap();

        let report = f.manager.flush_ctx_cache(Some(1000), false, false);
        assert_eq!(report.flushed, 1);
        assert!(slot.is_revoked());
        assert!(!ctx.is_cached());
        assert!(f.manager.cached_contexts().is_empty());

        // next lookup starts a new negotiation
        let fresh = f.manager.lookup_ctx(UserCred::new(1000, 1000), true).unwrap();
        assert!(!Arc::ptr_eq(&ctx, &fresh));
        assert!(f.upcalls.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_gc_collects_dead_contexts() {
        let mut f = fixture(descriptor(false));
        let ctx = f.manager.lookup_ctx(UserCred::new(8, 8), true).unwrap();
        f.upcalls.try_recv().unwrap();
        ctx.expire();
        assert_eq!(f.manager.gc_ctx(), 1);
        assert!(!ctx.is_bound());
        f.manager.release_ctx(&ctx, true);
        assert_eq!(f.manager.reap_released(), 0);
        assert!(ctx.is_destroyed());
    }

    #[tokio::test]
    async fn test_reverse_install_and_root_lookup() {
        let f = fixture(descriptor(true));
        assert_eq!(
            f.manager.lookup_ctx(UserCred::ROOT, true).unwrap_err(),
            GssError::NoContext
        );

        let mech = NullToken::new(Utc::now() + chrono::Duration::hours(1), b"r".to_vec())
            .into_context();
        let svc = f
            .contexts
            .install_reverse(77, mech.as_ref(), SecPart::Cli, "client")
            .unwrap();
        svc.set_reverse_handle(RawHandle::from_index(0x99));
        svc.set_reverse_sequence(41);

        f.manager.install_reverse_ctx(&svc).unwrap();
        let ctx = f.manager.lookup_ctx(UserCred::ROOT, false).unwrap();
        assert!(ctx.is_ready());
        assert!(ctx.is_reverse());
        assert_eq!(ctx.handle(), RawHandle::from_index(0x99));
        assert_eq!(ctx.svc_handle(), RawHandle::from_index(77));
        assert_eq!(ctx.sequence(), 41);
        assert_eq!(ctx.window(), GSS_SEQ_WIN);
        // list reference plus ours
        assert_eq!(ctx.refcount(), 2);

        ctx.next_sequence();
        assert!(f.manager.refresh_ctx(&ctx));
        assert_eq!(svc.reverse_sequence(), 43);
        f.manager.release_ctx(&ctx, true);

        // a second install shortens the first and does not replace the root
        f.manager.install_reverse_ctx(&svc).unwrap();
        assert_eq!(f.manager.cached_contexts().len(), 2);
        assert!(ctx.is_early_expire());
        assert!(Arc::ptr_eq(&f.manager.root_context().unwrap(), &ctx));
    }

    #[tokio::test]
    async fn test_forward_domain_rejects_reverse_install() {
        let f = fixture(descriptor(false));
        let mech = NullToken::new(Utc::now() + chrono::Duration::hours(1), vec![]).into_context();
        let svc = f
            .contexts
            .install_reverse(1, mech.as_ref(), SecPart::Cli, "client")
            .unwrap();
        assert!(matches!(
            f.manager.install_reverse_ctx(&svc),
            Err(GssError::UnsupportedService(_))
        ));
    }
}
