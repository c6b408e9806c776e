// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server cache of established contexts, keyed by the handle given to the peer.
//!
//! Entries come from two places: helper replies describing a context it
//! just negotiated, and reverse contexts installed locally when a client
//! context to a peer becomes usable. Negative entries are kept until they
//! expire so a failed handle is not looked up again.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::clock;
use crate::domain::config::ServerConfig;
use crate::domain::credentials::SecPart;
use crate::domain::errors::GssError;
use crate::domain::handle::RawHandle;
use crate::domain::mechanism::{MechContext, MechanismRegistry};
use crate::domain::svc_context::{RoleFlags, SvcContext};
use crate::infrastructure::cache::{CacheDetail, CacheHead, UpcallCache};
use crate::infrastructure::qword::QwordReader;

pub struct ContextDetail;

impl CacheDetail for ContextDetail {
    type Key = RawHandle;
    type Meta = ();
    type Value = Arc<SvcContext>;

    fn name(&self) -> &'static str {
        "context"
    }
}

/// Counted reference to a cached server context.
#[derive(Clone)]
pub struct SvcContextRef {
    head: Arc<CacheHead<ContextDetail>>,
    ctx: Arc<SvcContext>,
}

impl SvcContextRef {
    fn from_head(head: Arc<CacheHead<ContextDetail>>) -> Option<Self> {
        let ctx = head.value()?.clone();
        Some(Self { head, ctx })
    }

    pub fn context(&self) -> &Arc<SvcContext> {
        &self.ctx
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.head.expiry()
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.head.is_live(now)
    }
}

impl Deref for SvcContextRef {
    type Target = SvcContext;

    fn deref(&self) -> &SvcContext {
        &self.ctx
    }
}

impl std::fmt::Debug for SvcContextRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvcContextRef")
            .field("ctx", &self.ctx)
            .field("expiry", &self.expiry())
            .finish()
    }
}

/// Everything needed to install one context.
#[derive(Debug)]
pub struct ContextInstall {
    pub handle: RawHandle,
    pub expiry: DateTime<Utc>,
    pub role: RoleFlags,
    pub mapped_uid: u32,
    /// `None` installs a negative entry.
    pub identity: Option<ContextIdentity>,
}

#[derive(Debug)]
pub struct ContextIdentity {
    pub uid: u32,
    pub gid: u32,
    pub mech: Box<dyn MechContext>,
}

pub struct ContextCache {
    cache: UpcallCache<ContextDetail>,
    registry: Arc<MechanismRegistry>,
    window: u32,
    reverse_expire: Duration,
}

impl ContextCache {
    pub fn new(registry: Arc<MechanismRegistry>, config: &ServerConfig) -> Self {
        Self {
            cache: UpcallCache::new(ContextDetail, config.new_entry_ttl()),
            registry,
            window: config.seq_window,
            reverse_expire: config.reverse_expire(),
        }
    }

    pub fn registry(&self) -> &Arc<MechanismRegistry> {
        &self.registry
    }

    /// Live, positive entry for `handle`.
    pub fn lookup_by_handle(&self, handle: &RawHandle) -> Option<SvcContextRef> {
        let head = self.cache.find(handle)?;
        if !head.is_live(Utc::now()) {
            return None;
        }
        SvcContextRef::from_head(head)
    }

    /// Installs a context, or a negative entry when there is no identity.
    pub fn install(&self, install: ContextInstall) -> Option<SvcContextRef> {
        let ContextInstall {
            handle,
            expiry,
            role,
            mapped_uid,
            identity,
        } = install;

        let value = identity.map(|id| {
            Arc::new(SvcContext::new(
                handle.clone(),
                role,
                id.uid,
                id.gid,
                mapped_uid,
                id.mech,
                self.window,
            ))
        });
        let negative = value.is_none();
        let head = self.cache.update(handle.clone(), (), value, expiry);
        debug!(handle = %handle, negative, "server context installed");
        SvcContextRef::from_head(head)
    }

    /// Installs the server half of a reverse context under `index`.
    pub fn install_reverse(
        &self,
        index: u64,
        mech: &dyn MechContext,
        target_part: SecPart,
        target: &str,
    ) -> Result<SvcContextRef, GssError> {
        let handle = RawHandle::from_index(index);
        let reverse = mech.copy_reverse()?;
        let expiry = reverse.expiry()?;

        let svc = SvcContext::new(
            handle.clone(),
            RoleFlags::for_reverse(target_part),
            0,
            0,
            0,
            reverse,
            self.window,
        );
        svc.set_target(target);

        let head = self
            .cache
            .update(handle.clone(), (), Some(Arc::new(svc)), expiry);
        info!(handle = %handle, target = %target, part = %target_part, "reverse server context installed");
        SvcContextRef::from_head(head).ok_or(GssError::NoMemory)
    }

    /// Gives a reverse context a short grace period before it expires.
    pub fn expire_reverse(&self, handle: &RawHandle) -> bool {
        match self.cache.find(handle) {
            Some(head) => {
                head.set_expiry(clock::deadline(Utc::now(), self.reverse_expire));
                debug!(handle = %handle, "reverse server context set to expire");
                true
            }
            None => false,
        }
    }

    /// Makes the entry negative so the next sweep removes it.
    pub fn destroy(&self, ctx: &SvcContextRef) {
        ctx.head.make_negative(DateTime::<Utc>::MIN_UTC);
        debug!(handle = %ctx.handle(), "server context destroyed");
    }

    /// Records that the reverse client context has used sequence numbers up to `seq`.
    pub fn update_sequence(&self, handle: &RawHandle, seq: u32) -> bool {
        match self.lookup_by_handle(handle) {
            Some(ctx) => {
                ctx.set_reverse_sequence(seq.wrapping_add(1));
                true
            }
            None => false,
        }
    }

    /// Parses and applies one reply line from the helper:
    /// `handle expiry remote root mds oss mapped_uid [uid gid mech_name mech_data]`.
    ///
    /// Returns `Ok(None)` for a negative entry.
    pub fn import_reply(&self, line: &str) -> Result<Option<SvcContextRef>, GssError> {
        let mut reader = QwordReader::new(line);
        let handle = RawHandle::new(reader.word("handle")?);
        let expiry = reader.expiry()?;
        let role = RoleFlags {
            remote: reader.expect_int("remote")? != 0,
            root: reader.expect_int("root")? != 0,
            mds: reader.expect_int("mds")? != 0,
            oss: reader.expect_int("oss")? != 0,
        };
        let mapped_uid = reader.expect_int("mapped_uid")? as u32;

        let negative = |handle: RawHandle| ContextInstall {
            handle,
            expiry,
            role,
            mapped_uid,
            identity: None,
        };

        let Some(uid) = reader.int("uid")? else {
            self.install(negative(handle));
            return Ok(None);
        };
        let gid = reader.expect_int("gid")? as u32;
        let mech_name = reader.string("mech_name")?;
        let mech = self.registry.get(&mech_name)?;
        let mech_data = reader.word("mech_data")?;

        let imported = match mech.import(&mech_data) {
            Ok(imported) => imported,
            Err(e) => {
                warn!(handle = %handle, mech = %mech_name, "failed to import context: {}", e);
                self.install(negative(handle));
                return Err(e.into());
            }
        };
        let expiry = imported.expiry()?;

        Ok(self.install(ContextInstall {
            handle,
            expiry,
            role,
            mapped_uid,
            identity: Some(ContextIdentity {
                uid: uid as u32,
                gid,
                mech: imported,
            }),
        }))
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.cache.sweep(now)
    }

    pub fn purge(&self) -> usize {
        self.cache.purge()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
