// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Established server-side context, as stored in the context cache.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::credentials::SecPart;
use crate::domain::errors::GssError;
use crate::domain::handle::RawHandle;
use crate::domain::mechanism::MechContext;
use crate::domain::sequence_window::SequenceWindow;

/// Privileges granted to the peer of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleFlags {
    pub remote: bool,
    pub root: bool,
    pub mds: bool,
    pub oss: bool,
}

impl RoleFlags {
    /// Role of a reverse context by the part it talks to.
    pub fn for_reverse(target: SecPart) -> Self {
        match target {
            SecPart::Mdt => RoleFlags {
                mds: true,
                ..Default::default()
            },
            SecPart::Ost => RoleFlags {
                oss: true,
                ..Default::default()
            },
            SecPart::Cli => RoleFlags {
                root: true,
                ..Default::default()
            },
            SecPart::Mgs => RoleFlags {
                root: true,
                mds: true,
                oss: true,
                ..Default::default()
            },
            SecPart::Mgc => RoleFlags::default(),
        }
    }
}

pub struct SvcContext {
    handle: RawHandle,
    role: RoleFlags,
    uid: u32,
    gid: u32,
    mapped_uid: u32,
    mech: Box<dyn MechContext>,
    seqdata: Mutex<SequenceWindow>,
    rvs_hdl: Mutex<RawHandle>,
    rvs_seq: AtomicU32,
    target: Mutex<Option<String>>,
}

impl SvcContext {
    pub fn new(
        handle: RawHandle,
        role: RoleFlags,
        uid: u32,
        gid: u32,
        mapped_uid: u32,
        mech: Box<dyn MechContext>,
        window: u32,
    ) -> Self {
        Self {
            handle,
            role,
            uid,
            gid,
            mapped_uid,
            mech,
            seqdata: Mutex::new(SequenceWindow::new(window)),
            rvs_hdl: Mutex::new(RawHandle::empty()),
            rvs_seq: AtomicU32::new(0),
            target: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &RawHandle {
        &self.handle
    }

    pub fn role(&self) -> RoleFlags {
        self.role
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn mapped_uid(&self) -> u32 {
        self.mapped_uid
    }

    pub fn mech(&self) -> &dyn MechContext {
        self.mech.as_ref()
    }

    /// Replay check for an inbound RPC.
    pub fn check_sequence(&self, seq: u32) -> Result<(), GssError> {
        self.seqdata.lock().accept(seq)
    }

    pub fn reverse_handle(&self) -> RawHandle {
        self.rvs_hdl.lock().clone()
    }

    pub fn set_reverse_handle(&self, handle: RawHandle) {
        *self.rvs_hdl.lock() = handle;
    }

    /// Next sequence number the reverse client context should use.
    pub fn reverse_sequence(&self) -> u32 {
        self.rvs_seq.load(Ordering::Acquire)
    }

    pub fn set_reverse_sequence(&self, seq: u32) {
        self.rvs_seq.store(seq, Ordering::Release);
    }

    pub fn target(&self) -> Option<String> {
        self.target.lock().clone()
    }

    pub fn set_target(&self, target: impl Into<String>) {
        *self.target.lock() = Some(target.into());
    }
}

impl fmt::Debug for SvcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SvcContext")
            .field("handle", &self.handle)
            .field("role", &self.role)
            .field("uid", &self.uid)
            .field("mapped_uid", &self.mapped_uid)
            .field("mech", &self.mech.mech_name())
            .finish()
    }
}
