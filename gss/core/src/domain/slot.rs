// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Capability Slots
//!
//! A slot is a session-scoped secure container holding at most one client
//! context, addressable by a textual descriptor (`"{uid}@{sec_id:x}"`). The
//! store behind it ([`SecureSlotStore`]) starts the privileged helper for new
//! slots and routes the helper's instantiate/update deliveries to the slot's
//! [`SlotType`].
//!
//! ## Locking
//!
//! The slot's payload mutex is the slot's exclusive lock. Binding and
//! unbinding a context happen only while it is held, and the order is always
//! slot lock, then security domain lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::domain::client_context::ClientContext;
use crate::domain::errors::GssError;

/// What a slot holds: nothing, or one bound context.
pub type SlotPayload = Option<Arc<ClientContext>>;

pub struct Slot {
    serial: u32,
    description: String,
    revoked: AtomicBool,
    instantiated: AtomicBool,
    linked: AtomicBool,
    payload: Mutex<SlotPayload>,
}

impl Slot {
    pub fn new(serial: u32, description: impl Into<String>) -> Self {
        Self {
            serial,
            description: description.into(),
            revoked: AtomicBool::new(false),
            instantiated: AtomicBool::new(false),
            linked: AtomicBool::new(false),
            payload: Mutex::new(None),
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Takes the slot's exclusive lock.
    pub fn lock(&self) -> MutexGuard<'_, SlotPayload> {
        self.payload.lock()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Marks the slot revoked. Revoked slots are never matched again.
    pub fn mark_revoked(&self) -> bool {
        !self.revoked.swap(true, Ordering::AcqRel)
    }

    pub fn is_instantiated(&self) -> bool {
        self.instantiated.load(Ordering::Acquire)
    }

    pub fn mark_instantiated(&self) {
        self.instantiated.store(true, Ordering::Release);
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    /// Same descriptor and still live.
    pub fn matches(&self, description: &str) -> bool {
        !self.is_revoked() && self.description == description
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("serial", &self.serial)
            .field("description", &self.description)
            .field("revoked", &self.is_revoked())
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// A context's side of the mutual slot reference.
///
/// Only [`crate::application::binding`] creates or removes bindings, and only
/// while holding the slot's lock.
pub struct Binding {
    slot: Arc<Slot>,
}

impl Binding {
    pub(crate) fn new(slot: Arc<Slot>) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }
}

/// Helper deliveries routed to a slot.
#[derive(Debug, Clone, Copy)]
pub enum Delivery<'a> {
    /// Completes construction. Carries no data.
    Instantiate(&'a [u8]),
    /// Carries the negotiation outcome.
    Update(&'a [u8]),
}

/// Per-type callbacks invoked by the store with the slot lock held.
pub trait SlotType: Send + Sync {
    fn name(&self) -> &str;

    fn instantiate(
        &self,
        slot: &Slot,
        payload: &mut SlotPayload,
        data: &[u8],
    ) -> Result<(), GssError>;

    fn update(&self, slot: &Slot, payload: &mut SlotPayload, data: &[u8]) -> Result<(), GssError>;
}

/// Parameters handed to the helper for a freshly created slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpcall {
    pub serial: u32,
    pub description: String,
    pub callout: String,
}

/// Starts the privileged helper that will answer a [`KeyUpcall`].
pub trait UpcallLauncher: Send + Sync {
    fn launch(&self, upcall: KeyUpcall) -> Result<(), GssError>;
}

/// Capability store abstraction.
pub trait SecureSlotStore: Send + Sync {
    /// Finds the live slot for `description`, or when `callout` is given,
    /// creates one and starts the helper for it. Concurrent requests for the
    /// same descriptor converge on one slot and one upcall.
    fn request(&self, description: &str, callout: Option<&str>) -> Result<Arc<Slot>, GssError>;

    /// Slot with `serial`, unless it has been revoked.
    fn slot(&self, serial: u32) -> Option<Arc<Slot>>;

    /// Routes a helper delivery to the slot with `serial`.
    fn deliver(&self, serial: u32, delivery: Delivery<'_>) -> Result<(), GssError>;

    /// Revokes the slot; it is no longer found by `request` or `deliver`.
    fn revoke(&self, slot: &Slot);

    /// Removes the slot from the session-visible namespace.
    fn unlink(&self, slot: &Slot);
}
