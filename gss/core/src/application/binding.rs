// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mutual reference between a client context and its capability slot.
//!
//! Both functions must run with the slot lock held; `payload` is the locked
//! payload of `slot`.

use std::sync::Arc;

use tracing::debug;

use crate::domain::client_context::ClientContext;
use crate::domain::slot::{Binding, SecureSlotStore, Slot, SlotPayload};

/// Points the slot at `ctx` and `ctx` at the slot. Takes the slot's reference.
pub(crate) fn bind(slot: &Arc<Slot>, payload: &mut SlotPayload, ctx: &Arc<ClientContext>) {
    debug_assert!(payload.is_none(), "slot already bound");
    debug_assert!(!ctx.is_bound(), "context already bound");

    ctx.get();
    *payload = Some(ctx.clone());
    ctx.attach_binding(Binding::new(slot.clone()));
    debug!(serial = slot.serial(), ctx = ctx.id(), "context bound to slot");
}

/// Severs the binding and revokes the slot. Returns false if `ctx` was not
/// the slot's payload. On success the caller owns the slot's former
/// reference and must release it.
pub(crate) fn unbind(
    store: &dyn SecureSlotStore,
    slot: &Slot,
    payload: &mut SlotPayload,
    ctx: &Arc<ClientContext>,
) -> bool {
    match payload.as_ref() {
        Some(bound) if Arc::ptr_eq(bound, ctx) => {}
        _ => return false,
    }

    // the slot is dead to new lookups before it stops pointing at ctx
    store.revoke(slot);
    *payload = None;
    ctx.detach_binding();
    ctx.clear_timer();
    debug!(serial = slot.serial(), ctx = ctx.id(), "context unbound from slot");
    true
}

/// Checks that a bound context and its slot agree with each other.
pub fn verify(ctx: &Arc<ClientContext>) -> Result<(), String> {
    let Some(slot) = ctx.bound_slot() else {
        return Ok(());
    };
    let payload = slot.lock();
    match payload.as_ref() {
        Some(bound) if Arc::ptr_eq(bound, ctx) => Ok(()),
        Some(other) => Err(format!(
            "ctx {} bound to slot {} which holds ctx {}",
            ctx.id(),
            slot.serial(),
            other.id()
        )),
        None => Err(format!(
            "ctx {} bound to slot {} which is empty",
            ctx.id(),
            slot.serial()
        )),
    }
}
