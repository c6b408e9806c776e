// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Slot type for client GSS contexts. Helper updates are routed through the
//! bound context back to the security domain that created it.

use tracing::{debug, warn};

use crate::domain::errors::GssError;
use crate::domain::slot::{Slot, SlotPayload, SlotType};

#[derive(Debug, Clone, Copy, Default)]
pub struct GssKeyType;

impl SlotType for GssKeyType {
    fn name(&self) -> &str {
        "lgssc"
    }

    fn instantiate(
        &self,
        slot: &Slot,
        _payload: &mut SlotPayload,
        data: &[u8],
    ) -> Result<(), GssError> {
        if !data.is_empty() {
            warn!(serial = slot.serial(), len = data.len(), "instantiate with unexpected data");
            return Err(GssError::protocol("instantiate carries no data"));
        }
        debug!(serial = slot.serial(), "slot instantiated");
        Ok(())
    }

    fn update(&self, slot: &Slot, payload: &mut SlotPayload, data: &[u8]) -> Result<(), GssError> {
        if data.is_empty() {
            return Err(GssError::protocol("empty update"));
        }

        let Some(ctx) = payload.clone() else {
            if slot.is_revoked() {
                return Err(GssError::Revoked(slot.serial()));
            }
            debug!(serial = slot.serial(), "update before context bound");
            return Err(GssError::TryAgain);
        };

        let sec = ctx
            .sec()
            .ok_or_else(|| GssError::NotFound(format!("security domain {:#x}", ctx.sec_id())))?;
        sec.complete_upcall(slot, payload, &ctx, data)
    }
}
