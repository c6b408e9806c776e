// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process capability store.
//!
//! Slots live in two indexes: by descriptor for `request`, and by serial for
//! helper deliveries. Revoked slots leave both; unlinked slots leave the
//! descriptor index only, so they can still be completed by the helper.
//!
//! The index lock is never held while a slot lock is taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::config::ClientConfig;
use crate::domain::errors::GssError;
use crate::domain::slot::{
    Delivery, KeyUpcall, SecureSlotStore, Slot, SlotType, UpcallLauncher,
};
use crate::infrastructure::helper::CommandUpcall;

#[derive(Default)]
struct SlotIndex {
    by_description: HashMap<String, Arc<Slot>>,
    by_serial: HashMap<u32, Arc<Slot>>,
}

pub struct KeyringStore {
    slot_type: Arc<dyn SlotType>,
    launcher: OnceLock<Arc<dyn UpcallLauncher>>,
    next_serial: AtomicU32,
    index: Mutex<SlotIndex>,
}

impl KeyringStore {
    pub fn new(slot_type: Arc<dyn SlotType>) -> Self {
        Self {
            slot_type,
            launcher: OnceLock::new(),
            next_serial: AtomicU32::new(1),
            index: Mutex::new(SlotIndex::default()),
        }
    }

    pub fn with_launcher(slot_type: Arc<dyn SlotType>, launcher: Arc<dyn UpcallLauncher>) -> Self {
        let store = Self::new(slot_type);
        store.set_launcher(launcher);
        store
    }

    /// Store whose slots are completed by the helper program named in `config`.
    pub fn with_helper(slot_type: Arc<dyn SlotType>, config: &ClientConfig) -> Arc<Self> {
        let launcher = Arc::new(CommandUpcall::from_config(config));
        let store = Arc::new(Self::with_launcher(slot_type, launcher.clone()));
        let handle: Arc<dyn SecureSlotStore> = store.clone();
        launcher.attach(Arc::downgrade(&handle));
        debug!(helper = %config.helper_path.display(), "keyring helper attached");
        store
    }

    /// Installs the helper launcher. Only the first call has an effect.
    pub fn set_launcher(&self, launcher: Arc<dyn UpcallLauncher>) -> bool {
        self.launcher.set(launcher).is_ok()
    }

    /// Number of slots that can still receive deliveries.
    pub fn live_slots(&self) -> usize {
        self.index.lock().by_serial.len()
    }
}

impl SecureSlotStore for KeyringStore {
    fn request(&self, description: &str, callout: Option<&str>) -> Result<Arc<Slot>, GssError> {
        let (slot, launcher, callout) = {
            let mut index = self.index.lock();
            if let Some(slot) = index.by_description.get(description) {
                if slot.matches(description) {
                    return Ok(slot.clone());
                }
            }

            let Some(callout) = callout else {
                return Err(GssError::NotFound(description.to_string()));
            };
            let launcher = self
                .launcher
                .get()
                .cloned()
                .ok_or_else(|| GssError::UpcallFailure("no helper launcher configured".to_string()))?;

            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            let slot = Arc::new(Slot::new(serial, description));
            slot.set_linked(true);
            index
                .by_description
                .insert(description.to_string(), slot.clone());
            index.by_serial.insert(serial, slot.clone());
            (slot, launcher, callout.to_string())
        };

        debug!(serial = slot.serial(), description = %description, "slot created, starting helper");
        let upcall = KeyUpcall {
            serial: slot.serial(),
            description: description.to_string(),
            callout,
        };
        if let Err(e) = launcher.launch(upcall) {
            warn!(serial = slot.serial(), "failed to start helper: {}", e);
            self.revoke(&slot);
            return Err(e);
        }
        Ok(slot)
    }

    fn slot(&self, serial: u32) -> Option<Arc<Slot>> {
        self.index.lock().by_serial.get(&serial).cloned()
    }

    fn deliver(&self, serial: u32, delivery: Delivery<'_>) -> Result<(), GssError> {
        let slot = self
            .slot(serial)
            .ok_or_else(|| GssError::NotFound(format!("slot {}", serial)))?;
        if slot.is_revoked() {
            return Err(GssError::Revoked(serial));
        }

        let mut payload = slot.lock();
        match delivery {
            Delivery::Instantiate(data) => {
                self.slot_type.instantiate(&slot, &mut payload, data)?;
                slot.mark_instantiated();
                Ok(())
            }
            Delivery::Update(data) => {
                if !slot.is_instantiated() {
                    return Err(GssError::protocol("update before instantiate"));
                }
                self.slot_type.update(&slot, &mut payload, data)
            }
        }
    }

    fn revoke(&self, slot: &Slot) {
        if !slot.mark_revoked() {
            return;
        }
        let mut index = self.index.lock();
        if index
            .by_description
            .get(slot.description())
            .is_some_and(|s| s.serial() == slot.serial())
        {
            index.by_description.remove(slot.description());
        }
        index.by_serial.remove(&slot.serial());
        debug!(serial = slot.serial(), "slot revoked");
    }

    fn unlink(&self, slot: &Slot) {
        slot.set_linked(false);
        let mut index = self.index.lock();
        if index
            .by_description
            .get(slot.description())
            .is_some_and(|s| s.serial() == slot.serial())
        {
            index.by_description.remove(slot.description());
        }
    }
}

/// Launcher that hands upcalls to an in-process helper over a channel.
pub struct ChannelLauncher {
    tx: mpsc::UnboundedSender<KeyUpcall>,
}

impl ChannelLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KeyUpcall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UpcallLauncher for ChannelLauncher {
    fn launch(&self, upcall: KeyUpcall) -> Result<(), GssError> {
        self.tx
            .send(upcall)
            .map_err(|_| GssError::UpcallFailure("helper channel closed".to_string()))
    }
}
