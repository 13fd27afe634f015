// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Explicit slot-indexed table of stage instances. Owned by the dispatcher
//! and passed by reference; never a process-wide global.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{HwError, HwResult};
use crate::hw_stage::{HardwareStage, HwSlot};

type StageSlot = Mutex<Box<dyn HardwareStage>>;

pub struct HardwareRegistry {
    slots: [Option<StageSlot>; 5],
}

impl HardwareRegistry {
    pub fn new() -> HardwareRegistry {
        HardwareRegistry {
            slots: [None, None, None, None, None],
        }
    }

    /// Install a stage into its slot. Replacing a live stage is an
    /// accounting bug.
    pub fn install(&mut self, stage: Box<dyn HardwareStage>) {
        let slot = stage.core().slot;
        let entry = &mut self.slots[slot.index()];
        if entry.is_some() {
            panic!("registry: slot {} installed twice", slot);
        }
        *entry = Some(Mutex::new(stage));
    }

    pub fn is_installed(&self, slot: HwSlot) -> bool {
        self.slots[slot.index()].is_some()
    }

    /// Exclusive access to one stage. Each stage has its own lock, so two
    /// interrupt contexts for different stages never contend.
    pub fn stage(&self, slot: HwSlot) -> HwResult<MutexGuard<'_, Box<dyn HardwareStage>>> {
        let entry = self.slots[slot.index()]
            .as_ref()
            .ok_or(HwError::StageNotRegistered(slot))?;
        Ok(entry.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Default for HardwareRegistry {
    fn default() -> Self {
        HardwareRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_api::MockBus;
    use crate::taa_stage::TaaStage;

    fn taa(slot: HwSlot) -> Box<dyn HardwareStage> {
        Box::new(TaaStage::new(slot, 2, Box::new(MockBus::new(slot))))
    }

    #[test]
    fn lookup_of_empty_slot_fails() {
        let mut registry = HardwareRegistry::new();
        registry.install(taa(HwSlot::Taa0));
        assert!(registry.stage(HwSlot::Taa0).is_ok());
        assert!(matches!(
            registry.stage(HwSlot::Isp0),
            Err(HwError::StageNotRegistered(HwSlot::Isp0))
        ));
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn double_install_is_fatal() {
        let mut registry = HardwareRegistry::new();
        registry.install(taa(HwSlot::Taa1));
        registry.install(taa(HwSlot::Taa1));
    }
}
