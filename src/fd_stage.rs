// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Face-detector (VRA) stage. Runs at the tail of the chain and latches its
//! configuration through a shadow register set; the handoff is driven from
//! the upstream stage's core-end while streaming.

use crate::error::{HwError, HwResult};
use crate::frame::Frame;
use crate::hw_api::{RegField, RegisterBus};
use crate::hw_stage::{HardwareStage, HwSlot, StageCore};

// Parameter field indices.
pub const PARAM_FD_MAP_WIDTH: usize = 48;
pub const PARAM_FD_MAP_HEIGHT: usize = 49;
pub const PARAM_FD_MAX_FACES: usize = 50;

const MIN_MAP: u32 = 32;
const MAX_MAP: u32 = 1024;
const MAX_FACES: u32 = 64;

struct FdPrivate {
    /// Shadow-switch sequence number. Reset exactly once per open/close
    /// cycle; each OTF handoff advances it.
    shadow_seq: u32,
}

pub struct FdStage {
    core: StageCore,
    bus: Box<dyn RegisterBus>,
    private: Option<FdPrivate>,
}

impl FdStage {
    pub fn new(pool_capacity: usize, bus: Box<dyn RegisterBus>) -> FdStage {
        FdStage {
            core: StageCore::new(HwSlot::Fd, pool_capacity),
            bus,
            private: None,
        }
    }

    fn private_mut(&mut self) -> &mut FdPrivate {
        self.private.as_mut().expect("VRA private data corrupted")
    }

    pub fn shadow_seq(&self) -> u32 {
        self.private.as_ref().expect("VRA private data corrupted").shadow_seq
    }
}

impl HardwareStage for FdStage {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn bus_mut(&mut self) -> &mut dyn RegisterBus {
        self.bus.as_mut()
    }

    fn kind_name(&self) -> &'static str {
        "vra"
    }

    fn alloc_private(&mut self) -> HwResult<()> {
        self.private = Some(FdPrivate { shadow_seq: 0 });
        Ok(())
    }

    fn reset_shadow_state(&mut self) {
        self.private_mut().shadow_seq = 0;
    }

    fn validate_param(&self, index: usize, value: u32) -> HwResult<()> {
        let bad = match index {
            PARAM_FD_MAP_WIDTH | PARAM_FD_MAP_HEIGHT => !(MIN_MAP..=MAX_MAP).contains(&value),
            PARAM_FD_MAX_FACES => value == 0 || value > MAX_FACES,
            _ => false,
        };
        if bad {
            return Err(HwError::ParamOutOfRange {
                slot: self.core.slot,
                index,
                value,
            });
        }
        Ok(())
    }

    fn program_shot(&mut self, _frame: &Frame) -> HwResult<()> {
        Ok(())
    }

    fn shadow_handoff(&mut self, fcount: u32) -> HwResult<()> {
        let seq = {
            let private = self.private_mut();
            private.shadow_seq = private.shadow_seq.wrapping_add(1);
            private.shadow_seq
        };
        self.bus.write(RegField::FdShadowSwitch, seq);
        self.bus.write(RegField::ShotFcount, fcount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupChain, GroupId};
    use crate::hw_api::MockBus;

    fn open_stage() -> FdStage {
        let mut stage = FdStage::new(4, Box::new(MockBus::new(HwSlot::Fd)));
        stage.open(0).unwrap();
        let chain =
            GroupChain::build(0, &[(GroupId::Mcs0, true), (GroupId::Vra0, true)]).unwrap();
        stage.init(chain.get(GroupId::Vra0).unwrap(), false, 0).unwrap();
        stage
    }

    #[test]
    fn shadow_sequence_advances_per_handoff() {
        let mut stage = open_stage();
        assert_eq!(stage.shadow_seq(), 0);
        stage.shadow_handoff(10).unwrap();
        stage.shadow_handoff(11).unwrap();
        assert_eq!(stage.shadow_seq(), 2);
        assert_eq!(stage.bus_mut().read(RegField::FdShadowSwitch), 2);
    }

    #[test]
    fn shadow_state_resets_once_per_open_cycle() {
        let mut stage = open_stage();
        stage.shadow_handoff(1).unwrap();

        // A second init inside the same open cycle must not reset.
        let chain =
            GroupChain::build(0, &[(GroupId::Mcs0, true), (GroupId::Vra0, true)]).unwrap();
        stage.init(chain.get(GroupId::Vra0).unwrap(), false, 0).unwrap();
        assert_eq!(stage.shadow_seq(), 1);

        // A fresh open/close cycle does.
        stage.close(0).unwrap();
        stage.open(0).unwrap();
        stage.init(chain.get(GroupId::Vra0).unwrap(), false, 0).unwrap();
        assert_eq!(stage.shadow_seq(), 0);
    }
}
