// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! ISP stage: sits mid-chain, normally OTF-coupled to the 3AA's output.

use crate::error::{HwError, HwResult};
use crate::frame::Frame;
use crate::hw_api::{RegField, RegisterBus};
use crate::hw_stage::{HardwareStage, HwSlot, StageCore};

// Parameter field indices.
pub const PARAM_ISP_WIDTH: usize = 16;
pub const PARAM_ISP_HEIGHT: usize = 17;
pub const PARAM_ISP_BAYER_ORDER: usize = 18;

const MIN_DIM: u32 = 16;
const MAX_DIM: u32 = 8192;
const BAYER_ORDER_MAX: u32 = 3;

struct IspPrivate {
    /// Tuning scenario currently latched into the shadow set.
    applied_scenario: Option<u32>,
}

pub struct IspStage {
    core: StageCore,
    bus: Box<dyn RegisterBus>,
    private: Option<IspPrivate>,
}

impl IspStage {
    pub fn new(pool_capacity: usize, bus: Box<dyn RegisterBus>) -> IspStage {
        IspStage {
            core: StageCore::new(HwSlot::Isp0, pool_capacity),
            bus,
            private: None,
        }
    }

    fn private_mut(&mut self) -> &mut IspPrivate {
        self.private.as_mut().expect("ISP private data corrupted")
    }

    pub fn note_applied_scenario(&mut self, scenario: u32) {
        self.private_mut().applied_scenario = Some(scenario);
    }

    pub fn applied_scenario(&self) -> Option<u32> {
        self.private
            .as_ref()
            .expect("ISP private data corrupted")
            .applied_scenario
    }
}

impl HardwareStage for IspStage {
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
        "isp"
    }

    fn alloc_private(&mut self) -> HwResult<()> {
        self.private = Some(IspPrivate {
            applied_scenario: None,
        });
        Ok(())
    }

    fn validate_param(&self, index: usize, value: u32) -> HwResult<()> {
        let bad = match index {
            PARAM_ISP_WIDTH | PARAM_ISP_HEIGHT => !(MIN_DIM..=MAX_DIM).contains(&value),
            PARAM_ISP_BAYER_ORDER => value > BAYER_ORDER_MAX,
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

    fn program_shot(&mut self, frame: &Frame) -> HwResult<()> {
        // Reprocessing shots re-run an earlier capture and carry the client's
        // retry counter into the metadata slot for the firmware.
        if self.core.reprocessing {
            self.bus.write(RegField::MetaStatus, frame.rcount);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StageMask;
    use crate::group::{GroupChain, GroupId};
    use crate::hw_api::{MockBus, ParamRegion};

    fn open_stage() -> IspStage {
        let mut stage = IspStage::new(4, Box::new(MockBus::new(HwSlot::Isp0)));
        stage.open(1).unwrap();
        let chain =
            GroupChain::build(1, &[(GroupId::Taa0, true), (GroupId::Isp0, true)]).unwrap();
        stage.init(chain.get(GroupId::Isp0).unwrap(), false, 0).unwrap();
        stage
    }

    #[test]
    fn isp_is_not_the_leader_in_a_taa_chain() {
        let stage = open_stage();
        assert!(!stage.core().leader);
        assert!(stage.core().otf_input);
    }

    #[test]
    fn bayer_order_is_range_checked() {
        let mut stage = open_stage();
        let mut region = ParamRegion::new();
        region.set(PARAM_ISP_BAYER_ORDER, 7);
        assert!(stage.set_param(&region, 1, StageMask::all()).is_err());
        let mut region = ParamRegion::new();
        region.set(PARAM_ISP_BAYER_ORDER, 2);
        stage.set_param(&region, 1, StageMask::all()).unwrap();
    }

    #[test]
    fn applied_scenario_is_tracked() {
        let mut stage = open_stage();
        assert_eq!(stage.applied_scenario(), None);
        stage.note_applied_scenario(4);
        assert_eq!(stage.applied_scenario(), Some(4));
    }

    #[test]
    fn wrong_instance_is_a_configuration_error() {
        let mut stage = open_stage();
        let region = ParamRegion::new();
        assert!(matches!(
            stage.set_param(&region, 9, StageMask::all()),
            Err(HwError::InvalidState { .. })
        ));
    }
}
