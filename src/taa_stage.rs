// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! 3AA pre-processor stage. Two physical slots (3AA-0, 3AA-1) share this
//! kind. The 3AA sits at the head of an OTF chain, so it is usually the
//! leader whose config-lock event paces the stream.

use crate::error::{HwError, HwResult};
use crate::frame::{Frame, FrameType, PortMask};
use crate::hw_api::{RegField, RegisterBus};
use crate::hw_stage::{HardwareStage, HwSlot, StageCore};

/// Statistics DMA output port owned by the 3AA.
pub const TAA_STAT_PORT: u8 = 5;

// Parameter field indices.
pub const PARAM_TAA_WIDTH: usize = 0;
pub const PARAM_TAA_HEIGHT: usize = 1;
pub const PARAM_TAA_CROP_X: usize = 2;
pub const PARAM_TAA_CROP_Y: usize = 3;

const MIN_DIM: u32 = 16;
const MAX_DIM: u32 = 8192;

struct TaaPrivate {
    /// Frames-per-trigger in fast-readout mode; 1 means one shot per frame.
    fro_count: u32,
}

pub struct TaaStage {
    core: StageCore,
    bus: Box<dyn RegisterBus>,
    private: Option<TaaPrivate>,
}

impl TaaStage {
    pub fn new(slot: HwSlot, pool_capacity: usize, bus: Box<dyn RegisterBus>) -> TaaStage {
        TaaStage {
            core: StageCore::new(slot, pool_capacity),
            bus,
            private: None,
        }
    }

    fn private(&self) -> &TaaPrivate {
        // Missing private data after open is memory-lifetime corruption.
        self.private.as_ref().expect("3AA private data corrupted")
    }
}

impl HardwareStage for TaaStage {
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
        "3aa"
    }

    fn output_ports(&self) -> PortMask {
        PortMask::of(&[TAA_STAT_PORT])
    }

    fn alloc_private(&mut self) -> HwResult<()> {
        self.private = Some(TaaPrivate { fro_count: 1 });
        Ok(())
    }

    fn validate_param(&self, index: usize, value: u32) -> HwResult<()> {
        match index {
            PARAM_TAA_WIDTH | PARAM_TAA_HEIGHT => {
                if !(MIN_DIM..=MAX_DIM).contains(&value) {
                    return Err(HwError::ParamOutOfRange {
                        slot: self.core.slot,
                        index,
                        value,
                    });
                }
            }
            PARAM_TAA_CROP_X | PARAM_TAA_CROP_Y => {
                if value > MAX_DIM {
                    return Err(HwError::ParamOutOfRange {
                        slot: self.core.slot,
                        index,
                        value,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn program_shot(&mut self, frame: &Frame) -> HwResult<()> {
        let fro = self.private().fro_count;
        self.bus.write(RegField::FroCount, fro);
        // A DMA-input 3AA shot must carry at least one resolved buffer.
        if !self.core.otf_input
            && frame.frame_type == FrameType::External
            && frame.planes.iter().all(|p| p.dva == 0)
        {
            return Err(HwError::InvalidState {
                slot: self.core.slot,
                op: "shot",
                reason: "dma input shot without buffer",
            });
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
    use crate::hw_stage::StageState;

    fn open_stage() -> TaaStage {
        let mut stage = TaaStage::new(HwSlot::Taa0, 4, Box::new(MockBus::new(HwSlot::Taa0)));
        stage.open(0).unwrap();
        let chain = GroupChain::build(0, &[(GroupId::Taa0, true)]).unwrap();
        stage.init(chain.get(GroupId::Taa0).unwrap(), false, 3).unwrap();
        stage
    }

    #[test]
    fn open_is_idempotent_and_refcounted() {
        let mut stage = open_stage();
        stage.open(0).unwrap();
        assert_eq!(stage.core().open_count, 2);
        assert!(stage.core().state.test(StageState::OPEN));
        stage.close(0).unwrap();
        assert!(stage.core().state.test(StageState::OPEN));
        stage.close(0).unwrap();
        assert!(!stage.core().state.test(StageState::OPEN));
    }

    #[test]
    fn init_binds_group_and_leader_flag() {
        let stage = open_stage();
        assert_eq!(stage.core().group, Some(GroupId::Taa0));
        assert!(stage.core().leader);
        assert!(stage.core().otf_input);
        assert_eq!(stage.core().module_id, 3);
    }

    #[test]
    fn out_of_range_dimension_is_rejected_before_any_write() {
        let mut stage = open_stage();
        let mut region = ParamRegion::new();
        region.set(PARAM_TAA_WIDTH, 4000);
        region.set(PARAM_TAA_HEIGHT, MAX_DIM + 1);
        let err = stage
            .set_param(&region, 0, StageMask::all())
            .unwrap_err();
        assert_eq!(
            err,
            HwError::ParamOutOfRange {
                slot: HwSlot::Taa0,
                index: PARAM_TAA_HEIGHT,
                value: MAX_DIM + 1
            }
        );
    }

    #[test]
    fn set_param_skips_stages_outside_the_mask() {
        let mut stage = open_stage();
        let mut region = ParamRegion::new();
        region.set(PARAM_TAA_WIDTH, 0); // would be invalid if applied
        stage
            .set_param(&region, 0, StageMask::of(&[HwSlot::Isp0]))
            .unwrap();
    }
}
