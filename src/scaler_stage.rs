// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Multi-port scaler (MCS). Each enabled output port raises its own
//! DMA-done completion.

use crate::error::{HwError, HwResult};
use crate::frame::{Frame, PortMask};
use crate::hw_api::{RegField, RegisterBus};
use crate::hw_stage::{HardwareStage, HwSlot, StageCore};

pub const SCALER_PORT_COUNT: u8 = 5;

// Parameter field indices: per-port output width/height, two fields a port.
pub const PARAM_MCS_OUT_BASE: usize = 32;

const MIN_DIM: u32 = 16;
const MAX_DIM: u32 = 8192;

struct ScalerPrivate {
    enabled_ports: PortMask,
}

pub struct ScalerStage {
    core: StageCore,
    bus: Box<dyn RegisterBus>,
    private: Option<ScalerPrivate>,
}

impl ScalerStage {
    pub fn new(pool_capacity: usize, bus: Box<dyn RegisterBus>) -> ScalerStage {
        ScalerStage {
            core: StageCore::new(HwSlot::Scaler, pool_capacity),
            bus,
            private: None,
        }
    }

    fn private_mut(&mut self) -> &mut ScalerPrivate {
        self.private.as_mut().expect("MCS private data corrupted")
    }

    /// Ports the most recent shot armed.
    pub fn enabled_ports(&self) -> PortMask {
        self.private
            .as_ref()
            .expect("MCS private data corrupted")
            .enabled_ports
    }
}

impl HardwareStage for ScalerStage {
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
        "mcs"
    }

    fn output_ports(&self) -> PortMask {
        PortMask::of(&[0, 1, 2, 3, 4])
    }

    fn alloc_private(&mut self) -> HwResult<()> {
        self.private = Some(ScalerPrivate {
            enabled_ports: PortMask::empty(),
        });
        Ok(())
    }

    fn validate_param(&self, index: usize, value: u32) -> HwResult<()> {
        let port_fields =
            PARAM_MCS_OUT_BASE..PARAM_MCS_OUT_BASE + 2 * SCALER_PORT_COUNT as usize;
        if port_fields.contains(&index) && !(MIN_DIM..=MAX_DIM).contains(&value) {
            return Err(HwError::ParamOutOfRange {
                slot: self.core.slot,
                index,
                value,
            });
        }
        Ok(())
    }

    fn program_shot(&mut self, frame: &Frame) -> HwResult<()> {
        // Enable exactly the ports this frame owes a DMA-done on; the rest
        // stay quiet so they raise no stray interrupts.
        let wanted = frame.obligations.out;
        for port in 0..SCALER_PORT_COUNT {
            let on = wanted.test(port) as u32;
            self.bus.write(RegField::ScalerOutEnable(port), on);
        }
        self.private_mut().enabled_ports = wanted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, ShotRequest};
    use crate::group::{GroupChain, GroupId};
    use crate::hw_api::MockBus;

    fn open_stage() -> ScalerStage {
        let mut stage = ScalerStage::new(4, Box::new(MockBus::new(HwSlot::Scaler)));
        stage.open(0).unwrap();
        let chain =
            GroupChain::build(0, &[(GroupId::Isp0, true), (GroupId::Mcs0, true)]).unwrap();
        stage.init(chain.get(GroupId::Mcs0).unwrap(), false, 0).unwrap();
        stage
    }

    #[test]
    fn shot_enables_only_requested_ports() {
        let mut stage = open_stage();
        let mut req = ShotRequest::new(0, 1);
        req.out_ports = PortMask::of(&[0, 3]);
        let mut frame = Frame::new(0);
        frame.load_request(&req);

        stage.shot(&mut frame).unwrap();
        assert_eq!(frame.obligations.out, PortMask::of(&[0, 3]));
        assert_eq!(stage.enabled_ports(), PortMask::of(&[0, 3]));
        assert_eq!(stage.bus_mut().read(RegField::ScalerOutEnable(0)), 1);
        assert_eq!(stage.bus_mut().read(RegField::ScalerOutEnable(1)), 0);
        assert_eq!(stage.bus_mut().read(RegField::ScalerOutEnable(3)), 1);
    }

    #[test]
    fn ports_outside_the_scaler_are_ignored() {
        let mut stage = open_stage();
        let mut req = ShotRequest::new(0, 1);
        req.out_ports = PortMask::of(&[2, 7]); // 7 is not a scaler port
        let mut frame = Frame::new(0);
        frame.load_request(&req);

        stage.shot(&mut frame).unwrap();
        assert_eq!(frame.obligations.out, PortMask::of(&[2]));
    }
}
