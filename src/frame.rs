// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use crate::hw_stage::HwSlot;

/// Maximum number of per-plane buffer addresses carried by one frame.
pub const MAX_PLANES: usize = 8;

/// One buffer plane, resolved by the allocation layer to both kernel-virtual
/// and device-virtual form before it reaches this core.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneAddr {
    pub kva: u64,
    pub dva: u64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    /// Client-submitted shot.
    #[default]
    External,
    /// Synthesized at config-lock time because no client frame had arrived.
    /// Internal frames keep OTF-coupled hardware fed and never notify the
    /// client.
    Internal,
    /// Client shot whose target fcount was already passed by the hardware.
    /// Late frames only complete through the forced path.
    Late,
}

/// Per-frame result code reported in completion messages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ShotResult {
    #[default]
    Success,
    /// The config-lock interrupt arrived too late for this frame's window.
    ConfigLockDelay,
    /// The shot was classified Late at submission time.
    LateShot,
    /// Force-completed by stream stop or teardown; never ran on hardware.
    Unprocessed,
}

/// Set of hardware stages, one bit per slot.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct StageMask(u32);

impl StageMask {
    pub fn empty() -> StageMask {
        StageMask(0)
    }

    pub fn all() -> StageMask {
        let mut m = StageMask(0);
        for slot in HwSlot::ALL {
            m.set(slot);
        }
        m
    }

    pub fn of(slots: &[HwSlot]) -> StageMask {
        let mut m = StageMask(0);
        for slot in slots {
            m.set(*slot);
        }
        m
    }

    pub fn set(&mut self, slot: HwSlot) {
        self.0 |= 1 << slot.index();
    }

    pub fn clear(&mut self, slot: HwSlot) {
        self.0 &= !(1 << slot.index());
    }

    pub fn test(&self, slot: HwSlot) -> bool {
        self.0 & (1 << slot.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StageMask({:#07b})", self.0)
    }
}

/// Set of DMA output ports, one bit per port id.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct PortMask(u32);

impl PortMask {
    pub fn empty() -> PortMask {
        PortMask(0)
    }

    pub fn of(ports: &[u8]) -> PortMask {
        let mut m = PortMask(0);
        for p in ports {
            m.set(*p);
        }
        m
    }

    pub fn set(&mut self, port: u8) {
        self.0 |= 1 << port;
    }

    pub fn clear(&mut self, port: u8) {
        self.0 &= !(1u32 << port);
    }

    pub fn test(&self, port: u8) -> bool {
        self.0 & (1 << port) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersect(&self, other: PortMask) -> PortMask {
        PortMask(self.0 & other.0)
    }
}

impl fmt::Debug for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PortMask({:#b})", self.0)
    }
}

/// Everything a frame still owes before it may return to Free.
///
/// `req` records which stages the client asked to observe (diagnostics),
/// `core` which stages still owe a core-end, `out` which output ports still
/// owe a DMA-done, and `ndone` which outputs failed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Obligations {
    pub req: StageMask,
    pub core: StageMask,
    pub out: PortMask,
    pub ndone: PortMask,
}

impl Obligations {
    /// True once nothing further is owed and the frame may be recycled.
    pub fn all_clear(&self) -> bool {
        self.core.is_empty() && self.out.is_empty()
    }

    pub fn force_clear(&mut self) {
        self.core = StageMask::empty();
        self.out = PortMask::empty();
    }
}

/// Hardware-produced per-frame metadata copied back at core-end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ShotMeta {
    pub hw_fcount: u32,
    pub status_raw: u32,
}

/// The shot template a client submits. Value-copied into each participating
/// stage's own working frame; never shared across stage boundaries.
#[derive(Copy, Clone, Debug)]
pub struct ShotRequest {
    pub fcount: u32,
    pub rcount: u32,
    pub instance: u32,
    /// Stages the client wants observed (core-end completion reported).
    pub observe: StageMask,
    /// Output ports requested for this capture.
    pub out_ports: PortMask,
    pub planes: [PlaneAddr; MAX_PLANES],
}

impl ShotRequest {
    pub fn new(instance: u32, fcount: u32) -> ShotRequest {
        ShotRequest {
            fcount,
            rcount: fcount,
            instance,
            observe: StageMask::all(),
            out_ports: PortMask::empty(),
            planes: [PlaneAddr::default(); MAX_PLANES],
        }
    }
}

/// One capture cycle as seen by a single hardware stage.
///
/// Frames never leave their owning pool; they move between its queues by
/// value. `slot_index` identifies the pool slot for diagnostics only.
#[derive(Clone, Debug)]
pub struct Frame {
    pub slot_index: usize,
    pub fcount: u32,
    pub rcount: u32,
    pub instance: u32,
    pub frame_type: FrameType,
    pub planes: [PlaneAddr; MAX_PLANES],
    /// Output ports the client asked for; each stage intersects this with
    /// its own ports when the shot is issued.
    pub req_ports: PortMask,
    pub obligations: Obligations,
    pub result: ShotResult,
    pub meta: ShotMeta,
    /// Set once the final frame-done message has been posted; guards the
    /// exactly-once completion property.
    pub notified: bool,
    /// Only the stage backing the group the client targeted reports the
    /// final frame-done; upstream working copies complete silently.
    pub reports_done: bool,
}

impl Frame {
    pub fn new(slot_index: usize) -> Frame {
        Frame {
            slot_index,
            fcount: 0,
            rcount: 0,
            instance: 0,
            frame_type: FrameType::External,
            planes: [PlaneAddr::default(); MAX_PLANES],
            req_ports: PortMask::empty(),
            obligations: Obligations::default(),
            result: ShotResult::Success,
            meta: ShotMeta::default(),
            notified: false,
            reports_done: false,
        }
    }

    /// Zero everything except the pool slot identity.
    pub fn reset(&mut self) {
        let slot_index = self.slot_index;
        *self = Frame::new(slot_index);
    }

    /// Copy the salient request fields into this working frame.
    pub fn load_request(&mut self, req: &ShotRequest) {
        self.fcount = req.fcount;
        self.rcount = req.rcount;
        self.instance = req.instance;
        self.frame_type = FrameType::External;
        self.planes = req.planes;
        self.req_ports = req.out_ports;
        self.obligations = Obligations {
            req: req.observe,
            core: StageMask::empty(),
            out: PortMask::empty(),
            ndone: PortMask::empty(),
        };
        self.result = ShotResult::Success;
        self.meta = ShotMeta::default();
        self.notified = false;
        self.reports_done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obligations_all_clear_ignores_req_and_ndone() {
        let mut ob = Obligations::default();
        ob.req.set(HwSlot::Taa0);
        ob.ndone.set(1);
        assert!(ob.all_clear());

        ob.core.set(HwSlot::Isp0);
        assert!(!ob.all_clear());
        ob.core.clear(HwSlot::Isp0);

        ob.out.set(0);
        assert!(!ob.all_clear());
        ob.out.clear(0);
        assert!(ob.all_clear());
    }

    #[test]
    fn load_request_clears_previous_cycle() {
        let mut frame = Frame::new(2);
        frame.notified = true;
        frame.result = ShotResult::Unprocessed;
        frame.obligations.core.set(HwSlot::Scaler);

        let req = ShotRequest::new(0, 42);
        frame.load_request(&req);
        assert_eq!(frame.slot_index, 2);
        assert_eq!(frame.fcount, 42);
        assert!(!frame.notified);
        assert_eq!(frame.result, ShotResult::Success);
        assert!(frame.obligations.core.is_empty());
    }
}
