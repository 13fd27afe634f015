// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use log::warn;

use crate::error::{HwError, HwResult};
use crate::frame::{Frame, FrameType, PortMask, StageMask};
use crate::frame_pool::FramePool;
use crate::group::{Group, GroupId};
use crate::hw_api::{ParamRegion, RegField, RegisterBus};
use crate::setfile::SetfileTable;

/// Physical hardware IP slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HwSlot {
    Taa0,
    Taa1,
    Isp0,
    Scaler,
    Fd,
}

impl HwSlot {
    pub const ALL: [HwSlot; 5] = [
        HwSlot::Taa0,
        HwSlot::Taa1,
        HwSlot::Isp0,
        HwSlot::Scaler,
        HwSlot::Fd,
    ];

    pub fn index(self) -> usize {
        match self {
            HwSlot::Taa0 => 0,
            HwSlot::Taa1 => 1,
            HwSlot::Isp0 => 2,
            HwSlot::Scaler => 3,
            HwSlot::Fd => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HwSlot::Taa0 => "3AA-0",
            HwSlot::Taa1 => "3AA-1",
            HwSlot::Isp0 => "ISP-0",
            HwSlot::Scaler => "MCS",
            HwSlot::Fd => "VRA",
        }
    }
}

impl fmt::Display for HwSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage lifecycle bits. Stages progress independently, so these are
/// independent flags rather than a strict automaton, but Open ⊆ Init ⊆
/// {Config, Run} always holds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StageState(u32);

impl StageState {
    pub const OPEN: u32 = 1 << 0;
    pub const INIT: u32 = 1 << 1;
    pub const CONFIG: u32 = 1 << 2;
    pub const RUN: u32 = 1 << 3;

    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    pub fn test(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Frame-start / frame-end / config-lock counters. Written only from the
/// owning stage's interrupt context, read anywhere for diagnostics.
#[derive(Debug, Default)]
pub struct StageCounters {
    pub fs: AtomicU32,
    pub fe: AtomicU32,
    pub cl: AtomicU32,
}

impl StageCounters {
    pub fn set_all(&self, value: u32) {
        self.fs.store(value, Ordering::Relaxed);
        self.fe.store(value, Ordering::Relaxed);
        self.cl.store(value, Ordering::Relaxed);
    }

    pub fn fs(&self) -> u32 {
        self.fs.load(Ordering::Relaxed)
    }

    pub fn fe(&self) -> u32 {
        self.fe.load(Ordering::Relaxed)
    }

    pub fn cl(&self) -> u32 {
        self.cl.load(Ordering::Relaxed)
    }
}

/// State every stage kind shares: lifecycle flags, the stage's own frame
/// pool, interrupt counters and the group binding. Lives behind the stage's
/// registry lock.
pub struct StageCore {
    pub slot: HwSlot,
    pub state: StageState,
    pub instance: Option<u32>,
    pub open_count: u32,
    pub group: Option<GroupId>,
    pub otf_input: bool,
    pub leader: bool,
    pub reprocessing: bool,
    pub module_id: u32,
    pub pool: FramePool,
    pub counters: StageCounters,
    /// fcount of the most recent frame this stage fully completed. Drives
    /// late-shot classification.
    pub last_done_fcount: u32,
    /// Set between config-lock and frame-start.
    pub configuring: bool,
    pub setfiles: SetfileTable,
    shadow_reset_done: bool,
}

impl StageCore {
    pub fn new(slot: HwSlot, pool_capacity: usize) -> StageCore {
        StageCore {
            slot,
            state: StageState::default(),
            instance: None,
            open_count: 0,
            group: None,
            otf_input: false,
            leader: false,
            reprocessing: false,
            module_id: 0,
            pool: FramePool::new(slot.name(), pool_capacity),
            counters: StageCounters::default(),
            last_done_fcount: 0,
            configuring: false,
            setfiles: SetfileTable::new(),
            shadow_reset_done: false,
        }
    }

    fn check_instance(&self, instance: u32, op: &'static str) -> HwResult<()> {
        match self.instance {
            Some(bound) if bound == instance => Ok(()),
            _ => Err(HwError::InvalidState {
                slot: self.slot,
                op,
                reason: "instance not bound to this stage",
            }),
        }
    }
}

/// Capability set every hardware stage exposes, polymorphic over the
/// concrete stage kinds. Shared open/init/enable/shot plumbing is provided
/// here; stage kinds supply register programming and validation through the
/// `*_hw` hooks. Completion reconciliation operates on the stage through
/// this trait from the dispatcher (see `dispatcher.rs`).
pub trait HardwareStage: Send {
    fn core(&self) -> &StageCore;
    fn core_mut(&mut self) -> &mut StageCore;
    fn bus_mut(&mut self) -> &mut dyn RegisterBus;
    fn kind_name(&self) -> &'static str;

    /// DMA output ports owned by this stage kind, if any.
    fn output_ports(&self) -> PortMask {
        PortMask::empty()
    }

    /// First-time setup of stage-private data, sized by the concrete kind.
    fn alloc_private(&mut self) -> HwResult<()>;

    /// Reset stage-private shadow sequencing. Called exactly once per
    /// open/close cycle, from `init`.
    fn reset_shadow_state(&mut self) {}

    fn validate_param(&self, index: usize, value: u32) -> HwResult<()>;

    /// Kind-specific part of the shot register program. The common fields
    /// (fcount, plane addresses) are already committed when this runs.
    fn program_shot(&mut self, frame: &Frame) -> HwResult<()>;

    /// OTF shadow handoff, driven from the parent chain's core-end. Only
    /// meaningful for kinds with shadow register sets.
    fn shadow_handoff(&mut self, _fcount: u32) -> HwResult<()> {
        Ok(())
    }

    fn open(&mut self, instance: u32) -> HwResult<()> {
        if self.core().state.test(StageState::OPEN) {
            // Idempotent: a second open only takes a reference.
            self.core_mut().open_count += 1;
            return Ok(());
        }
        self.alloc_private()?;
        let core = self.core_mut();
        core.instance = Some(instance);
        core.open_count = 1;
        core.state.set(StageState::OPEN);
        core.shadow_reset_done = false;
        Ok(())
    }

    fn init(&mut self, group: &Group, reprocessing: bool, module_id: u32) -> HwResult<()> {
        if !self.core().state.test(StageState::OPEN) {
            return Err(HwError::InvalidState {
                slot: self.core().slot,
                op: "init",
                reason: "stage not open",
            });
        }
        if !self.core().shadow_reset_done {
            self.reset_shadow_state();
            self.core_mut().shadow_reset_done = true;
        }
        let core = self.core_mut();
        core.group = Some(group.id);
        core.otf_input = group.otf_input;
        core.leader = group.is_leader();
        core.reprocessing = reprocessing;
        core.module_id = module_id;
        core.state.set(StageState::INIT);
        Ok(())
    }

    /// Arm interrupts and transition to Run. No-op when this stage is not in
    /// `mask`.
    fn enable(&mut self, instance: u32, mask: StageMask) -> HwResult<()> {
        let slot = self.core().slot;
        if !mask.test(slot) {
            return Ok(());
        }
        self.core().check_instance(instance, "enable")?;
        if !self.core().state.test(StageState::INIT) {
            return Err(HwError::InvalidState {
                slot,
                op: "enable",
                reason: "stage not initialized",
            });
        }
        self.bus_mut().write(RegField::IrqMask, 0xffff_ffff);
        self.bus_mut().write(RegField::GlobalEnable, 1);
        self.core_mut().state.set(StageState::RUN);
        Ok(())
    }

    /// Quiesce the stage and clear Run.
    fn disable(&mut self, instance: u32, mask: StageMask) -> HwResult<()> {
        let slot = self.core().slot;
        if !mask.test(slot) {
            return Ok(());
        }
        self.core().check_instance(instance, "disable")?;
        self.bus_mut().write(RegField::GlobalEnable, 0);
        self.bus_mut().write(RegField::IrqMask, 0);
        let core = self.core_mut();
        core.state.clear(StageState::RUN);
        core.configuring = false;
        Ok(())
    }

    /// Validate and apply a parameter-set diff; only changed fields are
    /// written through.
    fn set_param(&mut self, region: &ParamRegion, instance: u32, mask: StageMask) -> HwResult<()> {
        let slot = self.core().slot;
        if !mask.test(slot) {
            return Ok(());
        }
        self.core().check_instance(instance, "set_param")?;
        if !self.core().state.test(StageState::INIT) {
            return Err(HwError::InvalidState {
                slot,
                op: "set_param",
                reason: "stage not initialized",
            });
        }
        for index in region.changed_indices() {
            self.validate_param(index, region.values[index])?;
        }
        for index in region.changed_indices() {
            self.bus_mut()
                .write(RegField::Param(index as u8), region.values[index]);
        }
        Ok(())
    }

    /// Commit one frame's parameters and buffer addresses to the hardware.
    /// Marks the frame's obligations toward this stage.
    fn shot(&mut self, frame: &mut Frame) -> HwResult<()> {
        let slot = self.core().slot;
        if !self.core().state.test(StageState::INIT) {
            return Err(HwError::InvalidState {
                slot,
                op: "shot",
                reason: "stage not initialized",
            });
        }
        match frame.frame_type {
            FrameType::External => {
                if frame.obligations.req.test(slot) {
                    frame.obligations.core.set(slot);
                }
                frame.obligations.out = frame.req_ports.intersect(self.output_ports());
            }
            FrameType::Internal => {
                // Internal frames still owe a core-end so they can be
                // reclaimed, but never raise output completions.
                frame.obligations.core.set(slot);
                frame.obligations.out = PortMask::empty();
            }
            FrameType::Late => {
                return Err(HwError::InvalidState {
                    slot,
                    op: "shot",
                    reason: "late frame must not reach the hardware",
                });
            }
        }
        self.bus_mut().write(RegField::ShotFcount, frame.fcount);
        for (i, plane) in frame.planes.iter().enumerate() {
            if plane.dva != 0 {
                self.bus_mut()
                    .write(RegField::PlaneAddr(i as u8), plane.dva as u32);
            }
        }
        self.program_shot(frame)?;
        self.bus_mut().write(RegField::CorexTrigger, 1);
        self.core_mut().state.set(StageState::CONFIG);
        Ok(())
    }

    /// Copy back hardware-produced per-frame metadata.
    fn get_meta(&mut self, frame: &mut Frame) -> HwResult<()> {
        if !self.core().state.test(StageState::OPEN) {
            return Err(HwError::InvalidState {
                slot: self.core().slot,
                op: "get_meta",
                reason: "stage not open",
            });
        }
        frame.meta.hw_fcount = self.bus_mut().read(RegField::MetaFcount);
        frame.meta.status_raw = self.bus_mut().read(RegField::MetaStatus);
        Ok(())
    }

    /// Tear down stage-private data. Refuses while references or frames are
    /// outstanding; the refusal is an error for the caller to log, not a
    /// fatal condition.
    fn close(&mut self, instance: u32) -> HwResult<()> {
        let slot = self.core().slot;
        if !self.core().state.test(StageState::OPEN) {
            return Err(HwError::InvalidState {
                slot,
                op: "close",
                reason: "stage not open",
            });
        }
        self.core().check_instance(instance, "close")?;
        if self.core().pool.has_pending() {
            let pending = self.core().pool.pending();
            warn!("{}: close refused, {} frame(s) in flight", slot, pending);
            return Err(HwError::Busy { slot, pending });
        }
        let core = self.core_mut();
        core.open_count -= 1;
        if core.open_count == 0 {
            core.pool.flush();
            core.setfiles.clear();
            core.state.reset();
            core.instance = None;
            core.group = None;
            core.configuring = false;
            core.last_done_fcount = 0;
            core.shadow_reset_done = false;
        }
        Ok(())
    }
}
