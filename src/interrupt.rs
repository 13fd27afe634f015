// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Per-stage interrupt lines. The external interrupt layer registers one
//! line per physical stage at probe time and guarantees invocations for the
//! same stage never overlap; lines for different stages may run
//! concurrently.
//!
//! A single status word can report several events at once ("interrupt
//! overlapped"); the line consumes them in pipeline order through a small
//! per-stage phase automaton, dropping out-of-sequence bits with a log.

use std::sync::Arc;

use log::{error, warn};

use crate::dispatcher::{HardwareDispatcher, OutputId};
use crate::error::HwResult;
use crate::frame::ShotResult;
use crate::hw_stage::HwSlot;

/// Decoded interrupt status bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IrqStatus(u32);

impl IrqStatus {
    pub const FRAME_START: u32 = 1 << 0;
    /// Frame-line event: per-frame configuration registers are latched.
    pub const CONFIG_LOCK: u32 = 1 << 1;
    pub const COREX_END: u32 = 1 << 2;
    pub const FRAME_END: u32 = 1 << 3;
    pub const HW_ERR: u32 = 1 << 4;
    const DMA_SHIFT: u32 = 8;

    pub fn new(bits: u32) -> IrqStatus {
        IrqStatus(bits)
    }

    pub fn dma_done(port: u8) -> u32 {
        1 << (Self::DMA_SHIFT + port as u32)
    }

    pub fn occurred(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    fn dma_ports(&self) -> impl Iterator<Item = u8> + '_ {
        (0..8u8).filter(move |p| self.occurred(Self::dma_done(*p)))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum EventPhase {
    FrameStart,
    ConfigLock,
    CorexEnd,
    FrameEnd,
}

/// One stage's interrupt handler state.
pub struct IrqLine {
    slot: HwSlot,
    instance: u32,
    /// Config-lock paced: only an OTF leader sequences CL/COREX events.
    cl_paced: bool,
    dispatcher: Arc<HardwareDispatcher>,
    phase: EventPhase,
}

impl HardwareDispatcher {
    /// Build the interrupt line to register with the external layer for
    /// `slot`. Reads the stage's OTF binding, so call after `open`.
    pub fn irq_line(self: &Arc<Self>, slot: HwSlot) -> HwResult<IrqLine> {
        let (instance, cl_paced) = {
            let guard = self.registry().stage(slot)?;
            let core = guard.core();
            (core.instance.unwrap_or(0), core.otf_input && core.leader)
        };
        Ok(IrqLine {
            slot,
            instance,
            cl_paced,
            dispatcher: Arc::clone(self),
            phase: EventPhase::FrameEnd,
        })
    }
}

impl IrqLine {
    pub fn slot(&self) -> HwSlot {
        self.slot
    }

    /// Consume one raw status word. `fcount` is the hardware's frame counter
    /// at interrupt time.
    pub fn handle(&mut self, status: IrqStatus, fcount: u32) {
        if status.occurred(IrqStatus::HW_ERR) {
            error!("{}: [F{}] hw error, status {:#x}", self.slot, fcount, status.0);
        }

        let mut fs = status.occurred(IrqStatus::FRAME_START);
        let mut cl = status.occurred(IrqStatus::CONFIG_LOCK);
        let mut fc = status.occurred(IrqStatus::COREX_END);
        let mut fe = status.occurred(IrqStatus::FRAME_END);

        let mut pending = fs as u32 + cl as u32 + fe as u32;
        if pending > 1 {
            warn!(
                "{}: [F{}] interrupt overlapped, fs {} cl {} fc {} fe {}",
                self.slot, fcount, fs, cl, fc, fe
            );
        }

        if self.cl_paced {
            if fc {
                pending += 1;
            }
            while pending > 0 {
                pending -= 1;
                match self.phase {
                    EventPhase::FrameEnd => {
                        if fs {
                            self.phase = EventPhase::FrameStart;
                            self.report(self.dispatcher.frame_start(self.slot, fcount));
                            fs = false;
                        }
                    }
                    EventPhase::FrameStart => {
                        if cl {
                            self.phase = EventPhase::ConfigLock;
                            if fc {
                                warn!(
                                    "{}: [F{}] clear invalid corex-end event",
                                    self.slot, fcount
                                );
                                pending = pending.saturating_sub(1);
                                fc = false;
                            }
                            self.report(self.dispatcher.config_lock(
                                self.slot,
                                self.instance,
                                fcount,
                            ));
                            cl = false;
                        }
                    }
                    EventPhase::ConfigLock => {
                        if fc {
                            self.phase = EventPhase::CorexEnd;
                            fc = false;
                        } else if fe {
                            // The config-lock interrupt was delayed past the
                            // frame window; drop the affected frames and
                            // finish the cycle.
                            self.phase = EventPhase::FrameEnd;
                            error!("{}: [F{}] config lock isr is delayed", self.slot, fcount);
                            self.report(self.dispatcher.config_lock_delay(self.slot));
                            self.report(self.dispatcher.frame_done(
                                self.slot,
                                fcount,
                                OutputId::CoreEnd,
                                ShotResult::ConfigLockDelay,
                            ));
                            fe = false;
                        }
                    }
                    EventPhase::CorexEnd => {
                        if fe {
                            self.phase = EventPhase::FrameEnd;
                            self.report(self.dispatcher.frame_done(
                                self.slot,
                                fcount,
                                OutputId::CoreEnd,
                                ShotResult::Success,
                            ));
                            fe = false;
                        }
                    }
                }
            }
        } else {
            fc = false;
            cl = false;
            while pending > 0 {
                pending -= 1;
                match self.phase {
                    EventPhase::FrameEnd | EventPhase::ConfigLock | EventPhase::CorexEnd => {
                        if fs {
                            self.phase = EventPhase::FrameStart;
                            self.report(self.dispatcher.frame_start(self.slot, fcount));
                            fs = false;
                        }
                    }
                    EventPhase::FrameStart => {
                        if fe {
                            self.phase = EventPhase::FrameEnd;
                            self.report(self.dispatcher.frame_done(
                                self.slot,
                                fcount,
                                OutputId::CoreEnd,
                                ShotResult::Success,
                            ));
                            fe = false;
                        }
                    }
                }
            }
        }

        if fs || cl || fc || fe {
            error!(
                "{}: [F{}] skip isr, fs {} cl {} fc {} fe {}",
                self.slot, fcount, fs, cl, fc, fe
            );
        }

        for port in status.dma_ports() {
            self.report(self.dispatcher.frame_done(
                self.slot,
                fcount,
                OutputId::Port(port),
                ShotResult::Success,
            ));
        }
    }

    fn report(&self, result: HwResult<()>) {
        if let Err(e) = result {
            error!("{}: isr: {}", self.slot, e);
        }
    }
}
