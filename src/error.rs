// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use thiserror::Error;

use crate::group::GroupId;
use crate::hw_stage::HwSlot;

pub type HwResult<T> = std::result::Result<T, HwError>;

/// Error taxonomy for the pipeline scheduler.
///
/// Configuration errors are returned to the caller and never retried.
/// Timing conditions (late shots, fcount mismatch at frame-start) are not
/// errors; they are absorbed by the Late-frame path and logged. True
/// accounting violations (a frame leaking out of its pool) panic instead of
/// returning a variant here, because they indicate state corruption that no
/// caller can recover from.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HwError {
    #[error("{slot}: invalid state for {op}: {reason}")]
    InvalidState {
        slot: HwSlot,
        op: &'static str,
        reason: &'static str,
    },

    #[error("no stage registered in slot {0}")]
    StageNotRegistered(HwSlot),

    #[error("no group chain configured for instance {instance}")]
    InvalidGroup { instance: u32 },

    #[error("group {group} is not a member of instance {instance}'s chain")]
    GroupNotInChain { group: GroupId, instance: u32 },

    #[error("{slot}: parameter {index} out of range (value {value})")]
    ParamOutOfRange {
        slot: HwSlot,
        index: usize,
        value: u32,
    },

    #[error("{slot}: free pool exhausted")]
    PoolExhausted { slot: HwSlot },

    #[error("{slot}: no frame with fcount {fcount} in {queue}")]
    FrameNotFound {
        slot: HwSlot,
        fcount: u32,
        queue: &'static str,
    },

    #[error("{slot}: frame {fcount} found but obligation flag is not set")]
    InvalidFlag { slot: HwSlot, fcount: u32 },

    #[error("{slot}: {pending} frame(s) still pending after stop retry budget")]
    StopTimeout { slot: HwSlot, pending: usize },

    #[error("{slot}: busy, {pending} frame(s) still in flight")]
    Busy { slot: HwSlot, pending: usize },

    #[error("{slot}: no setfile loaded for scenario {scenario}")]
    SetfileMissing { slot: HwSlot, scenario: u32 },

    #[error("completion queue full, message dropped")]
    NotifyOverflow,
}
