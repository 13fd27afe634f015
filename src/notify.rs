// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Completion messages delivered to the client layer, decoupled from
//! interrupt context through a bounded queue.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{HwError, HwResult};
use crate::frame::ShotResult;
use crate::group::GroupId;

/// Why a completion message was posted: the single final frame-done, or one
/// message per finished DMA output port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionReason {
    FrameDone,
    OutputDone(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompletionMsg {
    pub instance: u32,
    pub group: GroupId,
    pub fcount: u32,
    pub rcount: u32,
    pub status: ShotResult,
    pub reason: CompletionReason,
}

/// Sink for completion messages. Implementations must be callable from
/// interrupt context: bounded, non-blocking.
pub trait NotifySink: Send + Sync {
    fn post(&self, msg: CompletionMsg) -> HwResult<()>;
}

/// Production sink backed by a bounded tokio channel; the client layer
/// consumes the receiver asynchronously.
pub struct ChannelSink {
    tx: mpsc::Sender<CompletionMsg>,
}

impl ChannelSink {
    pub fn new(depth: usize) -> (ChannelSink, mpsc::Receiver<CompletionMsg>) {
        let (tx, rx) = mpsc::channel(depth);
        (ChannelSink { tx }, rx)
    }
}

impl NotifySink for ChannelSink {
    fn post(&self, msg: CompletionMsg) -> HwResult<()> {
        self.tx.try_send(msg).map_err(|_| HwError::NotifyOverflow)
    }
}

/// Test double recording every posted message.
#[derive(Default)]
pub struct CountingSink {
    msgs: Mutex<Vec<CompletionMsg>>,
}

impl CountingSink {
    pub fn new() -> CountingSink {
        CountingSink::default()
    }

    pub fn messages(&self) -> Vec<CompletionMsg> {
        self.msgs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn frame_done_count(&self, fcount: u32) -> usize {
        self.messages()
            .iter()
            .filter(|m| m.fcount == fcount && m.reason == CompletionReason::FrameDone)
            .count()
    }
}

impl NotifySink for CountingSink {
    fn post(&self, msg: CompletionMsg) -> HwResult<()> {
        self.msgs.lock().unwrap_or_else(|e| e.into_inner()).push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(fcount: u32) -> CompletionMsg {
        CompletionMsg {
            instance: 0,
            group: GroupId::Taa0,
            fcount,
            rcount: fcount,
            status: ShotResult::Success,
            reason: CompletionReason::FrameDone,
        }
    }

    #[test]
    fn channel_sink_is_bounded_and_non_blocking() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.post(msg(1)).unwrap();
        assert_eq!(sink.post(msg(2)).unwrap_err(), HwError::NotifyOverflow);
        assert_eq!(rx.try_recv().unwrap().fcount, 1);
        sink.post(msg(2)).unwrap();
    }

    #[test]
    fn counting_sink_counts_frame_done_per_fcount() {
        let sink = CountingSink::new();
        sink.post(msg(3)).unwrap();
        let mut out = msg(3);
        out.reason = CompletionReason::OutputDone(1);
        sink.post(out).unwrap();
        assert_eq!(sink.frame_done_count(3), 1);
        assert_eq!(sink.messages().len(), 2);
    }
}
