// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! The hardware dispatcher: walks the group topology to issue per-stage shot
//! commands, and reconciles interrupt-reported completions against each
//! stage's frame queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{HwError, HwResult};
use crate::frame::{Frame, FrameType, ShotRequest, ShotResult, StageMask};
use crate::frame_pool::QueueId;
use crate::group::{GroupChain, GroupId};
use crate::hw_api::{ParamRegion, RegField};
use crate::hw_stage::{HardwareStage, HwSlot, StageState};
use crate::notify::{CompletionMsg, CompletionReason, NotifySink};
use crate::registry::HardwareRegistry;
use crate::setfile::SetfileEntry;

/// Which completion a hardware event reports: the stage core finishing a
/// frame, or one DMA output port finishing its write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputId {
    CoreEnd,
    Port(u8),
}

/// Bounded retry budget for stop paths. Never an unbounded loop; running out
/// of budget is a typed, reportable error.
#[derive(Copy, Clone, Debug)]
pub struct StopPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        StopPolicy {
            retries: 150,
            interval: Duration::from_millis(1),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopMode {
    /// Wait for in-flight frames to complete naturally, within budget.
    Wait,
    /// Force-complete whatever is still queued after the wait budget.
    Force,
}

const MAX_INSTANCE: u32 = 32;

pub struct HardwareDispatcher {
    registry: HardwareRegistry,
    chains: Mutex<HashMap<u32, GroupChain>>,
    sink: Arc<dyn NotifySink>,
    stop_policy: StopPolicy,
    /// One bit per streaming instance.
    streaming: AtomicU32,
    /// Instances whose next OTF shot must resynchronize the chain counters.
    resync_pending: AtomicU32,
}

impl HardwareDispatcher {
    pub fn new(registry: HardwareRegistry, sink: Arc<dyn NotifySink>) -> HardwareDispatcher {
        HardwareDispatcher {
            registry,
            chains: Mutex::new(HashMap::new()),
            sink,
            stop_policy: StopPolicy::default(),
            streaming: AtomicU32::new(0),
            resync_pending: AtomicU32::new(0),
        }
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> HardwareDispatcher {
        self.stop_policy = policy;
        self
    }

    pub fn registry(&self) -> &HardwareRegistry {
        &self.registry
    }

    fn lock_chains(&self) -> MutexGuard<'_, HashMap<u32, GroupChain>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instance_bit(instance: u32) -> u32 {
        assert!(instance < MAX_INSTANCE, "instance {} out of range", instance);
        1 << instance
    }

    // ---- configuration surface -------------------------------------------

    /// Bind a stream's pipeline topology. Read-only once streaming starts.
    pub fn set_chain(&self, chain: GroupChain) {
        self.lock_chains().insert(chain.instance(), chain);
    }

    /// Open one stage and bind it to its group slot in the chain.
    pub fn open(
        &self,
        group_id: GroupId,
        instance: u32,
        reprocessing: bool,
        module_id: u32,
    ) -> HwResult<()> {
        let chains = self.lock_chains();
        let chain = chains
            .get(&instance)
            .ok_or(HwError::InvalidGroup { instance })?;
        let group = *chain.get(group_id)?;
        drop(chains);

        let mut guard = self.registry.stage(group_id.hw_slot())?;
        let stage = &mut **guard;
        stage.open(instance)?;
        stage.init(&group, reprocessing, module_id)
    }

    pub fn close(&self, group_id: GroupId, instance: u32) -> HwResult<()> {
        let mut guard = self.registry.stage(group_id.hw_slot())?;
        guard.close(instance)
    }

    pub fn set_param(
        &self,
        group_id: GroupId,
        region: &ParamRegion,
        instance: u32,
        mask: StageMask,
    ) -> HwResult<()> {
        let mut guard = self.registry.stage(group_id.hw_slot())?;
        guard.set_param(region, instance, mask)
    }

    pub fn load_setfile(&self, group_id: GroupId, scenario: u32, entry: SetfileEntry) -> HwResult<()> {
        let mut guard = self.registry.stage(group_id.hw_slot())?;
        guard.core_mut().setfiles.load(scenario, entry);
        Ok(())
    }

    pub fn apply_setfile(&self, group_id: GroupId, scenario: u32) -> HwResult<()> {
        let slot = group_id.hw_slot();
        let mut guard = self.registry.stage(slot)?;
        let stage = &mut **guard;
        let entry = stage
            .core()
            .setfiles
            .get(scenario)
            .ok_or(HwError::SetfileMissing { slot, scenario })?;
        stage.bus_mut().write(RegField::SetfileBase, entry.base as u32);
        stage.bus_mut().write(RegField::SetfileSize, entry.size);
        Ok(())
    }

    pub fn delete_setfile(&self, group_id: GroupId, scenario: u32) -> HwResult<()> {
        let slot = group_id.hw_slot();
        let mut guard = self.registry.stage(slot)?;
        if !guard.core_mut().setfiles.delete(scenario) {
            return Err(HwError::SetfileMissing { slot, scenario });
        }
        Ok(())
    }

    // ---- stream control ---------------------------------------------------

    pub fn stream_on(&self, instance: u32) -> HwResult<()> {
        let chains = self.lock_chains();
        let chain = chains
            .get(&instance)
            .ok_or(HwError::InvalidGroup { instance })?;
        let members: Vec<GroupId> = chain.members().map(|g| g.id).collect();
        let mask = StageMask::of(&members.iter().map(|g| g.hw_slot()).collect::<Vec<_>>());
        drop(chains);

        for gid in &members {
            let mut guard = self.registry.stage(gid.hw_slot())?;
            let stage = &mut **guard;
            stage.enable(instance, mask)?;
        }
        self.streaming
            .fetch_or(Self::instance_bit(instance), Ordering::Relaxed);
        self.resync_pending
            .fetch_or(Self::instance_bit(instance), Ordering::Relaxed);
        info!("stream on, instance {}", instance);
        Ok(())
    }

    /// Stop the stream, force-completing whatever is still in flight. Every
    /// frame reaches Free before this returns; the count of frames that had
    /// to be force-completed is reported rather than treated as failure.
    pub fn stream_off(&self, instance: u32) -> HwResult<usize> {
        self.streaming
            .fetch_and(!Self::instance_bit(instance), Ordering::Relaxed);

        let chains = self.lock_chains();
        let chain = chains
            .get(&instance)
            .ok_or(HwError::InvalidGroup { instance })?;
        let members: Vec<GroupId> = chain.members().map(|g| g.id).collect();
        let mask = StageMask::of(&members.iter().map(|g| g.hw_slot()).collect::<Vec<_>>());
        drop(chains);

        let mut forced = 0;
        for gid in &members {
            let mut guard = self.registry.stage(gid.hw_slot())?;
            let stage = &mut **guard;
            forced += self.force_drain(stage);
            stage.disable(instance, mask)?;
        }
        if forced > 0 {
            warn!("stream off, instance {}: {} frame(s) force-completed", instance, forced);
        } else {
            info!("stream off, instance {}", instance);
        }
        Ok(forced)
    }

    pub fn is_streaming(&self, instance: u32) -> bool {
        self.streaming.load(Ordering::Relaxed) & Self::instance_bit(instance) != 0
    }

    pub fn process_start(&self, instance: u32, mask: StageMask) -> HwResult<()> {
        let chains = self.lock_chains();
        let chain = chains
            .get(&instance)
            .ok_or(HwError::InvalidGroup { instance })?;
        let members: Vec<HwSlot> = chain.members().map(|g| g.id.hw_slot()).collect();
        drop(chains);

        for slot in members.into_iter().filter(|s| mask.test(*s)) {
            let mut guard = self.registry.stage(slot)?;
            guard.enable(instance, mask)?;
        }
        Ok(())
    }

    /// Stop processing on the masked stages. `Wait` waits for natural
    /// completion within the retry budget; `Force` additionally
    /// force-completes whatever remains once the budget is spent.
    pub fn process_stop(&self, instance: u32, mask: StageMask, mode: StopMode) -> HwResult<()> {
        let chains = self.lock_chains();
        let chain = chains
            .get(&instance)
            .ok_or(HwError::InvalidGroup { instance })?;
        let members: Vec<HwSlot> = chain.members().map(|g| g.id.hw_slot()).collect();
        drop(chains);

        for slot in members.into_iter().filter(|s| mask.test(*s)) {
            let mut retries = self.stop_policy.retries;
            loop {
                let pending = self.registry.stage(slot)?.core().pool.pending();
                if pending == 0 {
                    break;
                }
                if retries == 0 {
                    match mode {
                        StopMode::Wait => {
                            return Err(HwError::StopTimeout { slot, pending });
                        }
                        StopMode::Force => {
                            let mut guard = self.registry.stage(slot)?;
                            let stage = &mut **guard;
                            let forced = self.force_drain(stage);
                            warn!("{}: stop forced {} frame(s)", slot, forced);
                            let left = stage.core().pool.pending();
                            if left != 0 {
                                return Err(HwError::StopTimeout { slot, pending: left });
                            }
                            break;
                        }
                    }
                }
                retries -= 1;
                thread::sleep(self.stop_policy.interval);
            }
            let mut guard = self.registry.stage(slot)?;
            guard.disable(instance, mask)?;
        }
        Ok(())
    }

    // ---- shot dispatch (child stages first) -------------------------------

    /// Submit one shot to `group_id` and every stage below it in the chain.
    /// The walk commits child stages before parent stages so earlier
    /// pipeline stages are always armed first.
    pub fn group_shot(&self, instance: u32, group_id: GroupId, req: &ShotRequest) -> HwResult<()> {
        let chains = self.lock_chains();
        let chain = chains
            .get(&instance)
            .ok_or(HwError::InvalidGroup { instance })?;
        let order = chain.child_first_upto(group_id)?;
        let groups: Vec<_> = order
            .iter()
            .map(|gid| chain.get(*gid).map(|g| *g))
            .collect::<HwResult<_>>()?;
        let otf_chain = chain.has_otf_coupling();
        let all_members: Vec<HwSlot> = chain.members().map(|g| g.id.hw_slot()).collect();
        drop(chains);

        // First OTF shot after stream-on: re-sync every in-chain counter to
        // fcount - 1 so interrupt-driven counting starts aligned.
        if otf_chain {
            let bit = Self::instance_bit(instance);
            if self.resync_pending.fetch_and(!bit, Ordering::Relaxed) & bit != 0 {
                let base = req.fcount.wrapping_sub(1);
                for slot in &all_members {
                    if let Ok(guard) = self.registry.stage(*slot) {
                        guard.core().counters.set_all(base);
                    }
                }
                debug!("[F{}] otf counter resync to {}", req.fcount, base);
            }
        }

        for group in groups {
            let slot = group.id.hw_slot();
            let mut guard = self.registry.stage(slot)?;
            let stage = &mut **guard;

            let core = stage.core();
            if !core.state.test(StageState::OPEN) || core.instance != Some(instance) {
                debug!("{}: [F{}] skip shot, not open for instance {}", slot, req.fcount, instance);
                continue;
            }

            let mut frame = stage
                .core_mut()
                .pool
                .acquire(QueueId::Free)
                .ok_or(HwError::PoolExhausted { slot })?;
            frame.load_request(req);
            frame.reports_done = group.id == group_id;

            let core = stage.core();
            let duplicate = core
                .pool
                .find(QueueId::Process, |f| f.fcount == req.fcount)
                .is_some()
                || core
                    .pool
                    .find(QueueId::Complete, |f| f.fcount == req.fcount)
                    .is_some();
            if duplicate || core.last_done_fcount >= req.fcount {
                warn!(
                    "{}: [F{}] late shot (last done F{}, duplicate {})",
                    slot, req.fcount, core.last_done_fcount, duplicate
                );
                frame.frame_type = FrameType::Late;
                frame.result = ShotResult::LateShot;
                stage.core_mut().pool.release(frame, QueueId::Late);
                continue;
            }

            if group.otf_input && group.is_leader() && stage.core().state.test(StageState::CONFIG) {
                // Once the leader is configured the hardware paces it: the
                // config-lock event will promote this frame to Process and
                // issue the shot. Only the very first shot goes straight to
                // the registers.
                stage.core_mut().pool.release(frame, QueueId::Request);
            } else {
                if let Err(e) = stage.shot(&mut frame) {
                    // Failed shots leave the frame in Free, never partially
                    // enqueued.
                    frame.reset();
                    stage.core_mut().pool.release(frame, QueueId::Free);
                    return Err(e);
                }
                stage.core_mut().pool.release(frame, QueueId::Process);
            }
        }
        Ok(())
    }

    // ---- completion reconciliation (interrupt entry points) ---------------

    fn irq_gate(stage: &dyn HardwareStage, what: &'static str) -> bool {
        let core = stage.core();
        if !core.state.test(StageState::CONFIG) {
            info!("{}: ignore {} before hw config", core.slot, what);
            return false;
        }
        if !core.state.test(StageState::OPEN) || !core.state.test(StageState::RUN) {
            error!("{}: {} in invalid hw state", core.slot, what);
            return false;
        }
        true
    }

    /// Config-lock: the per-frame registers are latched; prepare the next
    /// frame. Pops the client's queued request, or synthesizes an Internal
    /// frame so an OTF chain never starves.
    pub fn config_lock(&self, slot: HwSlot, instance: u32, fcount: u32) -> HwResult<()> {
        let mut guard = self.registry.stage(slot)?;
        let stage = &mut **guard;
        if !Self::irq_gate(stage, "config-lock") {
            return Ok(());
        }
        stage.core().counters.cl.fetch_add(1, Ordering::Relaxed);

        let core = stage.core();
        let duplicate = core
            .pool
            .find(QueueId::Process, |f| f.fcount == fcount)
            .is_some()
            || core
                .pool
                .find(QueueId::Complete, |f| f.fcount == fcount)
                .is_some();
        if duplicate {
            warn!("{}: [F{}] duplicate config-lock ignored", slot, fcount);
            return Ok(());
        }

        // A queued client request always wins; Internal frames exist purely
        // to keep OTF-coupled hardware fed.
        let mut frame = match stage.core_mut().pool.acquire(QueueId::Request) {
            Some(frame) => frame,
            None => {
                let mut frame = stage
                    .core_mut()
                    .pool
                    .acquire(QueueId::Free)
                    .ok_or(HwError::PoolExhausted { slot })?;
                frame.reset();
                frame.fcount = fcount;
                frame.rcount = fcount;
                frame.instance = instance;
                frame.frame_type = FrameType::Internal;
                debug!("{}: [F{}] internal shot", slot, fcount);
                frame
            }
        };
        if frame.fcount != fcount {
            debug!(
                "{}: [F{}] config-lock while next request is F{}",
                slot, fcount, frame.fcount
            );
        }

        stage.core_mut().configuring = true;
        if let Err(e) = stage.shot(&mut frame) {
            frame.reset();
            stage.core_mut().pool.release(frame, QueueId::Free);
            return Err(e);
        }
        stage.core_mut().pool.release(frame, QueueId::Process);
        Ok(())
    }

    /// Frame-start: hardware began processing the head Process frame.
    pub fn frame_start(&self, slot: HwSlot, fcount: u32) -> HwResult<()> {
        let mut guard = self.registry.stage(slot)?;
        let stage = &mut **guard;
        if !Self::irq_gate(stage, "frame-start") {
            return Ok(());
        }
        stage.core().counters.fs.fetch_add(1, Ordering::Relaxed);

        let frame = match stage.core_mut().pool.acquire(QueueId::Process) {
            Some(frame) => frame,
            None => {
                error!("{}: [F{}] frame-start with empty process queue", slot, fcount);
                return Err(HwError::FrameNotFound {
                    slot,
                    fcount,
                    queue: "process",
                });
            }
        };
        if frame.fcount != fcount {
            // Late/ahead timing condition, not an error.
            warn!(
                "{}: [F{}] frame-start fcount mismatch (queued F{})",
                slot, fcount, frame.fcount
            );
        }
        stage.core_mut().configuring = false;
        stage.core_mut().pool.release(frame, QueueId::Complete);
        Ok(())
    }

    /// Frame-end / per-output completion, the authoritative "done" signals.
    pub fn frame_done(
        &self,
        slot: HwSlot,
        fcount: u32,
        output: OutputId,
        status: ShotResult,
    ) -> HwResult<()> {
        let mut guard = self.registry.stage(slot)?;
        let stage = &mut **guard;
        if !Self::irq_gate(stage, "frame-done") {
            return Ok(());
        }
        match output {
            OutputId::CoreEnd => self.core_end(stage, fcount, status),
            OutputId::Port(port) => self.dma_done(stage, port, fcount, status),
        }
    }

    fn core_end(
        &self,
        stage: &mut dyn HardwareStage,
        fcount: u32,
        status: ShotResult,
    ) -> HwResult<()> {
        let slot = stage.core().slot;
        let counters = &stage.core().counters;
        counters.fe.fetch_add(1, Ordering::Relaxed);
        if counters.fs() < counters.fe() {
            error!(
                "{}: [F{}] fs {} < fe {}",
                slot,
                fcount,
                counters.fs(),
                counters.fe()
            );
        }

        let core = stage.core();
        let head_is_it = core
            .pool
            .peek(QueueId::Complete)
            .map(|f| f.fcount == fcount && f.obligations.core.test(slot))
            .unwrap_or(false);
        if !head_is_it {
            // The reported fcount belongs to an out-of-order frame.
            match core.pool.find(QueueId::Complete, |f| f.fcount == fcount) {
                None => {
                    error!("{}: [F{}] core-end for unknown frame", slot, fcount);
                    return Err(HwError::FrameNotFound {
                        slot,
                        fcount,
                        queue: "complete",
                    });
                }
                Some(f) if !f.obligations.core.test(slot) => {
                    error!("{}: [F{}] core-end without core obligation", slot, fcount);
                    return Err(HwError::InvalidFlag { slot, fcount });
                }
                Some(_) => {
                    warn!("{}: [F{}] out-of-order core-end", slot, fcount);
                }
            }
        }

        let mut frame = match stage
            .core_mut()
            .pool
            .take_if(QueueId::Complete, |f| f.fcount == fcount)
        {
            Some(frame) => frame,
            None => {
                return Err(HwError::FrameNotFound {
                    slot,
                    fcount,
                    queue: "complete",
                })
            }
        };

        // The frame is out of its queue now; on any failure it goes back
        // before the error propagates, so the pool never loses a slot.
        if let Err(e) = stage.get_meta(&mut frame) {
            stage.core_mut().pool.requeue_front(frame, QueueId::Complete);
            return Err(e);
        }

        let core = stage.core();
        if core.otf_input && !core.leader && core.state.test(StageState::RUN) {
            if let Err(e) = stage.shadow_handoff(fcount) {
                stage.core_mut().pool.requeue_front(frame, QueueId::Complete);
                return Err(e);
            }
        }

        frame.obligations.core.clear(slot);
        if status != ShotResult::Success {
            frame.result = status;
        }
        stage.core_mut().last_done_fcount = fcount;

        self.finish_or_requeue(stage, frame);
        Ok(())
    }

    fn dma_done(
        &self,
        stage: &mut dyn HardwareStage,
        port: u8,
        fcount: u32,
        status: ShotResult,
    ) -> HwResult<()> {
        let slot = stage.core().slot;
        match stage.core().pool.find(QueueId::Complete, |f| f.fcount == fcount) {
            None => {
                error!("{}: [F{}] dma-done out{} for unknown frame", slot, fcount, port);
                return Err(HwError::FrameNotFound {
                    slot,
                    fcount,
                    queue: "complete",
                });
            }
            Some(f) if !f.obligations.out.test(port) => {
                error!("{}: [F{}] dma-done out{} without obligation", slot, fcount, port);
                return Err(HwError::InvalidFlag { slot, fcount });
            }
            Some(_) => {}
        }

        let mut frame = match stage
            .core_mut()
            .pool
            .take_if(QueueId::Complete, |f| f.fcount == fcount)
        {
            Some(frame) => frame,
            None => {
                return Err(HwError::FrameNotFound {
                    slot,
                    fcount,
                    queue: "complete",
                })
            }
        };

        frame.obligations.out.clear(port);
        if status != ShotResult::Success {
            frame.obligations.ndone.set(port);
            frame.result = status;
        }
        if frame.frame_type == FrameType::External {
            self.post(stage, &frame, CompletionReason::OutputDone(port));
        }
        self.finish_or_requeue(stage, frame);
        Ok(())
    }

    /// Recycle the frame if everything is paid off; otherwise return it to
    /// Complete to wait for its remaining completions. Reinsertion is at the
    /// head, so Complete is not fcount-sorted; reconciliation looks frames up
    /// by fcount, never by position alone.
    fn finish_or_requeue(&self, stage: &mut dyn HardwareStage, mut frame: Frame) {
        if frame.obligations.all_clear() {
            if !frame.notified {
                frame.notified = true;
                if frame.frame_type == FrameType::External && frame.reports_done {
                    self.post(stage, &frame, CompletionReason::FrameDone);
                }
            }
            frame.reset();
            stage.core_mut().pool.release(frame, QueueId::Free);
        } else {
            stage.core_mut().pool.requeue_front(frame, QueueId::Complete);
        }
    }

    fn post(&self, stage: &dyn HardwareStage, frame: &Frame, reason: CompletionReason) {
        let core = stage.core();
        let group = match core.group {
            Some(group) => group,
            None => {
                error!("{}: completion for unbound stage dropped", core.slot);
                return;
            }
        };
        let msg = CompletionMsg {
            instance: frame.instance,
            group,
            fcount: frame.fcount,
            rcount: frame.rcount,
            status: frame.result,
            reason,
        };
        if self.sink.post(msg).is_err() {
            error!("{}: [F{}] completion queue full, message dropped", core.slot, frame.fcount);
        }
    }

    /// A delayed config-lock poisons both the frame in flight and the frame
    /// being configured; mark them so their completions report the delay.
    pub fn config_lock_delay(&self, slot: HwSlot) -> HwResult<()> {
        let mut guard = self.registry.stage(slot)?;
        let core = guard.core_mut();
        if let Some(frame) = core.pool.peek_mut(QueueId::Complete) {
            frame.result = ShotResult::ConfigLockDelay;
        }
        if let Some(frame) = core.pool.peek_mut(QueueId::Process) {
            frame.result = ShotResult::ConfigLockDelay;
        }
        Ok(())
    }

    // ---- forced completion -----------------------------------------------

    /// Force-complete every frame this stage still holds, bypassing the
    /// interrupt-originated match. Used by stop and teardown so no frame is
    /// ever left permanently owed.
    pub fn frame_ndone(&self, slot: HwSlot, _instance: u32) -> HwResult<usize> {
        let mut guard = self.registry.stage(slot)?;
        let stage = &mut **guard;
        Ok(self.force_drain(stage))
    }

    fn force_drain(&self, stage: &mut dyn HardwareStage) -> usize {
        let mut forced = 0;
        for queue in [QueueId::Request, QueueId::Process, QueueId::Complete, QueueId::Late] {
            while let Some(mut frame) = stage.core_mut().pool.acquire(queue) {
                frame.obligations.force_clear();
                if frame.result == ShotResult::Success {
                    frame.result = ShotResult::Unprocessed;
                }
                // Late frames are still client submissions; only Internal
                // frames complete without a message.
                if !frame.notified && frame.frame_type != FrameType::Internal && frame.reports_done
                {
                    self.post(stage, &frame, CompletionReason::FrameDone);
                }
                frame.reset();
                stage.core_mut().pool.release(frame, QueueId::Free);
                forced += 1;
            }
        }
        if forced > 0 {
            stage.core_mut().configuring = false;
        }
        forced
    }
}
