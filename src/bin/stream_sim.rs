// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Simulates a streaming session over mock register buses: builds a
// 3AA -> ISP -> MCS chain, submits shots and fires the interrupt sequence a
// real sensor would produce, then prints the completion messages.

use std::sync::Arc;

use clap::Parser;
use log::info;

use fimc_pipeline::dispatcher::HardwareDispatcher;
use fimc_pipeline::frame::{PortMask, ShotRequest};
use fimc_pipeline::group::{GroupChain, GroupId};
use fimc_pipeline::hw_api::MockBus;
use fimc_pipeline::hw_stage::HwSlot;
use fimc_pipeline::interrupt::IrqStatus;
use fimc_pipeline::isp_stage::IspStage;
use fimc_pipeline::notify::ChannelSink;
use fimc_pipeline::registry::HardwareRegistry;
use fimc_pipeline::scaler_stage::ScalerStage;
use fimc_pipeline::taa_stage::TaaStage;

#[derive(Parser)]
struct Args {
    /// Number of frames to stream.
    #[arg(long, default_value = "8")]
    frames: u32,

    /// Frames each stage's pool can hold.
    #[arg(long, default_value = "4")]
    pool_capacity: usize,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let instance = 0;

    let mut registry = HardwareRegistry::new();
    registry.install(Box::new(TaaStage::new(
        HwSlot::Taa0,
        args.pool_capacity,
        Box::new(MockBus::new(HwSlot::Taa0)),
    )));
    registry.install(Box::new(IspStage::new(
        args.pool_capacity,
        Box::new(MockBus::new(HwSlot::Isp0)),
    )));
    registry.install(Box::new(ScalerStage::new(
        args.pool_capacity,
        Box::new(MockBus::new(HwSlot::Scaler)),
    )));

    let (sink, mut completions) = ChannelSink::new(64);
    let dispatcher = Arc::new(HardwareDispatcher::new(registry, Arc::new(sink)));

    let chain = GroupChain::build(
        instance,
        &[(GroupId::Taa0, true), (GroupId::Isp0, true), (GroupId::Mcs0, true)],
    )
    .unwrap();
    dispatcher.set_chain(chain);
    for gid in [GroupId::Taa0, GroupId::Isp0, GroupId::Mcs0] {
        dispatcher.open(gid, instance, false, 0).unwrap();
    }
    dispatcher.stream_on(instance).unwrap();

    let mut taa_irq = dispatcher.irq_line(HwSlot::Taa0).unwrap();
    let mut isp_irq = dispatcher.irq_line(HwSlot::Isp0).unwrap();
    let mut mcs_irq = dispatcher.irq_line(HwSlot::Scaler).unwrap();

    let printer = tokio::spawn(async move {
        while let Some(msg) = completions.recv().await {
            info!(
                "completion: F{} {} {:?} ({:?})",
                msg.fcount, msg.group, msg.status, msg.reason
            );
        }
    });

    let submit = |fcount: u32| {
        let mut req = ShotRequest::new(instance, fcount);
        req.out_ports = PortMask::of(&[0]);
        dispatcher.group_shot(instance, GroupId::Mcs0, &req).unwrap();
    };

    // The first shot is programmed directly; afterwards the sensor paces the
    // leader and each config-lock pulls the next queued request.
    submit(1);
    for fcount in 1..=args.frames {
        taa_irq.handle(IrqStatus::new(IrqStatus::FRAME_START), fcount);
        if fcount < args.frames {
            submit(fcount + 1);
        }
        taa_irq.handle(IrqStatus::new(IrqStatus::CONFIG_LOCK), fcount + 1);
        taa_irq.handle(IrqStatus::new(IrqStatus::COREX_END), fcount);
        taa_irq.handle(IrqStatus::new(IrqStatus::FRAME_END), fcount);

        isp_irq.handle(IrqStatus::new(IrqStatus::FRAME_START), fcount);
        isp_irq.handle(IrqStatus::new(IrqStatus::FRAME_END), fcount);

        mcs_irq.handle(IrqStatus::new(IrqStatus::FRAME_START), fcount);
        mcs_irq.handle(
            IrqStatus::new(IrqStatus::FRAME_END | IrqStatus::dma_done(0)),
            fcount,
        );
    }

    let forced = dispatcher.stream_off(instance).unwrap();
    info!("streamed {} frame(s), {} force-completed", args.frames, forced);

    // The irq lines hold dispatcher handles; the completion channel closes
    // once the last one is gone, letting the printer task finish.
    drop(taa_irq);
    drop(isp_irq);
    drop(mcs_irq);
    drop(dispatcher);
    let _ = printer.await;
}
