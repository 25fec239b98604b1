//! Initiator and simulated target talking FCoE over an in-memory link.

mod common;

use common::{INITIATOR, read, target_id};
use fcp_codec::codec::CrcMode;
use fcp_codec::{FcoeCodec, FrameCodec};
use fcp_core::{FcId, Wwn};
use fcp_initiator::sim::pattern;
use fcp_initiator::{
    CompletionCode, HostEventKind, HostEventReceiver, InitiatorBuilder, IssueMode, LinkPort,
    TargetSim,
};
use fcp_session::ServiceParams;
use fcp_transport::{LinkAccessor, MemoryLink};
use std::sync::Arc;
use std::time::Duration;

/// Answer every frame arriving on `link` from `sim`.
async fn serve(mut link: MemoryLink, mut sim: TargetSim) {
    let codec = FcoeCodec::new(CrcMode::Verify);
    while let Ok(Some(bytes)) = link.recv().await {
        let frame = match codec.decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("target dropped frame: {}", e);
                continue;
            }
        };
        for reply in sim.handle(frame) {
            let Ok(bytes) = codec.encode(&reply) else {
                continue;
            };
            if link.send(bytes).await.is_err() {
                return;
            }
        }
    }
}

async fn next_of(events: &mut HostEventReceiver, kind: HostEventKind) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if event.kind == kind {
                return;
            }
        }
        panic!("event queue closed before {:?}", kind);
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("no {:?} event", kind));
}

#[tokio::test]
async fn test_read_over_fcoe_link() -> anyhow::Result<()> {
    common::init_logging();
    let (near, far) = MemoryLink::pair(64);
    let sim = TargetSim::new(target_id(), Wwn::new(0x2100_0024_ff00_0001));
    let target = tokio::spawn(serve(far, sim));

    let local = ServiceParams::new(
        FcId::new(INITIATOR)?,
        Wwn::new(0x2000_0000_c9aa_0001),
        Wwn::new(0x1000_0000_c9aa_0001),
    );
    let codec = Arc::new(FcoeCodec::new(CrcMode::Verify));
    let (initiator, mut events, port) =
        LinkPort::connect(near, codec, InitiatorBuilder::new(local), 64)?;
    next_of(&mut events, HostEventKind::LinkUp).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        initiator.execute(read(0, 8192), IssueMode::WaitReady),
    )
    .await??;
    assert_eq!(outcome.code, CompletionCode::Ok);
    assert_eq!(outcome.data, pattern(8192));
    next_of(&mut events, HostEventKind::TargetLogin).await;

    let stats = initiator.statistics();
    assert_eq!(stats.commands_completed, 1);
    assert!(stats.frames_received >= 4);

    // Losing the far end takes the link down.
    target.abort();
    let _ = target.await;
    port.join().await?;
    next_of(&mut events, HostEventKind::LinkDown).await;
    assert!(!initiator.sessions().find(target_id()).unwrap().is_ready());
    Ok(())
}
