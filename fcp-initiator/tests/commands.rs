//! Command admission, data transfer, abort and reset against the simulated
//! target.

mod common;

use bytes::Bytes;
use common::{Harness, INITIATOR, Outcomes, lun, read, target_id, write10};
use fcp_codec::els::{ElsCommand, ls_acc};
use fcp_codec::{FCtl, FcFrame, FcHeader, FcType, RCtl};
use fcp_core::{FcError, FcId, ScsiStatus};
use fcp_initiator::sim::pattern;
use fcp_initiator::{
    CompletionCode, Disposition, HostEventKind, InitiatorConfig, ScsiRequest, SimBehavior,
};
use std::sync::Arc;

fn hold() -> SimBehavior {
    SimBehavior {
        hold_commands: true,
        ..SimBehavior::default()
    }
}

#[tokio::test]
async fn test_read_completes() {
    let mut h = Harness::new(InitiatorConfig::default(), SimBehavior::default());
    h.login().await;
    assert!(h.find_event(HostEventKind::TargetLogin).is_some());

    let (_, outcomes) = h.submit(read(0, 4096));
    let outcome = outcomes.single();
    assert!(outcome.is_success());
    assert_eq!(outcome.scsi_status, ScsiStatus::Good);
    assert_eq!(outcome.data, pattern(4096));
    assert_eq!(outcome.residual, 0);
    assert_eq!(h.initiator.outstanding(), 0);
    assert_eq!(h.initiator.open_exchanges(), 0);
}

#[tokio::test]
async fn test_write_is_split_into_frames() {
    let mut h = Harness::new(InitiatorConfig::default(), SimBehavior::default());
    h.login().await;

    let data: Bytes = (0..10_000u32).map(|i| (i * 7) as u8).collect::<Vec<_>>().into();
    let request = ScsiRequest::write(target_id(), lun(0), write10(), data.clone());
    let (_, outcomes) = h.submit(request);

    let outcome = outcomes.single();
    assert_eq!(outcome.code, CompletionCode::Ok);
    assert_eq!(outcome.transferred, 10_000);

    let frames: Vec<_> = h
        .sim
        .received()
        .iter()
        .filter(|f| f.r_ctl() == RCtl::SolData)
        .collect();
    let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
    assert_eq!(sizes, vec![2048, 2048, 2048, 2048, 1808]);
    assert!(frames[4].f_ctl().contains(FCtl::END_SEQ | FCtl::SEQ_INIT));
    assert!(!frames[0].f_ctl().contains(FCtl::END_SEQ));
    assert_eq!(frames[3].header.relative_offset(), Some(6144));
    assert_eq!(h.sim.writes(), &[data]);
}

#[tokio::test]
async fn test_short_read_reports_residual() {
    let behavior = SimBehavior {
        short_read: Some(3000),
        ..SimBehavior::default()
    };
    let mut h = Harness::new(InitiatorConfig::default(), behavior);
    h.login().await;

    let (_, outcomes) = h.submit(read(0, 4096));
    let outcome = outcomes.single();
    assert_eq!(outcome.code, CompletionCode::Ok);
    assert_eq!(outcome.transferred, 3000);
    assert_eq!(outcome.residual, 1096);
    assert_eq!(outcome.data.slice(..3000), pattern(3000));
}

#[tokio::test]
async fn test_check_condition_carries_sense() {
    let sense = Bytes::from_static(&[0x70, 0, 0x05, 0, 0, 0, 0, 0x0a]);
    let behavior = SimBehavior {
        scsi_status: ScsiStatus::CheckCondition,
        sense: sense.clone(),
        ..SimBehavior::default()
    };
    let mut h = Harness::new(InitiatorConfig::default(), behavior);
    h.login().await;

    let (_, outcomes) = h.submit(read(0, 512));
    let outcome = outcomes.single();
    assert_eq!(outcome.code, CompletionCode::Ok);
    assert_eq!(outcome.scsi_status, ScsiStatus::CheckCondition);
    assert_eq!(outcome.disposition, Disposition::Terminal);
    assert_eq!(outcome.sense, sense);
}

#[tokio::test]
async fn test_admission_checks() {
    let mut h = Harness::new(InitiatorConfig::default(), SimBehavior::default());
    let outcomes = Outcomes::default();

    let rejected = h
        .initiator
        .queue_command(read(0, 512), outcomes.handler())
        .unwrap_err();
    assert!(matches!(rejected.error, FcError::NoSession(_)));
    assert!(rejected.is_retryable());
    assert_eq!(rejected.request, read(0, 512));

    h.login().await;
    let mut bad_write = ScsiRequest::write(target_id(), lun(0), write10(), pattern(512));
    bad_write.data_len = 1024;
    let rejected = h
        .initiator
        .queue_command(bad_write, outcomes.handler())
        .unwrap_err();
    assert!(matches!(rejected.error, FcError::InvalidData(_)));
    assert_eq!(outcomes.len(), 0);
    assert_eq!(h.initiator.outstanding(), 0);
}

#[tokio::test]
async fn test_full_sink_is_reclaimed_once() {
    let mut h = Harness::new(InitiatorConfig::default(), SimBehavior::default());
    h.login().await;

    h.sink.fail_next(1);
    let (_, outcomes) = h.submit(read(0, 1024));
    assert_eq!(outcomes.single().code, CompletionCode::Ok);
    assert_eq!(h.sink.reclaims(), 1);

    h.sink.fail_next(2);
    let outcomes = Outcomes::default();
    let rejected = h
        .initiator
        .queue_command(read(0, 1024), outcomes.handler())
        .unwrap_err();
    assert!(matches!(rejected.error, FcError::ResourceExhausted(_)));
    assert_eq!(h.sink.reclaims(), 2);
    assert_eq!(h.initiator.outstanding(), 0);
    assert_eq!(h.initiator.open_exchanges(), 0);
    assert_eq!(outcomes.len(), 0);
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let mut h = Harness::new(InitiatorConfig::default(), hold());
    h.login().await;
    let (handle, outcomes) = h.submit(read(0, 4096));

    let first = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move { initiator.abort(handle).await })
    };
    let second = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move { initiator.abort(handle).await })
    };
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    h.pump();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(outcomes.single().code, CompletionCode::Aborted);
    assert_eq!(h.sim.count(RCtl::BaAbts), 1);
    assert_eq!(h.initiator.statistics().abts_sent, 1);

    // Already complete: nothing more goes out.
    h.initiator.abort(handle).await.unwrap();
    assert_eq!(h.sim.count(RCtl::BaAbts), 1);
    assert_eq!(outcomes.len(), 1);
}

#[tokio::test]
async fn test_lun_reset_is_scoped() {
    let mut h = Harness::new(InitiatorConfig::default(), hold());
    h.login().await;
    let (lun0, first) = h.submit(read(0, 4096));
    let (lun1, second) = h.submit(read(1, 4096));

    let reset = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move { initiator.lun_reset(target_id(), lun(0)).await })
    };
    tokio::task::yield_now().await;
    h.pump();
    reset.await.unwrap().unwrap();

    assert_eq!(first.single().code, CompletionCode::AbortedByReset);
    assert!(!h.initiator.is_outstanding(lun0));
    assert!(h.initiator.is_outstanding(lun1));
    assert_eq!(second.len(), 0);
    assert!(h.find_event(HostEventKind::Reset).is_some());

    let reset = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move { initiator.target_reset(target_id()).await })
    };
    tokio::task::yield_now().await;
    h.pump();
    reset.await.unwrap().unwrap();
    assert_eq!(second.single().code, CompletionCode::AbortedByReset);
    assert_eq!(h.initiator.statistics().resets, 2);
    assert_eq!(h.initiator.outstanding(), 0);
}

#[tokio::test]
async fn test_failed_task_management_leaves_commands() {
    let behavior = SimBehavior {
        tmf_rsp_code: fcp_codec::fcp::rsp_code::TMF_FAILED,
        ..hold()
    };
    let mut h = Harness::new(InitiatorConfig::default(), behavior);
    h.login().await;
    let (handle, outcomes) = h.submit(read(0, 4096));

    let reset = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move { initiator.lun_reset(target_id(), lun(0)).await })
    };
    tokio::task::yield_now().await;
    h.pump();
    let err = reset.await.unwrap().unwrap_err();
    assert!(matches!(err, FcError::Protocol(_)));
    assert!(h.initiator.is_outstanding(handle));
    assert_eq!(outcomes.len(), 0);
}

#[tokio::test]
async fn test_lun_degrades_after_hard_failures() {
    let config = InitiatorConfig::default().with_lun_failure_threshold(2);
    let behavior = SimBehavior {
        retry: false,
        ..hold()
    };
    let mut h = Harness::new(config, behavior);
    h.login().await;

    for _ in 0..2 {
        let (handle, outcomes) = h.submit(read(0, 512));
        assert!(h.expire(handle));
        assert_eq!(outcomes.single().code, CompletionCode::TimedOut);
    }
    let event = h.find_event(HostEventKind::LunDegraded).expect("degraded event");
    assert_eq!(event.fc_id, target_id());

    let outcomes = Outcomes::default();
    let rejected = h
        .initiator
        .queue_command(read(0, 512), outcomes.handler())
        .unwrap_err();
    assert!(matches!(rejected.error, FcError::LunDegraded(_)));
    // Other LUNs are unaffected.
    let (_, other) = h.submit(read(1, 512));
    assert_eq!(other.len(), 0);

    let reset = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move { initiator.lun_reset(target_id(), lun(0)).await })
    };
    tokio::task::yield_now().await;
    h.pump();
    reset.await.unwrap().unwrap();
    h.submit(read(0, 512));
}

#[tokio::test]
async fn test_target_logout_disrupts_commands() {
    let mut h = Harness::new(InitiatorConfig::default(), hold());
    let session = h.login().await;
    let (_, outcomes) = h.submit(read(0, 4096));

    let logo = h.sim.logout_frame(FcId::new(INITIATOR).unwrap(), 0x0500);
    h.initiator.recv_frame(logo);

    let outcome = outcomes.single();
    assert_eq!(outcome.code, CompletionCode::TransportDisrupted);
    assert_eq!(outcome.disposition, Disposition::Retryable);
    assert!(!session.is_ready());
    assert!(h.find_event(HostEventKind::TargetLogout).is_some());

    let replies = h.sink.take();
    let acc = replies
        .iter()
        .find(|f| f.r_ctl() == RCtl::ElsReply)
        .expect("LOGO answered");
    assert_eq!(acc.payload, ls_acc());
    assert_eq!(acc.header.ox_id, 0x0500);
}

#[tokio::test]
async fn test_unsolicited_link_services() {
    let mut h = Harness::new(InitiatorConfig::default(), SimBehavior::default());
    h.login().await;
    let initiator = FcId::new(INITIATOR).unwrap();
    let header = FcHeader::new(
        RCtl::ElsRequest,
        FcType::Els,
        initiator,
        FcId::new(0xFFFFFD).unwrap(),
        FCtl::single_request(),
    )
    .with_exchange(0x0600, 0xFFFF);

    let rscn = [ElsCommand::Rscn.as_u8(), 0x04, 0x00, 0x08, 0x00, 0x02, 0x02, 0x00];
    h.initiator
        .recv_frame(FcFrame::new(header, Bytes::copy_from_slice(&rscn)));
    assert!(h.find_event(HostEventKind::Rscn).is_some());

    let unknown = [0x7f, 0, 0, 0];
    h.initiator
        .recv_frame(FcFrame::new(header, Bytes::copy_from_slice(&unknown)));

    let replies = h.sink.take();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].payload, ls_acc());
    assert_eq!(ElsCommand::of(&replies[1].payload), Some(ElsCommand::LsRjt));
}

#[tokio::test]
async fn test_host_reset_flushes_and_logs_in_again() {
    let mut h = Harness::new(InitiatorConfig::default(), hold());
    let session = h.login().await;
    let (_, first) = h.submit(read(0, 4096));
    let (_, second) = h.submit(read(1, 4096));

    h.initiator.host_reset().await.unwrap();
    assert_eq!(first.single().code, CompletionCode::HostReset);
    assert_eq!(second.single().code, CompletionCode::HostReset);
    assert_eq!(h.initiator.outstanding(), 0);
    assert!(h.find_event(HostEventKind::Reset).is_some());

    h.wait_ready(&session).await;
    let again = h.initiator.sessions().find(target_id()).expect("session kept");
    assert!(Arc::ptr_eq(&session, &again));
    assert_eq!(h.sim.count_els(ElsCommand::Plogi), 2);
}

#[tokio::test]
async fn test_empty_read_reports_full_residual() {
    let behavior = SimBehavior {
        short_read: Some(0),
        ..SimBehavior::default()
    };
    let mut h = Harness::new(InitiatorConfig::default(), behavior);
    h.login().await;
    let (_, outcomes) = h.submit(read(0, 2048));
    let outcome = outcomes.single();
    assert_eq!(outcome.code, CompletionCode::Ok);
    assert_eq!(outcome.transferred, 0);
    assert_eq!(outcome.residual, 2048);
}

#[tokio::test]
async fn test_logout_drops_session_once_commands_finish() {
    let mut h = Harness::new(InitiatorConfig::default(), hold());
    let session = h.login().await;
    let (_, first) = h.submit(read(0, 4096));
    let (_, second) = h.submit(read(1, 4096));
    assert_eq!(session.refs(), 2);

    let stop = h.initiator.logout(target_id()).expect("session known");
    for _ in 0..200 {
        h.pump();
        if stop.is_finished() {
            break;
        }
        tokio::task::yield_now().await;
    }
    stop.await.unwrap();

    assert_eq!(first.single().code, CompletionCode::TransportDisrupted);
    assert_eq!(second.single().code, CompletionCode::TransportDisrupted);
    assert_eq!(session.refs(), 0);
    assert!(h.initiator.sessions().find(target_id()).is_none());
    assert_eq!(Arc::strong_count(&session), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_issue_racing_link_down_balances_references() {
    let mut h = Harness::new(InitiatorConfig::default(), hold());
    let session = h.login().await;

    for _ in 0..32 {
        let issue = {
            let initiator = h.initiator.clone();
            tokio::task::spawn_blocking(move || {
                for n in 0..16 {
                    let _ = initiator.queue_command(read(n, 512), Outcomes::default().handler());
                }
            })
        };
        let drop_link = {
            let initiator = h.initiator.clone();
            tokio::task::spawn_blocking(move || initiator.link_down())
        };
        issue.await.unwrap();
        drop_link.await.unwrap();
        h.initiator.link_down();

        assert_eq!(h.initiator.outstanding(), 0);
        assert_eq!(session.refs(), 0);
        h.initiator.link_up();
        h.wait_ready(&session).await;
    }
}
