//! Hardware offload path with a mocked adapter queue.

mod common;

use common::{Harness, Outcomes, read};
use fcp_core::{FcError, FcResult, ScsiStatus};
use fcp_initiator::sim::pattern;
use fcp_initiator::{CompletionCode, InitiatorConfig, SimBehavior};
use fcp_transport::{CompletionEvent, CompletionKind, HwQueue, HwRequest, HwStatus, ItmfOp};
use mockall::mock;
use parking_lot::Mutex;
use std::sync::Arc;

mock! {
    pub Adapter {}

    impl HwQueue for Adapter {
        fn submit(&self, tag: u32, request: HwRequest) -> FcResult<()>;
        fn free_descriptors(&self) -> usize;
        fn reclaim(&self) -> usize;
    }
}

type Submitted = Arc<Mutex<Vec<(u32, HwRequest)>>>;

/// An adapter that accepts everything and remembers what it was given.
fn recording_adapter() -> (MockAdapter, Submitted) {
    let submitted: Submitted = Arc::default();
    let mut adapter = MockAdapter::new();
    adapter.expect_free_descriptors().return_const(64usize);
    adapter.expect_reclaim().return_const(0usize);
    let log = submitted.clone();
    adapter.expect_submit().returning(move |tag, request| {
        log.lock().push((tag, request));
        Ok(())
    });
    (adapter, submitted)
}

async fn harness(adapter: MockAdapter) -> Harness {
    let mut h = Harness::with_hw(
        InitiatorConfig::default(),
        SimBehavior::default(),
        Arc::new(adapter),
    );
    h.login().await;
    h
}

#[tokio::test]
async fn test_offloaded_read_completes_from_queue_entry() {
    let (adapter, submitted) = recording_adapter();
    let mut h = harness(adapter).await;

    let (_, outcomes) = h.submit(read(0, 4096));
    // Nothing goes out on the wire for an offloaded command.
    assert_eq!(h.sim.count(fcp_codec::RCtl::UnsolCmd), 0);
    let (tag, request) = submitted.lock()[0].clone();
    match request {
        HwRequest::Icmnd { d_id, cmnd, .. } => {
            assert_eq!(d_id, common::target_id());
            assert_eq!(cmnd.data_len, 4096);
        }
        other => panic!("unexpected {:?}", other),
    }

    h.initiator.on_hw_completion(
        CompletionEvent::new(tag, CompletionKind::Icmnd, HwStatus::Success)
            .with_data(pattern(4096)),
    );
    let outcome = outcomes.single();
    assert_eq!(outcome.code, CompletionCode::Ok);
    assert_eq!(outcome.data, pattern(4096));

    // A repeated entry for the same tag is stale.
    h.initiator.on_hw_completion(CompletionEvent::new(
        tag,
        CompletionKind::Icmnd,
        HwStatus::Success,
    ));
    assert_eq!(outcomes.len(), 1);
}

#[tokio::test]
async fn test_offloaded_underrun_and_status_mapping() {
    let (adapter, submitted) = recording_adapter();
    let mut h = harness(adapter).await;

    let (_, short) = h.submit(read(0, 4096));
    let (_, failed) = h.submit(read(0, 4096));
    let tags: Vec<u32> = submitted.lock().iter().map(|(t, _)| *t).collect();

    h.initiator.on_hw_completion(
        CompletionEvent::new(tags[0], CompletionKind::Icmnd, HwStatus::DataCountMismatch)
            .with_data(pattern(1024))
            .with_scsi(ScsiStatus::Good, 3072, bytes::Bytes::new()),
    );
    let outcome = short.single();
    assert_eq!(outcome.code, CompletionCode::Ok);
    assert_eq!(outcome.transferred, 1024);
    assert_eq!(outcome.residual, 3072);

    h.initiator.on_hw_completion(CompletionEvent::new(
        tags[1],
        CompletionKind::Icmnd,
        HwStatus::InvalidRequest,
    ));
    assert_eq!(failed.single().code, CompletionCode::HwInvalidRequest);
}

#[tokio::test]
async fn test_offloaded_timeout_aborts_through_adapter() {
    let (adapter, submitted) = recording_adapter();
    let mut h = harness(adapter).await;

    let (handle, outcomes) = h.submit(read(0, 4096));
    let command_tag = submitted.lock()[0].0;
    assert!(h.expire(handle));

    let (abort_tag, request) = submitted.lock()[1].clone();
    assert_eq!(
        request,
        HwRequest::Itmf {
            d_id: common::target_id(),
            lun: common::lun(0),
            op: ItmfOp::AbortTask,
            target_tag: Some(command_tag),
        }
    );
    assert_eq!(outcomes.len(), 0);

    h.initiator.on_hw_completion(CompletionEvent::new(
        abort_tag,
        CompletionKind::Itmf,
        HwStatus::Success,
    ));
    assert_eq!(outcomes.single().code, CompletionCode::TimedOut);
    // The aborted command's own entry arrives late and is ignored.
    h.initiator.on_hw_completion(CompletionEvent::new(
        command_tag,
        CompletionKind::Icmnd,
        HwStatus::Aborted,
    ));
    assert_eq!(outcomes.len(), 1);
}

#[tokio::test]
async fn test_full_adapter_rejects_command() {
    let mut adapter = MockAdapter::new();
    adapter.expect_free_descriptors().return_const(0usize);
    adapter.expect_reclaim().times(1).return_const(0usize);
    adapter.expect_submit().never();
    let h = harness(adapter).await;

    let outcomes = Outcomes::default();
    let rejected = h
        .initiator
        .queue_command(read(0, 512), outcomes.handler())
        .unwrap_err();
    assert!(matches!(rejected.error, FcError::ResourceExhausted(_)));
    assert_eq!(h.initiator.outstanding(), 0);
}

#[tokio::test]
async fn test_firmware_reset_flushes_adapter() {
    let (adapter, submitted) = recording_adapter();
    let mut h = harness(adapter).await;
    let (_, first) = h.submit(read(0, 4096));
    let (_, second) = h.submit(read(1, 4096));

    let reset = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move { initiator.host_reset().await })
    };
    tokio::task::yield_now().await;
    let (reset_tag, request) = submitted.lock()[2].clone();
    assert_eq!(request, HwRequest::FirmwareReset);
    h.initiator.on_hw_completion(CompletionEvent::new(
        reset_tag,
        CompletionKind::FirmwareReset,
        HwStatus::Success,
    ));
    reset.await.unwrap().unwrap();

    assert_eq!(first.single().code, CompletionCode::HostReset);
    assert_eq!(second.single().code, CompletionCode::HostReset);
    assert_eq!(h.initiator.outstanding(), 0);
}

/// Yield until the adapter has been handed `count` requests.
async fn submitted_at_least(submitted: &Submitted, count: usize) {
    for _ in 0..100 {
        if submitted.lock().len() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("adapter saw {} requests, expected {}", submitted.lock().len(), count);
}

/// Start a LUN reset of LUN 0 with one offloaded read in flight, confirm
/// the reset and answer the terminate with `terminate_status`.
async fn lun_reset_with_terminate(
    terminate_status: HwStatus,
) -> (fcp_core::FcResult<()>, Outcomes) {
    let (adapter, submitted) = recording_adapter();
    let mut h = harness(adapter).await;
    let (_, outcomes) = h.submit(read(0, 4096));
    let command_tag = submitted.lock()[0].0;

    let reset = {
        let initiator = h.initiator.clone();
        tokio::spawn(async move {
            initiator
                .lun_reset(common::target_id(), common::lun(0))
                .await
        })
    };
    submitted_at_least(&submitted, 2).await;
    let (reset_tag, request) = submitted.lock()[1].clone();
    assert!(matches!(
        request,
        HwRequest::Itmf {
            op: ItmfOp::LunReset,
            target_tag: None,
            ..
        }
    ));
    h.initiator.on_hw_completion(CompletionEvent::new(
        reset_tag,
        CompletionKind::Itmf,
        HwStatus::Success,
    ));

    submitted_at_least(&submitted, 3).await;
    let (terminate_tag, request) = submitted.lock()[2].clone();
    assert_eq!(
        request,
        HwRequest::Itmf {
            d_id: common::target_id(),
            lun: common::lun(0),
            op: ItmfOp::TerminateTask,
            target_tag: Some(command_tag),
        }
    );
    h.initiator.on_hw_completion(CompletionEvent::new(
        terminate_tag,
        CompletionKind::Itmf,
        terminate_status,
    ));
    let result = reset.await.unwrap();
    assert_eq!(h.initiator.outstanding(), 0);
    (result, outcomes)
}

#[tokio::test]
async fn test_lun_reset_terminates_offloaded_command() {
    let (result, outcomes) = lun_reset_with_terminate(HwStatus::Success).await;
    assert!(result.is_ok());
    assert_eq!(outcomes.single().code, CompletionCode::AbortedByReset);
}

#[tokio::test]
async fn test_lun_reset_fails_when_terminate_fails() {
    let (result, outcomes) = lun_reset_with_terminate(HwStatus::FirmwareError).await;
    assert!(matches!(result, Err(FcError::TmfFailed(_))));
    assert_eq!(outcomes.single().code, CompletionCode::TmfFailed);
}
