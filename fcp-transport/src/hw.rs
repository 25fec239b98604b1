//! Hardware queue interface for adapters that offload exchanges
//!
//! Requests are submitted with a 32-bit tag; the adapter echoes the tag in
//! every completion-queue entry it posts for that request.

use crate::error::FcResult;
use bytes::Bytes;
use fcp_codec::fcp::FcpCmnd;
use fcp_core::{FcId, ScsiLun, ScsiStatus};
use tokio::sync::mpsc;

/// Task management operations carried by an ITMF request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItmfOp {
    /// Abort one outstanding request (ABTS on the wire)
    AbortTask,
    /// Terminate one outstanding request locally, nothing on the wire
    TerminateTask,
    LunReset,
    TargetReset,
}

/// Request posted to the adapter work queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwRequest {
    /// Initiator SCSI command; `data` holds the write payload
    Icmnd {
        d_id: FcId,
        cmnd: FcpCmnd,
        data: Bytes,
    },
    /// Task management; `target_tag` names the request to abort or terminate
    Itmf {
        d_id: FcId,
        lun: ScsiLun,
        op: ItmfOp,
        target_tag: Option<u32>,
    },
    /// Reset the adapter firmware, dropping every outstanding request
    FirmwareReset,
}

/// Adapter status for one completion-queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwStatus {
    Success,
    Timeout,
    Aborted,
    DataCountMismatch,
    ResourceExhausted,
    InvalidRequest,
    FirmwareError,
}

/// Which request class a completion answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Icmnd,
    Itmf,
    FirmwareReset,
}

/// Completion-queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub tag: u32,
    pub kind: CompletionKind,
    pub status: HwStatus,
    pub scsi_status: ScsiStatus,
    /// Bytes not transferred
    pub residual: u32,
    pub sense: Bytes,
    /// Read payload placed by the adapter
    pub data: Bytes,
}

impl CompletionEvent {
    pub fn new(tag: u32, kind: CompletionKind, status: HwStatus) -> Self {
        Self {
            tag,
            kind,
            status,
            scsi_status: ScsiStatus::Good,
            residual: 0,
            sense: Bytes::new(),
            data: Bytes::new(),
        }
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    pub fn with_scsi(mut self, scsi_status: ScsiStatus, residual: u32, sense: Bytes) -> Self {
        self.scsi_status = scsi_status;
        self.residual = residual;
        self.sense = sense;
        self
    }
}

/// Adapter work queue
pub trait HwQueue: Send + Sync {
    /// Post a request. Fails with `ResourceExhausted` when no descriptor is
    /// free.
    fn submit(&self, tag: u32, request: HwRequest) -> FcResult<()>;

    /// Descriptors currently available.
    fn free_descriptors(&self) -> usize;

    /// Reap descriptors the adapter has finished with. Returns how many were
    /// freed.
    fn reclaim(&self) -> usize;
}

/// Producer side of the completion queue
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::Sender<CompletionEvent>,
}

impl CompletionSender {
    /// Post an entry, waiting for room.
    pub async fn post(&self, event: CompletionEvent) -> FcResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| crate::error::FcError::Closed)
    }
}

/// Create a bounded completion queue of `depth` entries.
pub fn completion_queue(depth: usize) -> (CompletionSender, mpsc::Receiver<CompletionEvent>) {
    let (tx, rx) = mpsc::channel(depth);
    (CompletionSender { tx }, rx)
}
