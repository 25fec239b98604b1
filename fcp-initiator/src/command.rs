//! SCSI command state
//!
//! A [`Command`] is one SCSI request in flight. It lives in the initiator's
//! slot arena from issue until completion; every path that touches it does
//! so through its slot handle under the slot lock.

use crate::data::TransferRanges;
use bytes::{Bytes, BytesMut};
use fcp_codec::fcp::{FcpCmnd, FcpRsp, TaskAttribute};
use fcp_core::{Cdb, DataDirection, FcError, FcId, FcResult, ScsiLun, ScsiStatus, SlotHandle};
use fcp_session::Session;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Command lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    /// FCP_CMND sent, nothing heard back
    #[default]
    Issued,
    /// Data phase in progress
    AwaitingTransfer(DataDirection),
    /// Data phase done or not needed, FCP_RSP outstanding
    AwaitingStatus,
    /// ABTS or hardware abort sent
    AbortPending,
    /// Abort acknowledged, completion pending
    Aborted,
    Completed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed)
    }

    pub fn validate_transition(self, to: CommandState) -> FcResult<()> {
        use CommandState::*;
        let valid = match (self, to) {
            (Completed, _) => false,
            (_, Completed) => true,
            (Issued, AwaitingTransfer(_)) | (Issued, AwaitingStatus) => true,
            (AwaitingTransfer(_), AwaitingTransfer(_)) | (AwaitingTransfer(_), AwaitingStatus) => {
                true
            }
            // SRR for transfer-ready reopens the data phase.
            (AwaitingStatus, AwaitingTransfer(_)) | (AwaitingStatus, AwaitingStatus) => true,
            (AbortPending, Aborted) => true,
            (AbortPending, _) | (Aborted, _) => false,
            (_, AbortPending) => true,
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(FcError::Protocol(format!(
                "invalid command transition {:?} -> {:?}",
                self, to
            )))
        }
    }
}

/// How `issue` treats a session that is not ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IssueMode {
    /// Fail with `NoSession` right away
    #[default]
    Immediate,
    /// Start or join login and wait up to the configured login wait
    WaitReady,
}

/// What the caller asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiRequest {
    pub d_id: FcId,
    pub lun: ScsiLun,
    pub cdb: Cdb,
    pub direction: DataDirection,
    pub data_len: u32,
    /// Payload of a write; empty otherwise
    pub data: Bytes,
    pub task_attribute: TaskAttribute,
}

impl ScsiRequest {
    pub fn read(d_id: FcId, lun: ScsiLun, cdb: Cdb, data_len: u32) -> Self {
        Self {
            d_id,
            lun,
            cdb,
            direction: DataDirection::Read,
            data_len,
            data: Bytes::new(),
            task_attribute: TaskAttribute::Simple,
        }
    }

    pub fn write(d_id: FcId, lun: ScsiLun, cdb: Cdb, data: Bytes) -> Self {
        Self {
            d_id,
            lun,
            cdb,
            direction: DataDirection::Write,
            data_len: data.len() as u32,
            data,
            task_attribute: TaskAttribute::Simple,
        }
    }

    pub fn no_data(d_id: FcId, lun: ScsiLun, cdb: Cdb) -> Self {
        Self {
            d_id,
            lun,
            cdb,
            direction: DataDirection::None,
            data_len: 0,
            data: Bytes::new(),
            task_attribute: TaskAttribute::Simple,
        }
    }

    pub fn with_task_attribute(mut self, attribute: TaskAttribute) -> Self {
        self.task_attribute = attribute;
        self
    }

    pub(crate) fn fcp_cmnd(&self) -> FcpCmnd {
        FcpCmnd {
            task_attribute: self.task_attribute,
            ..FcpCmnd::scsi(self.lun, &self.cdb, self.direction, self.data_len)
        }
    }
}

/// A request the initiator refused to start. The request is handed back
/// untouched and its completion handler is never called.
#[derive(Debug, Error)]
#[error("command to {d_id} rejected: {error}", d_id = .request.d_id)]
pub struct Rejected {
    pub error: FcError,
    pub request: ScsiRequest,
}

impl Rejected {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Internal completion reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionCode {
    Ok,
    DataUnderrun,
    DataOverrun,
    CrcError,
    TimedOut,
    /// Aborted at the caller's request
    Aborted,
    AbortedByReset,
    HostReset,
    /// Link loss or target logout
    TransportDisrupted,
    RecoveryFailed,
    TmfFailed,
    HwTimeout,
    HwResource,
    HwInvalidRequest,
    FirmwareError,
}

impl CompletionCode {
    /// Failures counted against LUN health.
    pub fn is_hard_failure(self) -> bool {
        matches!(
            self,
            CompletionCode::TimedOut
                | CompletionCode::DataOverrun
                | CompletionCode::HwInvalidRequest
                | CompletionCode::FirmwareError
                | CompletionCode::HwTimeout
        )
    }

    fn retryable(self) -> bool {
        matches!(
            self,
            CompletionCode::DataUnderrun
                | CompletionCode::CrcError
                | CompletionCode::TimedOut
                | CompletionCode::AbortedByReset
                | CompletionCode::HostReset
                | CompletionCode::TransportDisrupted
                | CompletionCode::HwTimeout
                | CompletionCode::HwResource
        )
    }
}

/// Caller-facing verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Resubmitting the same request may succeed
    Retryable,
    Terminal,
}

/// Result handed to the completion handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub disposition: Disposition,
    pub code: CompletionCode,
    pub scsi_status: ScsiStatus,
    /// Bytes the target reported as not transferred
    pub residual: u32,
    pub sense: Bytes,
    /// Read data; bytes past `transferred` are undefined
    pub data: Bytes,
    pub transferred: u32,
}

impl Outcome {
    pub fn new(code: CompletionCode, scsi_status: ScsiStatus) -> Self {
        let disposition = match code {
            CompletionCode::Ok => match scsi_status {
                ScsiStatus::Good | ScsiStatus::ConditionMet => Disposition::Success,
                s if s.is_busy() => Disposition::Retryable,
                _ => Disposition::Terminal,
            },
            c if c.retryable() => Disposition::Retryable,
            _ => Disposition::Terminal,
        };
        Self {
            disposition,
            code,
            scsi_status,
            residual: 0,
            sense: Bytes::new(),
            data: Bytes::new(),
            transferred: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.disposition == Disposition::Success
    }
}

/// Receives the outcome of a command exactly once
pub trait CompletionHandler: Send {
    fn on_complete(self: Box<Self>, outcome: Outcome);
}

impl<F> CompletionHandler for F
where
    F: FnOnce(Outcome) + Send,
{
    fn on_complete(self: Box<Self>, outcome: Outcome) {
        (*self)(outcome)
    }
}

/// Which REC/SRR step is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryOp {
    Rec,
    Srr,
}

/// Why recovery started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// No FCP_RSP before the command timer
    MissingResponse,
    /// FCP_RSP arrived but data is short
    MissingData,
}

/// Link between a command and its outstanding REC or SRR exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryContext {
    pub ox_id: u16,
    pub op: RecoveryOp,
    pub reason: RecoveryReason,
}

/// One SCSI command in flight
pub(crate) struct Command {
    pub request: ScsiRequest,
    /// Counted in the session's command references from admission until
    /// `complete`; that count, not this pointer, decides when the table
    /// drops the session.
    pub session: Arc<Session>,
    pub state: CommandState,
    pub ox_id: u16,
    pub rx_id: u16,
    /// Read destination, `data_len` bytes
    pub buffer: BytesMut,
    /// Bytes moved in either direction
    pub ranges: TransferRanges,
    pub rsp: Option<FcpRsp>,
    pub timer_token: u32,
    pub retries: u32,
    pub recovery: Option<RecoveryContext>,
    /// Completion code to use once an abort is acknowledged
    pub abort_code: CompletionCode,
    /// Carries the final completion code to abort waiters
    pub abort_done: Option<watch::Sender<Option<CompletionCode>>>,
    pub hw_tag: Option<SlotHandle>,
    pub handler: Option<Box<dyn CompletionHandler>>,
}

impl Command {
    pub fn new(
        request: ScsiRequest,
        session: Arc<Session>,
        handler: Box<dyn CompletionHandler>,
    ) -> Self {
        let buffer = match request.direction {
            DataDirection::Read => BytesMut::zeroed(request.data_len as usize),
            _ => BytesMut::new(),
        };
        Self {
            request,
            session,
            state: CommandState::Issued,
            ox_id: fcp_codec::header::XID_UNKNOWN,
            rx_id: fcp_codec::header::XID_UNKNOWN,
            buffer,
            ranges: TransferRanges::new(),
            rsp: None,
            timer_token: 0,
            retries: 0,
            recovery: None,
            abort_code: CompletionCode::Aborted,
            abort_done: None,
            hw_tag: None,
            handler: Some(handler),
        }
    }

    pub fn d_id(&self) -> FcId {
        self.request.d_id
    }

    pub fn lun(&self) -> ScsiLun {
        self.request.lun
    }

    pub fn data_len(&self) -> u32 {
        self.request.data_len
    }

    pub fn direction(&self) -> DataDirection {
        self.request.direction
    }

    pub fn transferred(&self) -> u32 {
        self.ranges.total()
    }

    pub fn contiguous(&self) -> u32 {
        self.ranges.contiguous()
    }

    /// Length the data phase should reach given the status received.
    pub fn expected_len(&self) -> Option<u32> {
        self.rsp.as_ref().map(|rsp| {
            if rsp.is_overrun() {
                self.data_len()
            } else {
                self.data_len().saturating_sub(rsp.resid_under())
            }
        })
    }

    /// Move to `to`, logging invalid transitions instead of failing.
    pub fn transition(&mut self, to: CommandState) -> bool {
        match self.state.validate_transition(to) {
            Ok(()) => {
                self.state = to;
                true
            }
            Err(e) => {
                log::debug!("command {:#06x}: {}", self.ox_id, e);
                false
            }
        }
    }

    /// Start a new timer period, invalidating the previous one.
    pub fn next_timer_token(&mut self) -> u32 {
        self.timer_token = self.timer_token.wrapping_add(1);
        self.timer_token
    }

    pub fn abort_in_progress(&self) -> bool {
        matches!(self.state, CommandState::AbortPending | CommandState::Aborted)
    }

    /// Build the caller's outcome, consuming the data buffer.
    pub fn outcome(&mut self, code: CompletionCode) -> Outcome {
        let scsi_status = match code {
            CompletionCode::Ok => self.rsp.as_ref().map(|r| r.status).unwrap_or_default(),
            _ => ScsiStatus::Good,
        };
        let mut outcome = Outcome::new(code, scsi_status);
        outcome.transferred = self.transferred();
        if let Some(rsp) = self.rsp.take() {
            outcome.residual = rsp.resid;
            outcome.sense = rsp.sense;
        } else {
            outcome.residual = self.data_len().saturating_sub(outcome.transferred);
        }
        outcome.data = std::mem::take(&mut self.buffer).freeze();
        outcome
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("d_id", &self.request.d_id)
            .field("lun", &self.request.lun)
            .field("state", &self.state)
            .field("ox_id", &format_args!("{:#06x}", self.ox_id))
            .field("transferred", &self.transferred())
            .field("retries", &self.retries)
            .finish()
    }
}
