//! Sequence-level recovery and exchange abort
//!
//! When a command's timer fires the engine first asks the target where the
//! exchange stands (REC) and then requests retransmission of exactly what is
//! missing (SRR). Targets without REC support fall back to the coarse
//! timeout followed by ABTS. Every REC and every command re-send counts
//! against `max_recovery_retries`.

use crate::command::{
    Command, CommandState, CompletionCode, RecoveryContext, RecoveryOp, RecoveryReason,
};
use crate::hw::{HwOwner, HwSlotState};
use crate::initiator::{ExchangeOwner, FcpInitiator};
use crate::timer::TimerKey;
use bytes::Bytes;
use fcp_codec::els::{
    ELS_EXPL_OXID_RXID, EStat, ElsReply, LsRjt, RecAccept, RecRequest, RjtReason, SrrRequest,
};
use fcp_codec::header::XID_UNKNOWN;
use fcp_codec::{FCtl, FcFrame, FcHeader, FcType, RCtl};
use fcp_core::{DataDirection, FcError, FcResult, SlotHandle};
use fcp_session::SessionEvent;
use fcp_transport::{HwRequest, ItmfOp};
use tokio::sync::watch;

/// Next step after a REC accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Target still holds sequence initiative; check again later
    Wait,
    /// Ask for the FCP_RSP again
    SrrStatus,
    /// Ask for a new FCP_XFER_RDY at this offset
    SrrTransferReady(u32),
    /// Ask for read data again from this offset
    SrrData(u32),
}

/// Decide what to request from a REC accept.
///
/// `contiguous` is the gap-free prefix of read data already received.
pub fn plan_recovery(
    direction: DataDirection,
    data_len: u32,
    contiguous: u32,
    accept: &RecAccept,
) -> RecoveryPlan {
    if accept.responder_busy() {
        return RecoveryPlan::Wait;
    }
    match direction {
        DataDirection::Write => {
            if accept.e_stat.contains(EStat::COMPLETE) || accept.offset >= data_len {
                RecoveryPlan::SrrStatus
            } else {
                RecoveryPlan::SrrTransferReady(accept.offset)
            }
        }
        DataDirection::Read => {
            if contiguous >= accept.offset {
                RecoveryPlan::SrrStatus
            } else {
                RecoveryPlan::SrrData(contiguous)
            }
        }
        DataDirection::None => RecoveryPlan::SrrStatus,
    }
}

/// What the timer handler decided under the slot lock
enum TimerAction {
    Complete(CompletionCode),
    Abort(CompletionCode),
    Rec(RecoveryReason),
}

/// What a recovery reply handler decided under the slot lock
enum ReplyAction {
    Done,
    Abort(CompletionCode),
    Complete(CompletionCode),
    RecUnsupported(SessionEvent),
}

impl FcpInitiator {
    /// A command timer expired. Stale expiries are ignored.
    pub fn on_timer(&self, key: TimerKey) {
        let max = self.config.max_recovery_retries;
        let action = self.commands.with(key.command, |c| {
            if c.timer_token != key.token {
                return None;
            }
            if c.abort_in_progress() {
                log::warn!("abort of {:#06x} unanswered", c.ox_id);
                return Some(TimerAction::Complete(c.abort_code));
            }
            if c.hw_tag.is_some() {
                return Some(TimerAction::Abort(CompletionCode::TimedOut));
            }
            if let Some(recovery) = c.recovery {
                log::warn!(
                    "{:?} for {:#06x} unanswered on {:#06x}",
                    recovery.op,
                    c.ox_id,
                    recovery.ox_id
                );
                return Some(TimerAction::Abort(CompletionCode::TimedOut));
            }
            let reason = if c.rsp.is_some() {
                RecoveryReason::MissingData
            } else {
                RecoveryReason::MissingResponse
            };
            if !c.session.rec_supported() {
                return Some(TimerAction::Abort(match reason {
                    RecoveryReason::MissingData => CompletionCode::DataUnderrun,
                    RecoveryReason::MissingResponse => CompletionCode::TimedOut,
                }));
            }
            if c.retries >= max {
                log::warn!(
                    "giving up on {:#06x} after {} recovery attempts",
                    c.ox_id,
                    c.retries
                );
                return Some(TimerAction::Abort(CompletionCode::TimedOut));
            }
            Some(TimerAction::Rec(reason))
        });

        match action.flatten() {
            Some(TimerAction::Complete(code)) => {
                self.complete(key.command, code);
            }
            Some(TimerAction::Abort(code)) => self.abort_with(key.command, code),
            Some(TimerAction::Rec(reason)) => self.send_rec(key.command, reason),
            None => {}
        }
    }

    fn send_rec(&self, handle: SlotHandle, reason: RecoveryReason) {
        let rec_tov = self.config.rec_tov();
        let s_id = self.local.port_id;
        let sent = self.commands.with(handle, |c| -> FcResult<()> {
            let ox_id = self.exchanges.alloc(
                s_id,
                c.d_id(),
                ExchangeOwner::Recovery(handle, RecoveryOp::Rec),
            )?;
            let payload = RecRequest {
                s_id,
                ox_id: c.ox_id,
                rx_id: c.rx_id,
            }
            .encode();
            let header = FcHeader::new(
                RCtl::ElsRequest,
                FcType::Els,
                c.d_id(),
                s_id,
                FCtl::single_request(),
            )
            .with_exchange(ox_id, XID_UNKNOWN);
            if let Err(e) = self.send_frame(FcFrame::new(header, payload)) {
                self.exchanges.release(ox_id);
                return Err(e);
            }
            c.retries += 1;
            c.recovery = Some(RecoveryContext {
                ox_id,
                op: RecoveryOp::Rec,
                reason,
            });
            self.arm_timer(handle, c, rec_tov);
            log::debug!(
                "REC {} for {:#06x} ({:?})",
                c.retries,
                c.ox_id,
                reason
            );
            Ok(())
        });
        match sent {
            Some(Ok(())) => self.stats.increment_rec_sent(),
            Some(Err(e)) => {
                log::warn!("REC not sent: {}", e);
                self.abort_with(handle, CompletionCode::TimedOut);
            }
            None => {}
        }
    }

    pub(crate) fn on_recovery_reply(&self, handle: SlotHandle, op: RecoveryOp, frame: FcFrame) {
        let ox_id = frame.header.ox_id;
        self.exchanges
            .release_if(ox_id, |o| *o == ExchangeOwner::Recovery(handle, op));
        let reply = ElsReply::parse(frame.payload);

        let action = self.commands.with(handle, |c| {
            match c.recovery {
                Some(r) if r.ox_id == ox_id && r.op == op => {}
                _ => return ReplyAction::Done,
            }
            c.recovery = None;
            if c.abort_in_progress() {
                return ReplyAction::Done;
            }
            match (op, reply) {
                (RecoveryOp::Rec, Ok(ElsReply::Accept(payload))) => {
                    match RecAccept::decode(&payload) {
                        Ok(accept) => self.on_rec_accept(handle, c, &accept),
                        Err(e) => {
                            log::warn!("bad REC accept for {:#06x}: {}", c.ox_id, e);
                            ReplyAction::Abort(CompletionCode::RecoveryFailed)
                        }
                    }
                }
                (RecoveryOp::Rec, Ok(ElsReply::Reject(rjt))) => self.on_rec_reject(handle, c, rjt),
                (RecoveryOp::Srr, Ok(ElsReply::Accept(_))) => {
                    self.arm_timer(handle, c, self.config.rec_tov());
                    ReplyAction::Done
                }
                (RecoveryOp::Srr, Ok(ElsReply::Reject(rjt))) => {
                    log::warn!(
                        "SRR for {:#06x} rejected: {:?}/{:#04x}",
                        c.ox_id,
                        rjt.reason,
                        rjt.explanation
                    );
                    ReplyAction::Abort(CompletionCode::TimedOut)
                }
                (op, Err(e)) => {
                    log::warn!("bad {:?} reply for {:#06x}: {}", op, c.ox_id, e);
                    ReplyAction::Abort(CompletionCode::TimedOut)
                }
            }
        });

        match action {
            Some(ReplyAction::Abort(code)) => self.abort_with(handle, code),
            Some(ReplyAction::Complete(code)) => {
                self.complete(handle, code);
            }
            Some(ReplyAction::RecUnsupported(event)) => self.sessions.emit(event),
            Some(ReplyAction::Done) | None => {}
        }
    }

    fn on_rec_accept(&self, handle: SlotHandle, c: &mut Command, accept: &RecAccept) -> ReplyAction {
        if c.rx_id == XID_UNKNOWN && accept.rx_id != XID_UNKNOWN {
            c.rx_id = accept.rx_id;
            self.exchanges.set_rx_id(c.ox_id, accept.rx_id);
        }
        let plan = plan_recovery(c.direction(), c.data_len(), c.contiguous(), accept);
        log::debug!(
            "REC for {:#06x}: offset {} e_stat {:?}, {} contiguous -> {:?}",
            c.ox_id,
            accept.offset,
            accept.e_stat,
            c.contiguous(),
            plan
        );
        let result = match plan {
            RecoveryPlan::Wait => {
                self.arm_timer(handle, c, self.config.rec_tov());
                Ok(())
            }
            RecoveryPlan::SrrStatus => self.send_srr(handle, c, 0, RCtl::CmdStatus),
            RecoveryPlan::SrrTransferReady(offset) => {
                self.send_srr(handle, c, offset, RCtl::DataDesc)
            }
            RecoveryPlan::SrrData(offset) => self.send_srr(handle, c, offset, RCtl::SolData),
        };
        match result {
            Ok(()) => ReplyAction::Done,
            Err(e) => {
                log::warn!("SRR for {:#06x} not sent: {}", c.ox_id, e);
                ReplyAction::Abort(CompletionCode::RecoveryFailed)
            }
        }
    }

    fn on_rec_reject(&self, handle: SlotHandle, c: &mut Command, rjt: LsRjt) -> ReplyAction {
        log::info!(
            "REC for {:#06x} rejected: {:?}/{:#04x}",
            c.ox_id,
            rjt.reason,
            rjt.explanation
        );
        match rjt.reason {
            RjtReason::Unsupported | RjtReason::InvalidCommand => {
                self.arm_timer(handle, c, self.config.coarse_timeout());
                if c.session.clear_rec_supported() {
                    log::warn!("{} does not support REC", c.d_id());
                    return ReplyAction::RecUnsupported(SessionEvent::RecUnsupported {
                        key: c.session.key(),
                        remote: c.d_id(),
                    });
                }
                ReplyAction::Done
            }
            RjtReason::LogicalBusy => {
                self.arm_timer(handle, c, self.config.rec_tov());
                ReplyAction::Done
            }
            RjtReason::LogicalError | RjtReason::UnableToPerform
                if c.transferred() == 0
                    && c.rsp.is_none()
                    && c.retries < self.config.max_recovery_retries =>
            {
                if rjt.explanation == ELS_EXPL_OXID_RXID {
                    log::debug!("{} lost exchange {:#06x}", c.d_id(), c.ox_id);
                }
                match self.resend_command(handle, c) {
                    Ok(()) => ReplyAction::Done,
                    Err(e) => {
                        log::warn!("re-send of FCP_CMND failed: {}", e);
                        ReplyAction::Complete(CompletionCode::RecoveryFailed)
                    }
                }
            }
            _ => ReplyAction::Abort(CompletionCode::RecoveryFailed),
        }
    }

    fn send_srr(&self, handle: SlotHandle, c: &mut Command, rel_off: u32, r_ctl: RCtl) -> FcResult<()> {
        let s_id = self.local.port_id;
        let ox_id = self.exchanges.alloc(
            s_id,
            c.d_id(),
            ExchangeOwner::Recovery(handle, RecoveryOp::Srr),
        )?;
        let payload = SrrRequest {
            ox_id: c.ox_id,
            rx_id: c.rx_id,
            rel_off,
            r_ctl,
        }
        .encode();
        let header = FcHeader::new(
            RCtl::Els4Request,
            FcType::Fcp,
            c.d_id(),
            s_id,
            FCtl::single_request(),
        )
        .with_exchange(ox_id, XID_UNKNOWN);
        if let Err(e) = self.send_frame(FcFrame::new(header, payload)) {
            self.exchanges.release(ox_id);
            return Err(e);
        }
        let reason = match r_ctl {
            RCtl::CmdStatus => RecoveryReason::MissingResponse,
            _ => RecoveryReason::MissingData,
        };
        c.recovery = Some(RecoveryContext {
            ox_id,
            op: RecoveryOp::Srr,
            reason,
        });
        if let RCtl::DataDesc = r_ctl {
            c.transition(CommandState::AwaitingTransfer(DataDirection::Write));
        }
        self.arm_timer(handle, c, self.config.rec_tov());
        self.stats.increment_srr_sent();
        log::debug!(
            "SRR {:?} at {} for {:#06x}",
            r_ctl,
            rel_off,
            c.ox_id
        );
        Ok(())
    }

    /// Start the command over on a fresh exchange.
    fn resend_command(&self, handle: SlotHandle, c: &mut Command) -> FcResult<()> {
        let s_id = self.local.port_id;
        self.exchanges
            .release_if(c.ox_id, |o| *o == ExchangeOwner::Command(handle));
        let ox_id = self
            .exchanges
            .alloc(s_id, c.d_id(), ExchangeOwner::Command(handle))?;
        c.ox_id = ox_id;
        c.rx_id = XID_UNKNOWN;
        c.state = CommandState::Issued;
        c.ranges.clear();
        c.rsp = None;
        c.retries += 1;
        self.arm_timer(handle, c, self.config.command_timeout());
        let header = FcHeader::new(
            RCtl::UnsolCmd,
            FcType::Fcp,
            c.d_id(),
            s_id,
            FCtl::single_request(),
        )
        .with_exchange(ox_id, XID_UNKNOWN);
        self.send_frame(FcFrame::new(header, c.request.fcp_cmnd().encode()))?;
        log::info!("re-sent FCP_CMND to {} on {:#06x}", c.d_id(), ox_id);
        Ok(())
    }

    // ---- abort ----

    /// Begin aborting `handle`, or join an abort already under way.
    ///
    /// Returns `None` when the command has already completed. The receiver
    /// holds the command's completion code once it completes.
    pub(crate) fn start_abort(
        &self,
        handle: SlotHandle,
        code: CompletionCode,
        op: ItmfOp,
    ) -> Option<watch::Receiver<Option<CompletionCode>>> {
        let abort_timeout = self.config.abort_timeout();
        let (done, sent) = self.commands.with(handle, |c| {
            if let Some(done) = &c.abort_done {
                return (done.subscribe(), false);
            }
            let (tx, rx) = watch::channel(None);
            c.abort_done = Some(tx);
            c.abort_code = code;
            c.transition(CommandState::AbortPending);
            if let Some(recovery) = c.recovery.take() {
                self.exchanges.release_if(recovery.ox_id, |o| {
                    *o == ExchangeOwner::Recovery(handle, recovery.op)
                });
            }
            let sent = match (&self.hw, c.hw_tag) {
                (Some(hw), Some(tag)) => {
                    hw.set_state(tag, HwSlotState::AbtsPending);
                    hw.start(
                        HwOwner::Abort(handle),
                        HwRequest::Itmf {
                            d_id: c.d_id(),
                            lun: c.lun(),
                            op,
                            target_tag: Some(tag.to_tag()),
                        },
                    )
                    .map(|_| ())
                }
                _ => self.send_abts(c),
            };
            // Without an answer the command completes when this fires.
            let limit = abort_timeout + c.session.r_a_tov();
            self.arm_timer(handle, c, limit);
            match sent {
                Ok(()) => {
                    log::info!("aborting {:#06x} to {} ({:?})", c.ox_id, c.d_id(), code);
                    (rx, true)
                }
                Err(e) => {
                    log::warn!("abort of {:#06x} not sent: {}", c.ox_id, e);
                    (rx, false)
                }
            }
        })?;
        if sent {
            self.stats.increment_abts_sent();
        }
        Some(done)
    }

    fn send_abts(&self, c: &Command) -> FcResult<()> {
        let (seq_id, seq_cnt) = self.exchanges.next_sequence(c.ox_id).unwrap_or((0, 0));
        let header = FcHeader::new(
            RCtl::BaAbts,
            FcType::Bls,
            c.d_id(),
            self.local.port_id,
            FCtl::END_SEQ | FCtl::SEQ_INIT,
        )
        .with_exchange(c.ox_id, c.rx_id)
        .with_sequence(seq_id, seq_cnt);
        self.send_frame(FcFrame::new(header, Bytes::new()))
    }

    /// Abort without waiting; the command completes with `code`.
    pub(crate) fn abort_with(&self, handle: SlotHandle, code: CompletionCode) {
        let _ = self.start_abort(handle, code, ItmfOp::AbortTask);
    }

    /// Abort a command and wait up to `abort_timeout` for it to complete.
    ///
    /// Aborting a command that already completed succeeds. A second call
    /// while an abort is in progress waits for the first one. Fails with
    /// `TmfFailed` when the adapter could not abort the command.
    pub async fn abort(&self, handle: SlotHandle) -> FcResult<()> {
        let Some(done) = self.start_abort(handle, CompletionCode::Aborted, ItmfOp::AbortTask)
        else {
            return Ok(());
        };
        match tokio::time::timeout(self.config.abort_timeout(), abort_settled(done)).await {
            Ok(Some(CompletionCode::TmfFailed)) => {
                Err(FcError::TmfFailed(format!("abort of {}", handle)))
            }
            Ok(_) => Ok(()),
            Err(_) => {
                log::warn!("abort not confirmed within {:?}", self.config.abort_timeout());
                Err(FcError::Timeout)
            }
        }
    }

    pub(crate) fn on_abort_reply(&self, handle: SlotHandle, frame: &FcFrame) {
        let code = self.commands.with(handle, |c| {
            if c.state != CommandState::AbortPending {
                return None;
            }
            c.transition(CommandState::Aborted);
            Some(c.abort_code)
        });
        if let Some(code) = code.flatten() {
            if frame.r_ctl() == RCtl::BaRjt {
                log::warn!("ABTS for {:#06x} rejected", frame.header.ox_id);
            }
            self.complete(handle, code);
        }
    }
}

/// Wait for an aborting command to complete and return its code. `None`
/// means the command went away without reporting one.
pub(crate) async fn abort_settled(
    mut done: watch::Receiver<Option<CompletionCode>>,
) -> Option<CompletionCode> {
    match done.wait_for(|d| d.is_some()).await {
        Ok(code) => *code,
        Err(_) => None,
    }
}
