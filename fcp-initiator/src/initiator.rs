//! FCP initiator engine
//!
//! [`FcpInitiator`] turns SCSI requests into FC exchanges and drives them to
//! completion. Two producers feed it concurrently: callers issuing,
//! aborting and resetting on one side, and the delivery path
//! ([`FcpInitiator::recv_frame`], [`FcpInitiator::on_hw_completion`],
//! [`FcpInitiator::on_timer`]) on the other. The delivery path never waits.
//!
//! Every command lives in a generation-tagged slot. Handlers look at the
//! command under its slot lock, decide what to do, and act (in particular,
//! complete) after the lock is released. [`FcpInitiator::complete`] removes
//! the command from its slot, so whichever path gets there first completes
//! it and every later attempt finds the slot empty.

use crate::command::{
    Command, CommandState, CompletionCode, CompletionHandler, IssueMode, Outcome, RecoveryOp,
    Rejected, ScsiRequest,
};
use crate::config::InitiatorConfig;
use crate::events::{HostEventKind, HostEventQueue, SessionEventBridge};
use crate::hw::{HwOwner, HwTracker};
use crate::lun::LunHealthTable;
use crate::statistics::{InitiatorStatistics, StatisticsSnapshot};
use crate::timer::{TimerKey, TimerService};
use async_trait::async_trait;
use bytes::Bytes;
use fcp_codec::bls::BaAcc;
use fcp_codec::els::{ELS_EXPL_NONE, ElsCommand, LsRjt, RjtReason, ls_acc};
use fcp_codec::header::XID_UNKNOWN;
use fcp_codec::{FCtl, FcFrame, FcHeader, FcType, RCtl};
use fcp_core::{DataDirection, FcError, FcId, FcResult, SlotHandle, SlotTable, Wwn};
use fcp_session::{ElsRequester, ExchangeManager, ServiceParams, Session, SessionTable};
use fcp_transport::{FrameSink, HwRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Who an open exchange belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeOwner {
    Command(SlotHandle),
    Recovery(SlotHandle, RecoveryOp),
    /// Request/reply exchange awaited in `exchange_request`
    Request,
}

pub(crate) struct Parts {
    pub config: InitiatorConfig,
    pub local: ServiceParams,
    pub sink: Arc<dyn FrameSink>,
    pub timers: Arc<dyn TimerService>,
    pub hw: Option<HwTracker>,
    pub events: HostEventQueue,
}

/// SCSI initiator over one local FC port
pub struct FcpInitiator {
    pub(crate) me: Weak<FcpInitiator>,
    pub(crate) config: InitiatorConfig,
    pub(crate) local: ServiceParams,
    pub(crate) sessions: Arc<SessionTable>,
    pub(crate) exchanges: ExchangeManager<ExchangeOwner>,
    pub(crate) commands: SlotTable<Command>,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) timers: Arc<dyn TimerService>,
    pub(crate) hw: Option<HwTracker>,
    pub(crate) luns: LunHealthTable,
    pub(crate) events: HostEventQueue,
    pub(crate) waiters: Mutex<HashMap<u16, oneshot::Sender<FcResult<FcFrame>>>>,
    pub(crate) stats: InitiatorStatistics,
}

impl FcpInitiator {
    pub(crate) fn new(parts: Parts) -> Arc<Self> {
        let Parts {
            config,
            local,
            sink,
            timers,
            hw,
            events,
        } = parts;
        let sessions = Arc::new(SessionTable::new(local, config.login_config()));
        sessions.add_listener(Arc::new(SessionEventBridge {
            events: events.clone(),
        }));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            exchanges: ExchangeManager::new(config.xid_range()),
            commands: SlotTable::with_capacity(config.max_outstanding),
            luns: LunHealthTable::new(config.lun_failure_threshold),
            waiters: Mutex::new(HashMap::new()),
            stats: InitiatorStatistics::new(),
            config,
            local,
            sessions,
            sink,
            timers,
            hw,
            events,
        })
    }

    pub fn local_port(&self) -> FcId {
        self.local.port_id
    }

    pub fn config(&self) -> &InitiatorConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.set_events_dropped(self.events.dropped());
        self.stats.snapshot()
    }

    /// Commands issued and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.commands.len()
    }

    pub fn is_outstanding(&self, handle: SlotHandle) -> bool {
        self.commands.contains(handle)
    }

    pub fn command_state(&self, handle: SlotHandle) -> Option<CommandState> {
        self.commands.with(handle, |c| c.state)
    }

    /// Open exchanges, including ELS and recovery exchanges.
    pub fn open_exchanges(&self) -> usize {
        self.exchanges.len()
    }

    // ---- sessions ----

    /// Get the session to `d_id`, starting login if it is not ready.
    pub fn login(&self, d_id: FcId) -> Arc<Session> {
        let session = self.sessions.lookup_or_create(self.local.port_id, d_id);
        if !session.is_ready() {
            self.start_login(&session);
        }
        session
    }

    /// Log in to `d_id` and wait until the session is ready.
    pub async fn wait_for_session(&self, d_id: FcId, timeout: Duration) -> FcResult<Arc<Session>> {
        let session = self.login(d_id);
        session.wait_ready(timeout).await?;
        Ok(session)
    }

    /// Send LOGO to `d_id`. Commands still running to it complete as
    /// transport disrupted.
    pub fn logout(&self, d_id: FcId) -> Option<JoinHandle<()>> {
        let session = self.sessions.find(d_id)?;
        self.sessions.mark_ready(&session, false);
        self.complete_where(|c| c.d_id() == d_id, CompletionCode::TransportDisrupted);
        let me = self.me.upgrade()?;
        Some(self.sessions.stop(session, me))
    }

    pub(crate) fn start_login(&self, session: &Arc<Session>) {
        if let Some(me) = self.me.upgrade() {
            self.sessions.start(session.clone(), me);
        }
    }

    pub(crate) fn ready_session(&self, d_id: FcId) -> FcResult<Arc<Session>> {
        self.sessions
            .find(d_id)
            .filter(|s| s.is_ready())
            .ok_or_else(|| FcError::NoSession(d_id.to_string()))
    }

    // ---- issue path ----

    /// Start `request` now. Fails with `NoSession` unless the session to the
    /// target is ready. On success `handler` is called exactly once with
    /// the outcome; on rejection it is never called.
    pub fn queue_command(
        &self,
        request: ScsiRequest,
        handler: Box<dyn CompletionHandler>,
    ) -> Result<SlotHandle, Rejected> {
        if self.luns.is_degraded(request.d_id, request.lun) {
            let lun = format!("{}/{}", request.d_id, request.lun.to_u64());
            return Err(Rejected {
                error: FcError::LunDegraded(lun),
                request,
            });
        }
        if request.direction == DataDirection::Write
            && request.data.len() != request.data_len as usize
        {
            let error = FcError::InvalidData(format!(
                "write of {} bytes carries {} bytes of data",
                request.data_len,
                request.data.len()
            ));
            return Err(Rejected { error, request });
        }
        let session = match self.ready_session(request.d_id) {
            Ok(session) => session,
            Err(error) => return Err(Rejected { error, request }),
        };

        // Counted before the command becomes visible, so a completion racing
        // this issue never releases a reference it does not hold.
        let key = session.key();
        session.acquire();
        let handle = match self.commands.insert(Command::new(request, session, handler)) {
            Ok(handle) => handle,
            Err(command) => {
                self.sessions.release(key);
                return Err(Rejected {
                    error: FcError::ResourceExhausted("command slots".into()),
                    request: command.request,
                });
            }
        };

        if let Err(error) = self.start_command(handle) {
            // A concurrent reset may have completed the command already, in
            // which case its handler has run and the issue counts as done.
            if let Some(command) = self.commands.take(handle) {
                self.sessions.release(key);
                log::debug!("command to {} not started: {}", command.d_id(), error);
                return Err(Rejected {
                    error,
                    request: command.request,
                });
            }
        }
        self.stats.increment_commands_issued();
        Ok(handle)
    }

    /// Issue `request`, waiting for login first when `mode` asks for it.
    pub async fn issue(
        &self,
        request: ScsiRequest,
        mode: IssueMode,
        handler: Box<dyn CompletionHandler>,
    ) -> Result<SlotHandle, Rejected> {
        if mode == IssueMode::WaitReady {
            if let Err(error) = self
                .wait_for_session(request.d_id, self.config.login_wait())
                .await
            {
                return Err(Rejected { error, request });
            }
        }
        self.queue_command(request, handler)
    }

    /// Issue `request` and wait for its outcome.
    pub async fn execute(&self, request: ScsiRequest, mode: IssueMode) -> FcResult<Outcome> {
        let (tx, rx) = oneshot::channel();
        let handler = Box::new(move |outcome: Outcome| {
            let _ = tx.send(outcome);
        });
        self.issue(request, mode, handler)
            .await
            .map_err(|rejected| rejected.error)?;
        rx.await.map_err(|_| FcError::Closed)
    }

    fn start_command(&self, handle: SlotHandle) -> FcResult<()> {
        let (d_id, cmnd, data, rec) = self
            .commands
            .with(handle, |c| {
                (
                    c.d_id(),
                    c.request.fcp_cmnd(),
                    c.request.data.clone(),
                    c.session.rec_supported(),
                )
            })
            .ok_or(FcError::Aborted)?;

        if let Some(hw) = &self.hw {
            let tag = hw.start(
                HwOwner::Command(handle),
                HwRequest::Icmnd { d_id, cmnd, data },
            )?;
            let timeout = self.config.command_timeout();
            self.commands.with(handle, |c| {
                c.hw_tag = Some(tag);
                self.arm_timer(handle, c, timeout);
            });
            return Ok(());
        }

        let s_id = self.local.port_id;
        let ox_id = self
            .exchanges
            .alloc(s_id, d_id, ExchangeOwner::Command(handle))?;
        let timeout = if rec {
            self.config.command_timeout()
        } else {
            self.config.coarse_timeout()
        };
        let token = self.commands.with(handle, |c| {
            c.ox_id = ox_id;
            self.arm_timer(handle, c, timeout);
            c.timer_token
        });
        let Some(token) = token else {
            self.exchanges.release(ox_id);
            return Err(FcError::Aborted);
        };
        let header = FcHeader::new(RCtl::UnsolCmd, FcType::Fcp, d_id, s_id, FCtl::single_request())
            .with_exchange(ox_id, XID_UNKNOWN);
        if let Err(e) = self.send_frame(FcFrame::new(header, cmnd.encode())) {
            self.exchanges
                .release_if(ox_id, |o| *o == ExchangeOwner::Command(handle));
            self.timers.cancel(TimerKey {
                command: handle,
                token,
            });
            return Err(e);
        }
        log::debug!(
            "FCP_CMND {:#04x} to {} lun {} on {:#06x}",
            cmnd.cdb[0],
            d_id,
            cmnd.lun.to_u64(),
            ox_id
        );
        Ok(())
    }

    // ---- shared helpers ----

    /// Send one frame; on a full queue reclaim once and retry once.
    pub(crate) fn send_frame(&self, frame: FcFrame) -> FcResult<()> {
        match self.sink.send(frame.clone()) {
            Ok(()) => {}
            Err(FcError::ResourceExhausted(reason)) => {
                let reclaimed = self.sink.reclaim();
                log::debug!("{}; reclaimed {}, retrying", reason, reclaimed);
                self.sink.send(frame)?;
            }
            Err(e) => return Err(e),
        }
        self.stats.increment_frames_sent();
        Ok(())
    }

    /// Replace the command's timer with a new period.
    pub(crate) fn arm_timer(&self, handle: SlotHandle, command: &mut Command, after: Duration) {
        self.timers.cancel(TimerKey {
            command: handle,
            token: command.timer_token,
        });
        let token = command.next_timer_token();
        self.timers.arm(
            TimerKey {
                command: handle,
                token,
            },
            after,
        );
    }

    /// Largest data field to send on `session`.
    pub(crate) fn max_payload(&self, session: &Session) -> u32 {
        u32::from(self.config.max_payload).min(session.max_payload() as u32)
    }

    // ---- completion ----

    /// Terminal transition. Returns false when the command had already
    /// completed.
    pub(crate) fn complete(&self, handle: SlotHandle, code: CompletionCode) -> bool {
        let Some(mut command) = self.commands.take(handle) else {
            return false;
        };
        self.timers.cancel(TimerKey {
            command: handle,
            token: command.timer_token,
        });
        self.exchanges
            .release_if(command.ox_id, |o| *o == ExchangeOwner::Command(handle));
        if let Some(recovery) = command.recovery.take() {
            self.exchanges.release_if(recovery.ox_id, |o| {
                *o == ExchangeOwner::Recovery(handle, recovery.op)
            });
        }
        if let (Some(hw), Some(tag)) = (&self.hw, command.hw_tag) {
            hw.release(tag);
        }
        command.state = CommandState::Completed;
        self.sessions.release(command.session.key());

        let d_id = command.d_id();
        let lun = command.lun();
        if self.luns.record(d_id, lun, code.is_hard_failure()) {
            let wwpn = command
                .session
                .remote_port()
                .map(|r| r.wwpn)
                .unwrap_or_default();
            self.events.post(HostEventKind::LunDegraded, d_id, wwpn);
        }
        self.stats.increment_commands_completed();
        if code != CompletionCode::Ok {
            self.stats.increment_commands_failed();
        }
        if code == CompletionCode::TimedOut {
            self.stats.increment_timeouts();
        }

        let outcome = command.outcome(code);
        log::debug!(
            "command {:#06x} to {} complete: {:?} status {:?}, {} bytes",
            command.ox_id,
            d_id,
            code,
            outcome.scsi_status,
            outcome.transferred
        );
        if let Some(done) = command.abort_done.take() {
            done.send_replace(Some(code));
        }
        if let Some(handler) = command.handler.take() {
            handler.on_complete(outcome);
        }
        true
    }

    /// Complete every command matching `pred` with `code`.
    pub(crate) fn complete_where(
        &self,
        pred: impl FnMut(&Command) -> bool,
        code: CompletionCode,
    ) -> usize {
        self.commands
            .select(pred)
            .into_iter()
            .filter(|h| self.complete(*h, code))
            .count()
    }

    /// Fail every request awaiting a reply.
    pub(crate) fn fail_requests(&self) {
        let waiters: Vec<_> = self.waiters.lock().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(FcError::Aborted));
        }
    }

    // ---- delivery path ----

    /// Handle one inbound frame.
    pub fn recv_frame(&self, frame: FcFrame) {
        self.stats.increment_frames_received();
        // Data frames carry their own CRC handling; anything else that
        // fails is treated as lost.
        if frame.r_ctl() != RCtl::SolData && !frame.crc_valid() {
            self.stats.increment_crc_errors();
            log::warn!(
                "dropping {:?} from {} with bad CRC",
                frame.r_ctl(),
                frame.header.s_id
            );
            return;
        }
        if frame.header.from_responder() {
            self.on_exchange_frame(frame);
        } else {
            self.on_unsolicited(frame);
        }
    }

    fn on_exchange_frame(&self, frame: FcFrame) {
        let ox_id = frame.header.ox_id;
        match self.exchanges.owner(ox_id) {
            Some(ExchangeOwner::Command(handle)) => {
                self.exchanges.set_rx_id(ox_id, frame.header.rx_id);
                self.on_command_frame(handle, frame);
            }
            Some(ExchangeOwner::Recovery(handle, op)) => self.on_recovery_reply(handle, op, frame),
            Some(ExchangeOwner::Request) => {
                let waiter = self.waiters.lock().remove(&ox_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(frame));
                    }
                    None => self.stats.increment_frames_dropped(),
                }
            }
            None => {
                self.stats.increment_frames_dropped();
                log::debug!(
                    "{:?} from {} for closed exchange {:#06x}",
                    frame.r_ctl(),
                    frame.header.s_id,
                    ox_id
                );
            }
        }
    }

    fn on_command_frame(&self, handle: SlotHandle, frame: FcFrame) {
        self.commands.with(handle, |c| {
            if c.rx_id == XID_UNKNOWN {
                c.rx_id = frame.header.rx_id;
            }
        });
        match frame.r_ctl() {
            RCtl::DataDesc => self.on_transfer_ready(handle, &frame),
            RCtl::SolData => self.on_solicited_data(handle, &frame),
            RCtl::CmdStatus => self.on_status(handle, &frame),
            RCtl::BaAcc | RCtl::BaRjt => self.on_abort_reply(handle, &frame),
            RCtl::BaAbts => self.on_target_abort(handle, &frame),
            other => log::warn!(
                "unexpected {:?} on exchange {:#06x}",
                other,
                frame.header.ox_id
            ),
        }
    }

    /// The target aborted one of our exchanges.
    fn on_target_abort(&self, handle: SlotHandle, frame: &FcFrame) {
        let header = frame
            .header
            .reply(RCtl::BaAcc, FcType::Bls, FCtl::LAST_SEQ | FCtl::END_SEQ);
        let payload = BaAcc::whole_exchange(frame.header.ox_id, frame.header.rx_id).encode();
        if let Err(e) = self.send_frame(FcFrame::new(header, payload)) {
            log::warn!("BA_ACC to {} failed: {}", frame.header.s_id, e);
        }
        log::warn!(
            "{} aborted exchange {:#06x}",
            frame.header.s_id,
            frame.header.ox_id
        );
        self.complete(handle, CompletionCode::TransportDisrupted);
    }

    fn on_unsolicited(&self, frame: FcFrame) {
        match (frame.r_ctl(), frame.fc_type()) {
            (RCtl::ElsRequest, FcType::Els) => self.on_els_request(&frame),
            (RCtl::BaAbts, FcType::Bls) => {
                let header = frame
                    .header
                    .reply(RCtl::BaAcc, FcType::Bls, FCtl::final_reply());
                let payload =
                    BaAcc::whole_exchange(frame.header.ox_id, frame.header.rx_id).encode();
                if let Err(e) = self.send_frame(FcFrame::new(header, payload)) {
                    log::warn!("BA_ACC to {} failed: {}", frame.header.s_id, e);
                }
            }
            (r_ctl, fc_type) => {
                self.stats.increment_frames_dropped();
                log::debug!(
                    "ignoring unsolicited {:?}/{:?} from {}",
                    r_ctl,
                    fc_type,
                    frame.header.s_id
                );
            }
        }
    }

    fn on_els_request(&self, frame: &FcFrame) {
        let s_id = frame.header.s_id;
        match ElsCommand::of(&frame.payload) {
            Some(ElsCommand::Logo) => {
                self.reply_els(frame, ls_acc());
                log::info!("LOGO from {}", s_id);
                self.target_logged_out(s_id);
            }
            Some(ElsCommand::Rscn) => {
                self.reply_els(frame, ls_acc());
                log::info!("RSCN from {}", s_id);
                self.events.post(HostEventKind::Rscn, s_id, Wwn::default());
            }
            other => {
                log::debug!("rejecting ELS {:?} from {}", other, s_id);
                self.reply_els(
                    frame,
                    LsRjt::new(RjtReason::Unsupported, ELS_EXPL_NONE).encode(),
                );
            }
        }
    }

    fn reply_els(&self, request: &FcFrame, payload: Bytes) {
        let header = request
            .header
            .reply(RCtl::ElsReply, FcType::Els, FCtl::final_reply());
        if let Err(e) = self.send_frame(FcFrame::new(header, payload)) {
            log::warn!("ELS reply to {} failed: {}", request.header.s_id, e);
        }
    }

    fn target_logged_out(&self, d_id: FcId) {
        let Some(session) = self.sessions.find(d_id) else {
            return;
        };
        self.sessions.mark_ready(&session, false);
        let disrupted =
            self.complete_where(|c| c.d_id() == d_id, CompletionCode::TransportDisrupted);
        if disrupted > 0 {
            log::warn!("{} commands to {} disrupted by logout", disrupted, d_id);
        }
        self.sessions.logged_out(&session);
    }

    // ---- request / reply exchanges ----

    /// Send a single-frame request on a new exchange and wait for the first
    /// frame the responder sends back.
    pub(crate) async fn exchange_request(
        &self,
        d_id: FcId,
        r_ctl: RCtl,
        fc_type: FcType,
        payload: Bytes,
        timeout: Duration,
    ) -> FcResult<FcFrame> {
        let s_id = self.local.port_id;
        let ox_id = self.exchanges.alloc(s_id, d_id, ExchangeOwner::Request)?;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(ox_id, tx);

        let header = FcHeader::new(r_ctl, fc_type, d_id, s_id, FCtl::single_request())
            .with_exchange(ox_id, XID_UNKNOWN);
        let result = match self.send_frame(FcFrame::new(header, payload)) {
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(FcError::Closed),
                Err(_) => {
                    log::warn!("{:?} to {} timed out on {:#06x}", r_ctl, d_id, ox_id);
                    Err(FcError::Timeout)
                }
            },
            Err(e) => Err(e),
        };
        self.waiters.lock().remove(&ox_id);
        self.exchanges
            .release_if(ox_id, |o| *o == ExchangeOwner::Request);
        result
    }

    /// Send an ELS request and return the reply payload (LS_ACC or LS_RJT).
    pub async fn send_els(&self, d_id: FcId, payload: Bytes) -> FcResult<Bytes> {
        let reply = self
            .exchange_request(
                d_id,
                RCtl::ElsRequest,
                FcType::Els,
                payload,
                self.config.els_timeout(),
            )
            .await?;
        Ok(reply.payload)
    }

    // ---- link state ----

    /// The link came up: log in again to every known port.
    pub fn link_up(&self) {
        log::info!("link up on {}", self.local.port_id);
        self.events
            .post(HostEventKind::LinkUp, self.local.port_id, self.local.wwpn);
        for session in self.sessions.sessions() {
            if !session.is_ready() {
                self.start_login(&session);
            }
        }
    }

    /// The link went down: every session stops being ready and everything in
    /// flight completes as transport disrupted.
    pub fn link_down(&self) {
        log::warn!("link down on {}", self.local.port_id);
        for session in self.sessions.sessions() {
            self.sessions.mark_ready(&session, false);
        }
        self.complete_where(|_| true, CompletionCode::TransportDisrupted);
        self.fail_requests();
        self.exchanges.drain();
        self.events
            .post(HostEventKind::LinkDown, self.local.port_id, self.local.wwpn);
    }
}

#[async_trait]
impl ElsRequester for FcpInitiator {
    async fn els_request(&self, d_id: FcId, payload: Bytes) -> FcResult<Bytes> {
        self.send_els(d_id, payload).await
    }
}

impl std::fmt::Debug for FcpInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcpInitiator")
            .field("local", &self.local.port_id)
            .field("outstanding", &self.commands.len())
            .field("exchanges", &self.exchanges.len())
            .field("hardware", &self.hw.is_some())
            .finish()
    }
}
