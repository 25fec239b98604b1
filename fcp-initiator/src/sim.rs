//! Simulated FCP target
//!
//! A scripted remote port that answers login, commands, recovery and abort
//! frames the way a real target would, with knobs for injecting faults:
//! lost frames, corrupted data, missing responses, short reads and recovery
//! rejects. It works on frames directly, so an initiator wired to a
//! [`RecordingSink`] can be driven without any link in between.

use crate::data::TransferRanges;
use crate::initiator::FcpInitiator;
use bytes::{Bytes, BytesMut};
use fcp_codec::bls::BaAcc;
use fcp_codec::els::{
    ELS_EXPL_NONE, ELS_EXPL_OXID_RXID, EStat, ElsCommand, FC_SPP_RESP_ACK, FcpServiceParams,
    LsRjt, Plogi, Prli, RecAccept, RecRequest, RjtReason, SrrRequest, ls_acc,
};
use fcp_codec::fcp::{FcpCmnd, FcpRsp, FcpXferRdy, RspFlags, TmFlags, rsp_code};
use fcp_codec::{FCtl, FcFrame, FcHeader, FcType, FrameCheck, RCtl};
use fcp_core::{DataDirection, FcId, ScsiLun, ScsiStatus, Wwn};
use fcp_transport::RecordingSink;
use std::collections::HashMap;

/// Fault injection and behaviour switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimBehavior {
    /// Advertise sequence-level recovery in PRLI
    pub retry: bool,
    pub reject_plogi: bool,
    /// Answer REC with LS_RJT "command not supported"
    pub reject_rec: bool,
    /// Answer this many RECs with "still sending"
    pub rec_busy: u32,
    /// Swallow this many FCP_CMNDs without a trace
    pub lose_commands: u32,
    /// Accept commands but never answer them
    pub hold_commands: bool,
    /// Drop the read data frame with this index once
    pub drop_data_frame: Option<usize>,
    /// Send the read data frame with this index once with a bad CRC
    pub corrupt_data_frame: Option<usize>,
    /// Drop this many FCP_RSPs
    pub drop_status: u32,
    /// Send only this many bytes of each read and report the rest as residual
    pub short_read: Option<u32>,
    /// Largest data field of read data frames
    pub max_frame: usize,
    pub scsi_status: ScsiStatus,
    pub sense: Bytes,
    /// FCP_RSP_INFO code for task management replies
    pub tmf_rsp_code: u8,
    /// Ignore everything
    pub silent: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            retry: true,
            reject_plogi: false,
            reject_rec: false,
            rec_busy: 0,
            lose_commands: 0,
            hold_commands: false,
            drop_data_frame: None,
            corrupt_data_frame: None,
            drop_status: 0,
            short_read: None,
            max_frame: 2048,
            scsi_status: ScsiStatus::Good,
            sense: Bytes::new(),
            tmf_rsp_code: rsp_code::TMF_COMPLETE,
            silent: false,
        }
    }
}

/// Read data the simulated target returns: byte `i` is `i % 251`.
pub fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

#[derive(Debug)]
struct SimExchange {
    ox_id: u16,
    rx_id: u16,
    initiator: FcId,
    lun: ScsiLun,
    direction: DataDirection,
    data_len: u32,
    /// Read bytes sent, or write bytes received
    moved: TransferRanges,
    written: BytesMut,
    complete: bool,
}

impl SimExchange {
    fn read_len(&self, short: Option<u32>) -> u32 {
        short.map_or(self.data_len, |s| s.min(self.data_len))
    }
}

/// Scripted FCP target port
#[derive(Debug)]
pub struct TargetSim {
    pub port_id: FcId,
    pub wwpn: Wwn,
    pub wwnn: Wwn,
    pub behavior: SimBehavior,
    exchanges: HashMap<u16, SimExchange>,
    next_rx: u16,
    received: Vec<FcFrame>,
    sent: Vec<FcFrame>,
    writes: Vec<Bytes>,
}

impl TargetSim {
    pub fn new(port_id: FcId, wwpn: Wwn) -> Self {
        Self {
            port_id,
            wwpn,
            wwnn: Wwn::new(wwpn.value() & !(0xF << 60) | (0x1 << 60)),
            behavior: SimBehavior::default(),
            exchanges: HashMap::new(),
            next_rx: 0x100,
            received: Vec::new(),
            sent: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: SimBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Every frame the target has seen, oldest first.
    pub fn received(&self) -> &[FcFrame] {
        &self.received
    }

    /// Every frame the target has answered with, oldest first.
    pub fn sent(&self) -> &[FcFrame] {
        &self.sent
    }

    pub fn count(&self, r_ctl: RCtl) -> usize {
        self.received.iter().filter(|f| f.r_ctl() == r_ctl).count()
    }

    pub fn count_els(&self, command: ElsCommand) -> usize {
        self.received
            .iter()
            .filter(|f| f.r_ctl() == RCtl::ElsRequest || f.r_ctl() == RCtl::Els4Request)
            .filter(|f| ElsCommand::of(&f.payload) == Some(command))
            .count()
    }

    pub fn clear_log(&mut self) {
        self.received.clear();
        self.sent.clear();
    }

    /// Data of completed writes, in completion order.
    pub fn writes(&self) -> &[Bytes] {
        &self.writes
    }

    /// Commands the target has accepted and not yet finished or aborted.
    pub fn open_exchanges(&self) -> usize {
        self.exchanges.values().filter(|x| !x.complete).count()
    }

    /// Deliver everything queued on `sink` to the target and its answers to
    /// `initiator`, until no frames are left. Returns the number of frames
    /// the target handled.
    pub fn pump(&mut self, sink: &RecordingSink, initiator: &FcpInitiator) -> usize {
        let mut handled = 0;
        loop {
            let frames = sink.take();
            if frames.is_empty() {
                return handled;
            }
            for frame in frames {
                handled += 1;
                for reply in self.handle(frame) {
                    initiator.recv_frame(reply);
                }
            }
        }
    }

    /// Process one frame addressed to the target and return its answers.
    pub fn handle(&mut self, frame: FcFrame) -> Vec<FcFrame> {
        self.received.push(frame.clone());
        if self.behavior.silent || frame.header.d_id != self.port_id {
            return Vec::new();
        }
        let replies = self.answer(&frame);
        self.sent.extend(replies.iter().cloned());
        replies
    }

    fn answer(&mut self, frame: &FcFrame) -> Vec<FcFrame> {
        match (frame.r_ctl(), frame.fc_type()) {
            (RCtl::ElsRequest, FcType::Els) => self.on_els(frame),
            (RCtl::Els4Request, FcType::Fcp) => self.on_srr(frame),
            (RCtl::UnsolCmd, FcType::Fcp) => self.on_command(frame),
            (RCtl::SolData, FcType::Fcp) => self.on_write_data(frame),
            (RCtl::BaAbts, FcType::Bls) => self.on_abts(frame),
            _ => Vec::new(),
        }
    }

    // ---- link services ----

    fn els_reply(request: &FcFrame, payload: Bytes) -> FcFrame {
        let header = request
            .header
            .reply(RCtl::ElsReply, FcType::Els, FCtl::final_reply());
        FcFrame::new(header, payload)
    }

    fn on_els(&mut self, frame: &FcFrame) -> Vec<FcFrame> {
        let payload = match ElsCommand::of(&frame.payload) {
            Some(ElsCommand::Plogi) if self.behavior.reject_plogi => {
                LsRjt::new(RjtReason::UnableToPerform, ELS_EXPL_NONE).encode()
            }
            Some(ElsCommand::Plogi) => Plogi {
                wwpn: self.wwpn,
                wwnn: self.wwnn,
                bb_credit: 16,
                max_frame_size: self.behavior.max_frame.min(u16::MAX as usize) as u16,
                e_d_tov: 2_000,
            }
            .encode(ElsCommand::LsAcc),
            Some(ElsCommand::Prli) => {
                let mut params = FcpServiceParams::TARG_FCN;
                if self.behavior.retry {
                    params |= FcpServiceParams::RETRY;
                }
                Prli {
                    establish_image_pair: true,
                    response: FC_SPP_RESP_ACK,
                    params,
                }
                .encode(ElsCommand::LsAcc)
            }
            Some(ElsCommand::Logo) => ls_acc(),
            Some(ElsCommand::Rec) => self.on_rec(frame),
            _ => LsRjt::new(RjtReason::Unsupported, ELS_EXPL_NONE).encode(),
        };
        vec![Self::els_reply(frame, payload)]
    }

    fn on_rec(&mut self, frame: &FcFrame) -> Bytes {
        if self.behavior.reject_rec {
            return LsRjt::new(RjtReason::Unsupported, ELS_EXPL_NONE).encode();
        }
        let Ok(rec) = RecRequest::decode(&frame.payload) else {
            return LsRjt::new(RjtReason::ProtocolError, ELS_EXPL_NONE).encode();
        };
        let Some(x) = self.exchanges.get(&rec.ox_id) else {
            return LsRjt::new(RjtReason::LogicalError, ELS_EXPL_OXID_RXID).encode();
        };
        let mut e_stat = EStat::RESPONDER;
        if self.behavior.rec_busy > 0 {
            self.behavior.rec_busy -= 1;
            e_stat |= EStat::SEQ_INIT;
        } else if x.complete {
            e_stat |= EStat::COMPLETE;
        }
        RecAccept {
            ox_id: x.ox_id,
            rx_id: x.rx_id,
            originator: x.initiator,
            responder: self.port_id,
            offset: x.moved.total(),
            e_stat,
        }
        .encode()
    }

    fn on_srr(&mut self, frame: &FcFrame) -> Vec<FcFrame> {
        let header = frame
            .header
            .reply(RCtl::Els4Reply, FcType::Fcp, FCtl::final_reply());
        let Ok(srr) = SrrRequest::decode(&frame.payload) else {
            let rjt = LsRjt::new(RjtReason::ProtocolError, ELS_EXPL_NONE).encode();
            return vec![FcFrame::new(header, rjt)];
        };
        let Some(x) = self.exchanges.get(&srr.ox_id) else {
            let rjt = LsRjt::new(RjtReason::LogicalError, ELS_EXPL_OXID_RXID).encode();
            return vec![FcFrame::new(header, rjt)];
        };
        let ox_id = x.ox_id;
        let mut out = vec![FcFrame::new(header, ls_acc())];
        match srr.r_ctl {
            RCtl::CmdStatus => out.extend(self.status(ox_id)),
            RCtl::SolData => {
                out.extend(self.read_data(ox_id, srr.rel_off));
                out.extend(self.status(ox_id));
            }
            RCtl::DataDesc => out.extend(self.transfer_ready(ox_id, srr.rel_off)),
            other => log::debug!("SRR for unexpected {:?}", other),
        }
        out
    }

    fn on_abts(&mut self, frame: &FcFrame) -> Vec<FcFrame> {
        self.exchanges.remove(&frame.header.ox_id);
        let header = frame
            .header
            .reply(RCtl::BaAcc, FcType::Bls, FCtl::final_reply());
        let payload = BaAcc::whole_exchange(frame.header.ox_id, frame.header.rx_id).encode();
        vec![FcFrame::new(header, payload)]
    }

    // ---- commands ----

    fn on_command(&mut self, frame: &FcFrame) -> Vec<FcFrame> {
        let Ok(cmnd) = FcpCmnd::decode(&frame.payload) else {
            return Vec::new();
        };
        if !cmnd.tm_flags.is_empty() {
            return vec![self.task_management(frame, &cmnd)];
        }
        if self.behavior.lose_commands > 0 {
            self.behavior.lose_commands -= 1;
            return Vec::new();
        }
        let rx_id = self.next_rx;
        self.next_rx = self.next_rx.wrapping_add(1);
        let ox_id = frame.header.ox_id;
        self.exchanges.insert(
            ox_id,
            SimExchange {
                ox_id,
                rx_id,
                initiator: frame.header.s_id,
                lun: cmnd.lun,
                direction: cmnd.direction,
                data_len: cmnd.data_len,
                moved: TransferRanges::new(),
                written: BytesMut::zeroed(match cmnd.direction {
                    DataDirection::Write => cmnd.data_len as usize,
                    _ => 0,
                }),
                complete: false,
            },
        );
        if self.behavior.hold_commands {
            return Vec::new();
        }
        match cmnd.direction {
            DataDirection::Read => {
                let mut out = self.read_data(ox_id, 0);
                out.extend(self.status(ox_id));
                out
            }
            DataDirection::Write if cmnd.data_len > 0 => self.transfer_ready(ox_id, 0),
            _ => self.status(ox_id).into_iter().collect(),
        }
    }

    fn task_management(&mut self, frame: &FcFrame, cmnd: &FcpCmnd) -> FcFrame {
        let code = self.behavior.tmf_rsp_code;
        if code == rsp_code::TMF_COMPLETE {
            let initiator = frame.header.s_id;
            let lun = cmnd.lun;
            let target_wide = cmnd.tm_flags.contains(TmFlags::TARGET_RESET);
            self.exchanges
                .retain(|_, x| x.initiator != initiator || (!target_wide && x.lun != lun));
        }
        let rsp = FcpRsp {
            rsp_code: Some(code),
            ..FcpRsp::good()
        };
        let header = frame
            .header
            .reply(RCtl::CmdStatus, FcType::Fcp, FCtl::final_reply());
        FcFrame::new(header, rsp.encode())
    }

    fn header(&self, x: &SimExchange, r_ctl: RCtl, f_ctl: FCtl) -> FcHeader {
        FcHeader::new(r_ctl, FcType::Fcp, x.initiator, self.port_id, f_ctl | FCtl::EX_CTX)
            .with_exchange(x.ox_id, x.rx_id)
    }

    /// Read data from `offset` to the end of what this target returns.
    fn read_data(&mut self, ox_id: u16, offset: u32) -> Vec<FcFrame> {
        let short = self.behavior.short_read;
        let max = self.behavior.max_frame.max(1) as u32;
        let Some(x) = self.exchanges.get(&ox_id) else {
            return Vec::new();
        };
        if x.direction != DataDirection::Read {
            return Vec::new();
        }
        let end = x.read_len(short);
        let data = pattern(end as usize);
        let mut frames = Vec::new();
        let mut sent = Vec::new();
        for (index, off) in (offset..end).step_by(max as usize).enumerate() {
            let len = max.min(end - off);
            sent.push((off, len));
            let global = (off / max) as usize;
            if self.behavior.drop_data_frame == Some(global) {
                self.behavior.drop_data_frame = None;
                continue;
            }
            let header = self
                .header(x, RCtl::SolData, FCtl::REL_OFF)
                .with_sequence(1, index as u16)
                .with_parameter(off);
            let mut frame =
                FcFrame::new(header, data.slice(off as usize..(off + len) as usize));
            if self.behavior.corrupt_data_frame == Some(global) {
                self.behavior.corrupt_data_frame = None;
                frame.check = FrameCheck::Unchecked(frame.compute_crc() ^ 0xFFFF_FFFF);
            }
            frames.push(frame);
        }
        if let Some(x) = self.exchanges.get_mut(&ox_id) {
            for (off, len) in sent {
                x.moved.insert(off, len);
            }
        }
        frames
    }

    fn transfer_ready(&mut self, ox_id: u16, offset: u32) -> Vec<FcFrame> {
        let Some(x) = self.exchanges.get(&ox_id) else {
            return Vec::new();
        };
        let xfer = FcpXferRdy {
            offset,
            burst_len: x.data_len.saturating_sub(offset),
        };
        let header = self
            .header(x, RCtl::DataDesc, FCtl::END_SEQ | FCtl::SEQ_INIT)
            .with_sequence(2, 0);
        vec![FcFrame::new(header, xfer.encode())]
    }

    fn on_write_data(&mut self, frame: &FcFrame) -> Vec<FcFrame> {
        let ox_id = frame.header.ox_id;
        let Some(x) = self.exchanges.get_mut(&ox_id) else {
            return Vec::new();
        };
        let offset = frame.header.parameter as usize;
        let end = offset + frame.payload.len();
        if end > x.written.len() {
            return Vec::new();
        }
        x.written[offset..end].copy_from_slice(&frame.payload);
        x.moved.insert(offset as u32, frame.payload.len() as u32);
        let last = frame.f_ctl().contains(FCtl::END_SEQ);
        if last && x.moved.contiguous() >= x.data_len {
            self.writes.push(x.written.clone().freeze());
            return self.status(ox_id).into_iter().collect();
        }
        Vec::new()
    }

    /// FCP_RSP for an exchange; the target considers the command done even
    /// when the frame is dropped.
    fn status(&mut self, ox_id: u16) -> Option<FcFrame> {
        let short = self.behavior.short_read;
        let x = self.exchanges.get_mut(&ox_id)?;
        x.complete = true;
        let mut rsp = FcpRsp {
            status: self.behavior.scsi_status,
            sense: self.behavior.sense.clone(),
            ..FcpRsp::good()
        };
        if x.direction == DataDirection::Read {
            let resid = x.data_len - x.read_len(short);
            if resid > 0 {
                rsp.flags |= RspFlags::RESID_UNDER;
                rsp.resid = resid;
            }
        }
        if self.behavior.drop_status > 0 {
            self.behavior.drop_status -= 1;
            return None;
        }
        let x = self.exchanges.get(&ox_id)?;
        let header = self
            .header(x, RCtl::CmdStatus, FCtl::LAST_SEQ | FCtl::END_SEQ)
            .with_sequence(3, 0);
        Some(FcFrame::new(header, rsp.encode()))
    }

    /// Send LOGO to the initiator, as a target does when it drops a login.
    pub fn logout_frame(&self, initiator: FcId, ox_id: u16) -> FcFrame {
        let header = FcHeader::new(
            RCtl::ElsRequest,
            FcType::Els,
            initiator,
            self.port_id,
            FCtl::single_request(),
        )
        .with_exchange(ox_id, fcp_codec::header::XID_UNKNOWN);
        let logo = fcp_codec::els::Logo {
            s_id: self.port_id,
            wwpn: self.wwpn,
        };
        FcFrame::new(header, logo.encode())
    }
}
