//! Extended link services used by the initiator
//!
//! Login (PLOGI, PRLI, LOGO), exchange recovery (REC, SRR) and the generic
//! LS_ACC / LS_RJT replies.

use crate::header::{RCtl, read_fc_id};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fcp_core::{FcError, FcId, FcResult, Wwn};

/// ELS command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElsCommand {
    LsRjt,
    LsAcc,
    Plogi,
    Flogi,
    Logo,
    Rec,
    Srr,
    Prli,
    Prlo,
    Rscn,
    Other(u8),
}

impl ElsCommand {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => ElsCommand::LsRjt,
            0x02 => ElsCommand::LsAcc,
            0x03 => ElsCommand::Plogi,
            0x04 => ElsCommand::Flogi,
            0x05 => ElsCommand::Logo,
            0x13 => ElsCommand::Rec,
            0x14 => ElsCommand::Srr,
            0x20 => ElsCommand::Prli,
            0x21 => ElsCommand::Prlo,
            0x61 => ElsCommand::Rscn,
            other => ElsCommand::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ElsCommand::LsRjt => 0x01,
            ElsCommand::LsAcc => 0x02,
            ElsCommand::Plogi => 0x03,
            ElsCommand::Flogi => 0x04,
            ElsCommand::Logo => 0x05,
            ElsCommand::Rec => 0x13,
            ElsCommand::Srr => 0x14,
            ElsCommand::Prli => 0x20,
            ElsCommand::Prlo => 0x21,
            ElsCommand::Rscn => 0x61,
            ElsCommand::Other(v) => v,
        }
    }

    /// Command code of an ELS payload.
    pub fn of(payload: &[u8]) -> Option<Self> {
        payload.first().map(|b| Self::from_u8(*b))
    }
}

fn check_len(what: &str, payload: &[u8], need: usize) -> FcResult<()> {
    if payload.len() < need {
        return Err(FcError::FrameInvalid(format!(
            "{} needs {} bytes, got {}",
            what,
            need,
            payload.len()
        )));
    }
    Ok(())
}

fn expect_command(what: &str, payload: &[u8], cmd: ElsCommand) -> FcResult<()> {
    match ElsCommand::of(payload) {
        Some(c) if c == cmd => Ok(()),
        other => Err(FcError::Protocol(format!(
            "{} expected {:?}, got {:?}",
            what, cmd, other
        ))),
    }
}

/// Outcome of an ELS request as seen by the originator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElsReply {
    Accept(Bytes),
    Reject(LsRjt),
}

impl ElsReply {
    pub fn parse(payload: Bytes) -> FcResult<Self> {
        match ElsCommand::of(&payload) {
            Some(ElsCommand::LsAcc) => Ok(ElsReply::Accept(payload)),
            Some(ElsCommand::LsRjt) => Ok(ElsReply::Reject(LsRjt::decode(&payload)?)),
            other => Err(FcError::Protocol(format!(
                "ELS reply is neither LS_ACC nor LS_RJT: {:?}",
                other
            ))),
        }
    }

    /// Accept payload, or the reject mapped to [`FcError::Rejected`].
    pub fn into_accept(self) -> FcResult<Bytes> {
        match self {
            ElsReply::Accept(payload) => Ok(payload),
            ElsReply::Reject(rjt) => Err(FcError::Rejected {
                reason: rjt.reason.as_u8(),
                explanation: rjt.explanation,
            }),
        }
    }
}

/// Plain LS_ACC with no command-specific body.
pub fn ls_acc() -> Bytes {
    Bytes::from_static(&[0x02, 0, 0, 0])
}

/// LS_RJT reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RjtReason {
    InvalidCommand,
    LogicalError,
    LogicalBusy,
    ProtocolError,
    UnableToPerform,
    Unsupported,
    Other(u8),
}

impl RjtReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => RjtReason::InvalidCommand,
            0x03 => RjtReason::LogicalError,
            0x05 => RjtReason::LogicalBusy,
            0x07 => RjtReason::ProtocolError,
            0x09 => RjtReason::UnableToPerform,
            0x0b => RjtReason::Unsupported,
            other => RjtReason::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RjtReason::InvalidCommand => 0x01,
            RjtReason::LogicalError => 0x03,
            RjtReason::LogicalBusy => 0x05,
            RjtReason::ProtocolError => 0x07,
            RjtReason::UnableToPerform => 0x09,
            RjtReason::Unsupported => 0x0b,
            RjtReason::Other(v) => v,
        }
    }
}

/// LS_RJT explanation: no additional explanation
pub const ELS_EXPL_NONE: u8 = 0x00;
/// LS_RJT explanation: invalid OX_ID-RX_ID combination
pub const ELS_EXPL_OXID_RXID: u8 = 0x17;

/// LS_RJT payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsRjt {
    pub reason: RjtReason,
    pub explanation: u8,
}

impl LsRjt {
    pub const LEN: usize = 8;

    pub fn new(reason: RjtReason, explanation: u8) -> Self {
        Self {
            reason,
            explanation,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(ElsCommand::LsRjt.as_u8());
        buf.put_bytes(0, 4);
        buf.put_u8(self.reason.as_u8());
        buf.put_u8(self.explanation);
        buf.put_u8(0);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        check_len("LS_RJT", payload, Self::LEN)?;
        expect_command("LS_RJT", payload, ElsCommand::LsRjt)?;
        Ok(Self {
            reason: RjtReason::from_u8(payload[5]),
            explanation: payload[6],
        })
    }
}

/// REC request: read the state of an exchange we originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecRequest {
    /// Originator of the exchange being queried
    pub s_id: FcId,
    pub ox_id: u16,
    pub rx_id: u16,
}

impl RecRequest {
    pub const LEN: usize = 12;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(ElsCommand::Rec.as_u8());
        buf.put_bytes(0, 3);
        buf.put_u8(0);
        buf.put_slice(&self.s_id.to_bytes());
        buf.put_u16(self.ox_id);
        buf.put_u16(self.rx_id);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        check_len("REC", payload, Self::LEN)?;
        expect_command("REC", payload, ElsCommand::Rec)?;
        let mut buf = &payload[5..];
        Ok(Self {
            s_id: read_fc_id(&mut buf),
            ox_id: buf.get_u16(),
            rx_id: buf.get_u16(),
        })
    }
}

bitflags! {
    /// Exchange status word in the REC accept
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EStat: u32 {
        /// The replying port is the exchange responder
        const RESPONDER = 1 << 31;
        /// The replying port holds sequence initiative
        const SEQ_INIT = 1 << 30;
        const COMPLETE = 1 << 29;
        const ABNORMAL = 1 << 28;
        const REC_QUALIFIER = 1 << 26;
    }
}

/// REC accept payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecAccept {
    pub ox_id: u16,
    pub rx_id: u16,
    pub originator: FcId,
    pub responder: FcId,
    /// Bytes the responder has sent or received on this exchange
    pub offset: u32,
    pub e_stat: EStat,
}

impl RecAccept {
    pub const LEN: usize = 24;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(ElsCommand::LsAcc.as_u8());
        buf.put_bytes(0, 3);
        buf.put_u16(self.ox_id);
        buf.put_u16(self.rx_id);
        buf.put_u8(0);
        buf.put_slice(&self.originator.to_bytes());
        buf.put_u8(0);
        buf.put_slice(&self.responder.to_bytes());
        buf.put_u32(self.offset);
        buf.put_u32(self.e_stat.bits());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        check_len("REC accept", payload, Self::LEN)?;
        expect_command("REC accept", payload, ElsCommand::LsAcc)?;
        let mut buf = &payload[4..];
        let ox_id = buf.get_u16();
        let rx_id = buf.get_u16();
        buf.advance(1);
        let originator = read_fc_id(&mut buf);
        buf.advance(1);
        let responder = read_fc_id(&mut buf);
        Ok(Self {
            ox_id,
            rx_id,
            originator,
            responder,
            offset: buf.get_u32(),
            e_stat: EStat::from_bits_retain(buf.get_u32()),
        })
    }

    /// Responder still holds sequence initiative on an open exchange.
    pub fn responder_busy(&self) -> bool {
        self.e_stat.contains(EStat::SEQ_INIT) && !self.e_stat.contains(EStat::COMPLETE)
    }
}

/// SRR request: ask the target to retransmit part of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrrRequest {
    pub ox_id: u16,
    pub rx_id: u16,
    /// Relative offset to resume from
    pub rel_off: u32,
    /// Information unit to retransmit: status, data or transfer ready
    pub r_ctl: RCtl,
}

impl SrrRequest {
    pub const LEN: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(ElsCommand::Srr.as_u8());
        buf.put_bytes(0, 3);
        buf.put_u16(self.ox_id);
        buf.put_u16(self.rx_id);
        buf.put_u32(self.rel_off);
        buf.put_u8(self.r_ctl.as_u8());
        buf.put_bytes(0, 3);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        check_len("SRR", payload, Self::LEN)?;
        expect_command("SRR", payload, ElsCommand::Srr)?;
        let mut buf = &payload[4..];
        Ok(Self {
            ox_id: buf.get_u16(),
            rx_id: buf.get_u16(),
            rel_off: buf.get_u32(),
            r_ctl: RCtl::from_u8(buf.get_u8()),
        })
    }
}

/// Common and class-3 service parameters exchanged in PLOGI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plogi {
    pub wwpn: Wwn,
    pub wwnn: Wwn,
    /// Buffer-to-buffer credit
    pub bb_credit: u16,
    /// Largest receive data field size
    pub max_frame_size: u16,
    /// E_D_TOV in milliseconds
    pub e_d_tov: u32,
}

const FC_SP_VERSION: u8 = 0x20;
const FC_SP_FT_CIRC: u16 = 0x8000;
const FC_SP_BB_DATA_MASK: u16 = 0x0FFF;
const FC_CPC_VALID: u16 = 0x8000;
const FC_CPC_SEQ: u16 = 0x0800;

impl Plogi {
    pub const LEN: usize = 116;

    /// Encode as a request (`PLOGI`) or as its accept (`LS_ACC`).
    pub fn encode(&self, cmd: ElsCommand) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(cmd.as_u8());
        buf.put_bytes(0, 3);
        // common service parameters
        buf.put_u8(FC_SP_VERSION);
        buf.put_u8(FC_SP_VERSION);
        buf.put_u16(self.bb_credit);
        buf.put_u16(FC_SP_FT_CIRC);
        buf.put_u16(self.max_frame_size & FC_SP_BB_DATA_MASK);
        buf.put_u16(0x00FF);
        buf.put_u16(0x001F);
        buf.put_u32(self.e_d_tov);
        buf.put_slice(&self.wwpn.to_bytes());
        buf.put_slice(&self.wwnn.to_bytes());
        // classes 1, 2 unused
        buf.put_bytes(0, 32);
        // class 3
        buf.put_u16(FC_CPC_VALID | FC_CPC_SEQ);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16(self.max_frame_size & FC_SP_BB_DATA_MASK);
        buf.put_u16(0x00FF);
        buf.put_u16(0);
        buf.put_u8(0);
        buf.put_u8(1);
        buf.put_u16(0);
        // class 4, vendor version
        buf.put_bytes(0, 32);
        debug_assert_eq!(buf.len(), Self::LEN);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        check_len("PLOGI", payload, Self::LEN)?;
        let mut csp = &payload[4..20];
        csp.advance(2);
        let bb_credit = csp.get_u16();
        csp.advance(2);
        let max_frame_size = csp.get_u16() & FC_SP_BB_DATA_MASK;
        csp.advance(4);
        let e_d_tov = csp.get_u32();
        let mut names = &payload[20..36];
        let wwpn = Wwn::new(names.get_u64());
        let wwnn = Wwn::new(names.get_u64());
        let mut class3 = &payload[68..84];
        let class3_valid = class3.get_u16() & FC_CPC_VALID != 0;
        if !class3_valid {
            return Err(FcError::Protocol(format!(
                "port {} does not support class 3",
                wwpn
            )));
        }
        class3.advance(4);
        let class3_rdfs = class3.get_u16() & FC_SP_BB_DATA_MASK;
        Ok(Self {
            wwpn,
            wwnn,
            bb_credit,
            max_frame_size: match class3_rdfs {
                0 => max_frame_size,
                n => n.min(max_frame_size),
            },
            e_d_tov,
        })
    }
}

bitflags! {
    /// FCP service parameter page flags (PRLI word 3)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FcpServiceParams: u32 {
        const TASK_RETRY_ID = 0x0200;
        /// Sequence-level error recovery: REC and SRR are supported
        const RETRY = 0x0100;
        const CONF_COMPL = 0x0080;
        const OVLY_ALLOW = 0x0040;
        const INIT_FCN = 0x0020;
        const TARG_FCN = 0x0010;
        const RD_XRDY_DIS = 0x0002;
        const WR_XRDY_DIS = 0x0001;
    }
}

const FC_TYPE_FCP: u8 = 0x08;
const FC_SPP_EST_IMG_PAIR: u8 = 0x20;
const FC_SPP_RESP_MASK: u8 = 0x0F;
/// PRLI accept response code: request executed
pub const FC_SPP_RESP_ACK: u8 = 0x01;

/// PRLI request or accept carrying a single FCP service parameter page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prli {
    pub establish_image_pair: bool,
    /// Response code, meaningful in the accept only
    pub response: u8,
    pub params: FcpServiceParams,
}

impl Prli {
    pub const LEN: usize = 20;
    const PAGE_LEN: u8 = 16;

    pub fn request(params: FcpServiceParams) -> Self {
        Self {
            establish_image_pair: true,
            response: 0,
            params,
        }
    }

    pub fn encode(&self, cmd: ElsCommand) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(cmd.as_u8());
        buf.put_u8(Self::PAGE_LEN);
        buf.put_u16(Self::LEN as u16);
        buf.put_u8(FC_TYPE_FCP);
        buf.put_u8(0);
        let mut flags = self.response & FC_SPP_RESP_MASK;
        if self.establish_image_pair {
            flags |= FC_SPP_EST_IMG_PAIR;
        }
        buf.put_u8(flags);
        buf.put_u8(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(self.params.bits());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        check_len("PRLI", payload, Self::LEN)?;
        if payload[1] != Self::PAGE_LEN || payload[4] != FC_TYPE_FCP {
            return Err(FcError::Protocol(format!(
                "PRLI page length {} / type {:#04x} not FCP",
                payload[1], payload[4]
            )));
        }
        let flags = payload[6];
        let mut words = &payload[16..20];
        Ok(Self {
            establish_image_pair: flags & FC_SPP_EST_IMG_PAIR != 0,
            response: flags & FC_SPP_RESP_MASK,
            params: FcpServiceParams::from_bits_retain(words.get_u32()),
        })
    }
}

/// LOGO payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logo {
    pub s_id: FcId,
    pub wwpn: Wwn,
}

impl Logo {
    pub const LEN: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(ElsCommand::Logo.as_u8());
        buf.put_bytes(0, 3);
        buf.put_u8(0);
        buf.put_slice(&self.s_id.to_bytes());
        buf.put_slice(&self.wwpn.to_bytes());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        check_len("LOGO", payload, Self::LEN)?;
        expect_command("LOGO", payload, ElsCommand::Logo)?;
        let mut buf = &payload[5..];
        Ok(Self {
            s_id: read_fc_id(&mut buf),
            wwpn: Wwn::new(buf.get_u64()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u32) -> FcId {
        FcId::new(v).unwrap()
    }

    #[test]
    fn test_rec_request_layout() {
        let rec = RecRequest {
            s_id: id(0x010203),
            ox_id: 0x0010,
            rx_id: 0x0020,
        };
        let bytes = rec.encode();
        assert_eq!(
            &bytes[..],
            &[0x13, 0, 0, 0, 0, 0x01, 0x02, 0x03, 0x00, 0x10, 0x00, 0x20]
        );
        assert_eq!(RecRequest::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn test_rec_accept_estat() {
        let acc = RecAccept {
            ox_id: 5,
            rx_id: 6,
            originator: id(0x010101),
            responder: id(0x020202),
            offset: 16384,
            e_stat: EStat::RESPONDER | EStat::SEQ_INIT,
        };
        let bytes = acc.encode();
        assert_eq!(bytes.len(), RecAccept::LEN);
        assert_eq!(&bytes[16..20], &[0, 0, 0x40, 0]);
        assert_eq!(&bytes[20..24], &[0xC0, 0, 0, 0]);

        let decoded = RecAccept::decode(&bytes).unwrap();
        assert_eq!(decoded, acc);
        assert!(decoded.responder_busy());
    }

    #[test]
    fn test_srr_layout() {
        let srr = SrrRequest {
            ox_id: 0x0102,
            rx_id: 0x0304,
            rel_off: 16384,
            r_ctl: RCtl::SolData,
        };
        let bytes = srr.encode();
        assert_eq!(
            &bytes[..],
            &[0x14, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0x40, 0, 0x01, 0, 0, 0]
        );
        assert_eq!(SrrRequest::decode(&bytes).unwrap(), srr);
    }

    #[test]
    fn test_ls_rjt() {
        let rjt = LsRjt::new(RjtReason::Unsupported, ELS_EXPL_NONE);
        let bytes = rjt.encode();
        assert_eq!(&bytes[..], &[0x01, 0, 0, 0, 0, 0x0b, 0, 0]);
        match ElsReply::parse(bytes).unwrap() {
            ElsReply::Reject(r) => assert_eq!(r.reason, RjtReason::Unsupported),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reply_into_accept() {
        assert!(ElsReply::parse(ls_acc()).unwrap().into_accept().is_ok());
        let err = ElsReply::parse(LsRjt::new(RjtReason::LogicalBusy, 0).encode())
            .unwrap()
            .into_accept()
            .unwrap_err();
        assert!(matches!(err, FcError::Rejected { reason: 0x05, .. }));
        assert!(ElsReply::parse(Bytes::from_static(&[0x13])).is_err());
    }

    #[test]
    fn test_plogi() {
        let plogi = Plogi {
            wwpn: Wwn::new(0x2100_0024_ff00_0001),
            wwnn: Wwn::new(0x2000_0024_ff00_0001),
            bb_credit: 10,
            max_frame_size: 2048,
            e_d_tov: 2000,
        };
        let bytes = plogi.encode(ElsCommand::Plogi);
        assert_eq!(bytes.len(), Plogi::LEN);
        assert_eq!(bytes[0], 0x03);
        assert_eq!(&bytes[10..12], &[0x08, 0x00]);
        assert_eq!(&bytes[68..70], &[0x88, 0x00]);
        assert_eq!(Plogi::decode(&bytes).unwrap(), plogi);

        let acc = plogi.encode(ElsCommand::LsAcc);
        assert_eq!(acc[0], 0x02);
    }

    #[test]
    fn test_prli() {
        let prli = Prli::request(
            FcpServiceParams::INIT_FCN | FcpServiceParams::RETRY | FcpServiceParams::RD_XRDY_DIS,
        );
        let bytes = prli.encode(ElsCommand::Prli);
        assert_eq!(&bytes[..8], &[0x20, 0x10, 0x00, 0x14, 0x08, 0x00, 0x20, 0x00]);
        assert_eq!(&bytes[16..20], &[0, 0, 0x01, 0x22]);
        assert_eq!(Prli::decode(&bytes).unwrap(), prli);
    }

    #[test]
    fn test_logo() {
        let logo = Logo {
            s_id: id(0x0A0B0C),
            wwpn: Wwn::new(1),
        };
        let bytes = logo.encode();
        assert_eq!(bytes.len(), Logo::LEN);
        assert_eq!(&bytes[5..8], &[0x0A, 0x0B, 0x0C]);
        assert_eq!(Logo::decode(&bytes).unwrap(), logo);
    }
}
