//! Fibre Channel frame header

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use fcp_core::{FcError, FcId, FcResult};

/// Encoded header length
pub const FC_HEADER_LEN: usize = 24;

/// Unassigned exchange identifier
pub const XID_UNKNOWN: u16 = 0xFFFF;

/// Largest FC data field
pub const FC_MAX_PAYLOAD: usize = 2112;

/// Low F_CTL bits counting fill bytes appended to the payload
pub const F_CTL_FILL_MASK: u32 = 0x3;

/// Routing control field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RCtl {
    /// Solicited data (FCP_DATA)
    SolData,
    UnsolControl,
    SolControl,
    UnsolData,
    /// Data descriptor (FCP_XFER_RDY)
    DataDesc,
    /// Unsolicited command (FCP_CMND)
    UnsolCmd,
    /// Command status (FCP_RSP)
    CmdStatus,
    ElsRequest,
    ElsReply,
    /// FC-4 link service request (SRR)
    Els4Request,
    Els4Reply,
    BaNop,
    BaAbts,
    BaRmc,
    BaAcc,
    BaRjt,
    Other(u8),
}

impl RCtl {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => RCtl::SolData,
            0x02 => RCtl::UnsolControl,
            0x03 => RCtl::SolControl,
            0x04 => RCtl::UnsolData,
            0x05 => RCtl::DataDesc,
            0x06 => RCtl::UnsolCmd,
            0x07 => RCtl::CmdStatus,
            0x22 => RCtl::ElsRequest,
            0x23 => RCtl::ElsReply,
            0x32 => RCtl::Els4Request,
            0x33 => RCtl::Els4Reply,
            0x80 => RCtl::BaNop,
            0x81 => RCtl::BaAbts,
            0x82 => RCtl::BaRmc,
            0x84 => RCtl::BaAcc,
            0x85 => RCtl::BaRjt,
            other => RCtl::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RCtl::SolData => 0x01,
            RCtl::UnsolControl => 0x02,
            RCtl::SolControl => 0x03,
            RCtl::UnsolData => 0x04,
            RCtl::DataDesc => 0x05,
            RCtl::UnsolCmd => 0x06,
            RCtl::CmdStatus => 0x07,
            RCtl::ElsRequest => 0x22,
            RCtl::ElsReply => 0x23,
            RCtl::Els4Request => 0x32,
            RCtl::Els4Reply => 0x33,
            RCtl::BaNop => 0x80,
            RCtl::BaAbts => 0x81,
            RCtl::BaRmc => 0x82,
            RCtl::BaAcc => 0x84,
            RCtl::BaRjt => 0x85,
            RCtl::Other(v) => v,
        }
    }
}

/// Frame data structure type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FcType {
    Bls,
    Els,
    Fcp,
    Ct,
    Other(u8),
}

impl FcType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FcType::Bls,
            0x01 => FcType::Els,
            0x08 => FcType::Fcp,
            0x20 => FcType::Ct,
            other => FcType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FcType::Bls => 0x00,
            FcType::Els => 0x01,
            FcType::Fcp => 0x08,
            FcType::Ct => 0x20,
            FcType::Other(v) => v,
        }
    }
}

bitflags! {
    /// Frame control (24 bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FCtl: u32 {
        /// Sent by the exchange responder
        const EX_CTX = 1 << 23;
        /// Sent by the sequence recipient
        const SEQ_CTX = 1 << 22;
        const FIRST_SEQ = 1 << 21;
        const LAST_SEQ = 1 << 20;
        const END_SEQ = 1 << 19;
        const END_CONN = 1 << 18;
        /// Sequence initiative transferred to the other side
        const SEQ_INIT = 1 << 16;
        /// Parameter field holds a relative offset
        const REL_OFF = 1 << 3;
    }
}

impl FCtl {
    /// Frame control for a single-frame request that hands over initiative.
    pub fn single_request() -> Self {
        FCtl::FIRST_SEQ | FCtl::END_SEQ | FCtl::SEQ_INIT
    }

    /// Frame control for the responder's last sequence of an exchange.
    pub fn final_reply() -> Self {
        FCtl::EX_CTX | FCtl::LAST_SEQ | FCtl::END_SEQ
    }
}

/// Fibre Channel frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcHeader {
    pub r_ctl: RCtl,
    pub d_id: FcId,
    pub cs_ctl: u8,
    pub s_id: FcId,
    pub fc_type: FcType,
    pub f_ctl: FCtl,
    pub seq_id: u8,
    pub df_ctl: u8,
    pub seq_cnt: u16,
    pub ox_id: u16,
    pub rx_id: u16,
    pub parameter: u32,
}

impl FcHeader {
    /// Header for the first frame of a new sequence, with unassigned RX_ID.
    pub fn new(r_ctl: RCtl, fc_type: FcType, d_id: FcId, s_id: FcId, f_ctl: FCtl) -> Self {
        Self {
            r_ctl,
            d_id,
            cs_ctl: 0,
            s_id,
            fc_type,
            f_ctl,
            seq_id: 0,
            df_ctl: 0,
            seq_cnt: 0,
            ox_id: XID_UNKNOWN,
            rx_id: XID_UNKNOWN,
            parameter: 0,
        }
    }

    pub fn with_exchange(mut self, ox_id: u16, rx_id: u16) -> Self {
        self.ox_id = ox_id;
        self.rx_id = rx_id;
        self
    }

    pub fn with_sequence(mut self, seq_id: u8, seq_cnt: u16) -> Self {
        self.seq_id = seq_id;
        self.seq_cnt = seq_cnt;
        self
    }

    pub fn with_parameter(mut self, parameter: u32) -> Self {
        self.parameter = parameter;
        self
    }

    /// Header for a reply in the same exchange, addresses swapped.
    pub fn reply(&self, r_ctl: RCtl, fc_type: FcType, f_ctl: FCtl) -> Self {
        Self {
            r_ctl,
            d_id: self.s_id,
            cs_ctl: 0,
            s_id: self.d_id,
            fc_type,
            f_ctl,
            seq_id: 0,
            df_ctl: 0,
            seq_cnt: 0,
            ox_id: self.ox_id,
            rx_id: self.rx_id,
            parameter: 0,
        }
    }

    /// Frame was sent by the exchange responder.
    pub fn from_responder(&self) -> bool {
        self.f_ctl.contains(FCtl::EX_CTX)
    }

    /// Number of fill bytes padding the payload on the wire.
    pub fn fill_bytes(&self) -> usize {
        (self.f_ctl.bits() & F_CTL_FILL_MASK) as usize
    }

    /// Relative offset carried in the parameter field, if flagged.
    pub fn relative_offset(&self) -> Option<u32> {
        self.f_ctl
            .contains(FCtl::REL_OFF)
            .then_some(self.parameter)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.r_ctl.as_u8());
        buf.put_slice(&self.d_id.to_bytes());
        buf.put_u8(self.cs_ctl);
        buf.put_slice(&self.s_id.to_bytes());
        buf.put_u8(self.fc_type.as_u8());
        let f_ctl = self.f_ctl.bits();
        buf.put_slice(&[(f_ctl >> 16) as u8, (f_ctl >> 8) as u8, f_ctl as u8]);
        buf.put_u8(self.seq_id);
        buf.put_u8(self.df_ctl);
        buf.put_u16(self.seq_cnt);
        buf.put_u16(self.ox_id);
        buf.put_u16(self.rx_id);
        buf.put_u32(self.parameter);
    }

    pub fn to_bytes(&self) -> [u8; FC_HEADER_LEN] {
        let mut out = [0u8; FC_HEADER_LEN];
        self.encode(&mut &mut out[..]);
        out
    }

    pub fn decode(mut buf: &[u8]) -> FcResult<Self> {
        if buf.len() < FC_HEADER_LEN {
            return Err(FcError::FrameInvalid(format!(
                "FC header needs {} bytes, got {}",
                FC_HEADER_LEN,
                buf.len()
            )));
        }
        let r_ctl = RCtl::from_u8(buf.get_u8());
        let d_id = read_fc_id(&mut buf);
        let cs_ctl = buf.get_u8();
        let s_id = read_fc_id(&mut buf);
        let fc_type = FcType::from_u8(buf.get_u8());
        let f_ctl = u32::from(buf.get_u8()) << 16 | u32::from(buf.get_u16());
        Ok(Self {
            r_ctl,
            d_id,
            cs_ctl,
            s_id,
            fc_type,
            f_ctl: FCtl::from_bits_retain(f_ctl),
            seq_id: buf.get_u8(),
            df_ctl: buf.get_u8(),
            seq_cnt: buf.get_u16(),
            ox_id: buf.get_u16(),
            rx_id: buf.get_u16(),
            parameter: buf.get_u32(),
        })
    }
}

pub(crate) fn read_fc_id(buf: &mut impl Buf) -> FcId {
    let mut bytes = [0u8; 3];
    buf.copy_to_slice(&mut bytes);
    FcId::from_bytes(bytes)
}
