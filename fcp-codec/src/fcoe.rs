//! FCoE encapsulation
//!
//! An FCoE PDU wraps one FC frame:
//!
//! ```text
//! +---------+--------------+-----+-----------+---------+-----------+-----+----------+
//! | ver<<4  | reserved(12) | SOF | FC header | payload | CRC (LE)  | EOF | rsvd(3)  |
//! +---------+--------------+-----+-----------+---------+-----------+-----+----------+
//! ```
//!
//! The optional 802.1Q tag sits in front of the FCoE ethertype in the
//! Ethernet header; only the tag itself is encoded here.

use bytes::{Buf, BufMut};
use fcp_core::{FcError, FcResult};

/// FCoE ethertype
pub const ETH_P_FCOE: u16 = 0x8906;
/// 802.1Q tag protocol identifier
pub const ETH_P_8021Q: u16 = 0x8100;
/// Encapsulation version understood by this codec
pub const FCOE_VERSION: u8 = 0;
pub const FCOE_HEADER_LEN: usize = 14;
pub const FCOE_TRAILER_LEN: usize = 8;

/// Start-of-frame delimiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sof {
    F,
    I2,
    N2,
    I3,
    N3,
}

impl Sof {
    pub fn from_u8(value: u8) -> FcResult<Self> {
        match value {
            0x28 => Ok(Sof::F),
            0x2D => Ok(Sof::I2),
            0x35 => Ok(Sof::N2),
            0x2E => Ok(Sof::I3),
            0x36 => Ok(Sof::N3),
            other => Err(FcError::FrameInvalid(format!("unknown SOF {:#04x}", other))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Sof::F => 0x28,
            Sof::I2 => 0x2D,
            Sof::N2 => 0x35,
            Sof::I3 => 0x2E,
            Sof::N3 => 0x36,
        }
    }

    /// Class-3 start delimiter.
    pub fn class3(first_in_sequence: bool) -> Self {
        if first_in_sequence { Sof::I3 } else { Sof::N3 }
    }
}

/// End-of-frame delimiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eof {
    N,
    T,
    Ni,
    A,
}

impl Eof {
    pub fn from_u8(value: u8) -> FcResult<Self> {
        match value {
            0x41 => Ok(Eof::N),
            0x42 => Ok(Eof::T),
            0x49 => Ok(Eof::Ni),
            0x50 => Ok(Eof::A),
            other => Err(FcError::FrameInvalid(format!("unknown EOF {:#04x}", other))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Eof::N => 0x41,
            Eof::T => 0x42,
            Eof::Ni => 0x49,
            Eof::A => 0x50,
        }
    }

    pub fn class3(last_in_sequence: bool) -> Self {
        if last_in_sequence { Eof::T } else { Eof::N }
    }
}

pub fn encode_header(sof: Sof, buf: &mut impl BufMut) {
    buf.put_u8(FCOE_VERSION << 4);
    buf.put_bytes(0, 12);
    buf.put_u8(sof.as_u8());
}

pub fn decode_header(mut buf: &[u8]) -> FcResult<Sof> {
    if buf.len() < FCOE_HEADER_LEN {
        return Err(FcError::FrameInvalid(format!(
            "FCoE header needs {} bytes, got {}",
            FCOE_HEADER_LEN,
            buf.len()
        )));
    }
    let version = buf.get_u8() >> 4;
    if version != FCOE_VERSION {
        return Err(FcError::FrameInvalid(format!(
            "unsupported FCoE version {}",
            version
        )));
    }
    buf.advance(12);
    Sof::from_u8(buf.get_u8())
}

pub fn encode_trailer(crc: u32, eof: Eof, buf: &mut impl BufMut) {
    buf.put_u32_le(crc);
    buf.put_u8(eof.as_u8());
    buf.put_bytes(0, 3);
}

pub fn decode_trailer(mut buf: &[u8]) -> FcResult<(u32, Eof)> {
    if buf.len() < FCOE_TRAILER_LEN {
        return Err(FcError::FrameInvalid(format!(
            "FCoE trailer needs {} bytes, got {}",
            FCOE_TRAILER_LEN,
            buf.len()
        )));
    }
    let crc = buf.get_u32_le();
    let eof = Eof::from_u8(buf.get_u8())?;
    Ok((crc, eof))
}

/// 802.1Q VLAN tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VlanTag {
    /// Priority code point (3 bits)
    pub priority: u8,
    /// Drop eligible indicator
    pub drop_eligible: bool,
    /// VLAN identifier (12 bits)
    pub vid: u16,
}

impl VlanTag {
    pub const LEN: usize = 4;

    pub fn new(priority: u8, vid: u16) -> FcResult<Self> {
        if priority > 7 || vid > 0x0FFF {
            return Err(FcError::InvalidData(format!(
                "VLAN priority {} / id {} out of range",
                priority, vid
            )));
        }
        Ok(Self {
            priority,
            drop_eligible: false,
            vid,
        })
    }

    pub fn tci(&self) -> u16 {
        u16::from(self.priority) << 13 | u16::from(self.drop_eligible) << 12 | self.vid
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(ETH_P_8021Q);
        buf.put_u16(self.tci());
    }

    pub fn decode(mut buf: &[u8]) -> FcResult<Self> {
        if buf.len() < Self::LEN {
            return Err(FcError::FrameInvalid("short VLAN tag".to_string()));
        }
        let tpid = buf.get_u16();
        if tpid != ETH_P_8021Q {
            return Err(FcError::FrameInvalid(format!("TPID {:#06x} is not 802.1Q", tpid)));
        }
        let tci = buf.get_u16();
        Ok(Self {
            priority: (tci >> 13) as u8,
            drop_eligible: tci & 0x1000 != 0,
            vid: tci & 0x0FFF,
        })
    }
}
