//! Basic link service replies to ABTS

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fcp_core::{FcError, FcResult};

/// BA_ACC payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaAcc {
    pub seq_id_valid: bool,
    pub seq_id: u8,
    pub ox_id: u16,
    pub rx_id: u16,
    pub low_seq_cnt: u16,
    pub high_seq_cnt: u16,
}

impl BaAcc {
    pub const LEN: usize = 12;

    /// Accept covering the whole exchange.
    pub fn whole_exchange(ox_id: u16, rx_id: u16) -> Self {
        Self {
            seq_id_valid: false,
            seq_id: 0,
            ox_id,
            rx_id,
            low_seq_cnt: 0,
            high_seq_cnt: 0xFFFF,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(if self.seq_id_valid { 0x80 } else { 0 });
        buf.put_u8(self.seq_id);
        buf.put_u16(0);
        buf.put_u16(self.ox_id);
        buf.put_u16(self.rx_id);
        buf.put_u16(self.low_seq_cnt);
        buf.put_u16(self.high_seq_cnt);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        if payload.len() < Self::LEN {
            return Err(FcError::FrameInvalid(format!(
                "BA_ACC needs {} bytes, got {}",
                Self::LEN,
                payload.len()
            )));
        }
        let mut buf = payload;
        let seq_id_valid = buf.get_u8() == 0x80;
        let seq_id = buf.get_u8();
        buf.advance(2);
        Ok(Self {
            seq_id_valid,
            seq_id,
            ox_id: buf.get_u16(),
            rx_id: buf.get_u16(),
            low_seq_cnt: buf.get_u16(),
            high_seq_cnt: buf.get_u16(),
        })
    }
}

/// BA_RJT reason: unable to perform command request
pub const BA_RJT_UNABLE: u8 = 0x09;
/// BA_RJT explanation: invalid OX_ID-RX_ID combination
pub const BA_RJT_EXP_INV_XID: u8 = 0x03;

/// BA_RJT payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaRjt {
    pub reason: u8,
    pub explanation: u8,
}

impl BaRjt {
    pub const LEN: usize = 4;

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[0, self.reason, self.explanation, 0])
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        if payload.len() < Self::LEN {
            return Err(FcError::FrameInvalid(format!(
                "BA_RJT needs {} bytes, got {}",
                Self::LEN,
                payload.len()
            )));
        }
        Ok(Self {
            reason: payload[1],
            explanation: payload[2],
        })
    }
}
