//! Frame codecs: FCoE encapsulation and raw FC

use crate::fcoe::{
    self, FCOE_HEADER_LEN, FCOE_TRAILER_LEN, decode_header, decode_trailer, encode_header,
    encode_trailer,
};
use crate::frame::{FcFrame, FrameCheck};
use crate::header::{F_CTL_FILL_MASK, FC_HEADER_LEN, FC_MAX_PAYLOAD, FCtl, FcHeader};
use bytes::{BufMut, Bytes, BytesMut};
use fcp_core::{FcError, FcResult};

/// Translates between frames and link bytes
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &FcFrame) -> FcResult<Bytes>;
    fn decode(&self, data: &[u8]) -> FcResult<FcFrame>;
}

/// Who checks the CRC of inbound frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcMode {
    /// The codec checks and drops frames that fail.
    #[default]
    Verify,
    /// The codec passes the CRC up for the consumer to check.
    Defer,
    /// The adapter already checked it.
    Offloaded,
}

/// FCoE PDU codec (FCoE header, FC frame, trailer)
#[derive(Debug, Clone, Copy, Default)]
pub struct FcoeCodec {
    crc_mode: CrcMode,
}

impl FcoeCodec {
    pub fn new(crc_mode: CrcMode) -> Self {
        Self { crc_mode }
    }

    pub fn crc_mode(&self) -> CrcMode {
        self.crc_mode
    }
}

fn check_payload_len(len: usize) -> FcResult<()> {
    if len > FC_MAX_PAYLOAD {
        return Err(FcError::FrameInvalid(format!(
            "payload of {} bytes exceeds FC maximum {}",
            len, FC_MAX_PAYLOAD
        )));
    }
    Ok(())
}

impl FrameCodec for FcoeCodec {
    fn encode(&self, frame: &FcFrame) -> FcResult<Bytes> {
        check_payload_len(frame.payload.len())?;
        let fill = (4 - frame.payload.len() % 4) % 4;
        let mut header = frame.header;
        header.f_ctl = FCtl::from_bits_retain(
            header.f_ctl.bits() & !F_CTL_FILL_MASK | fill as u32,
        );
        let wire = FcFrame {
            header,
            ..frame.clone()
        };
        let crc = wire.compute_crc();

        let mut buf = BytesMut::with_capacity(
            FCOE_HEADER_LEN + FC_HEADER_LEN + frame.payload.len() + fill + FCOE_TRAILER_LEN,
        );
        encode_header(frame.sof, &mut buf);
        header.encode(&mut buf);
        buf.put_slice(&frame.payload);
        buf.put_bytes(0, fill);
        encode_trailer(crc, frame.eof, &mut buf);
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> FcResult<FcFrame> {
        let min = FCOE_HEADER_LEN + FC_HEADER_LEN + FCOE_TRAILER_LEN;
        if data.len() < min {
            return Err(FcError::FrameInvalid(format!(
                "FCoE PDU needs at least {} bytes, got {}",
                min,
                data.len()
            )));
        }
        let sof = decode_header(data)?;
        let (crc, eof) = decode_trailer(&data[data.len() - FCOE_TRAILER_LEN..])?;
        let fc = &data[FCOE_HEADER_LEN..data.len() - FCOE_TRAILER_LEN];
        let header = FcHeader::decode(fc)?;
        let body = &fc[FC_HEADER_LEN..];
        let fill = header.fill_bytes();
        if fill > body.len() {
            return Err(FcError::FrameInvalid(format!(
                "{} fill bytes in a {}-byte payload",
                fill,
                body.len()
            )));
        }
        let check = match self.crc_mode {
            CrcMode::Offloaded => FrameCheck::Verified,
            CrcMode::Defer => FrameCheck::Unchecked(crc),
            CrcMode::Verify => {
                let computed = crate::checksum::frame_crc(&fc[..FC_HEADER_LEN], body);
                if computed != crc {
                    return Err(FcError::FrameInvalid(format!(
                        "CRC mismatch: carried {:#010x}, computed {:#010x}",
                        crc, computed
                    )));
                }
                FrameCheck::Verified
            }
        };
        Ok(FcFrame {
            header,
            payload: Bytes::copy_from_slice(&body[..body.len() - fill]),
            sof,
            eof,
            check,
        })
    }
}

/// Bare FC frame codec (header and payload) for adapters that add
/// delimiters and CRC themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFcCodec;

impl FrameCodec for RawFcCodec {
    fn encode(&self, frame: &FcFrame) -> FcResult<Bytes> {
        check_payload_len(frame.payload.len())?;
        let mut buf = BytesMut::with_capacity(FC_HEADER_LEN + frame.payload.len());
        frame.header.encode(&mut buf);
        buf.put_slice(&frame.payload);
        Ok(buf.freeze())
    }

    fn decode(&self, data: &[u8]) -> FcResult<FcFrame> {
        let header = FcHeader::decode(data)?;
        let sof = fcoe::Sof::class3(header.seq_cnt == 0);
        let eof = fcoe::Eof::class3(header.f_ctl.contains(FCtl::END_SEQ));
        Ok(FcFrame {
            header,
            payload: Bytes::copy_from_slice(&data[FC_HEADER_LEN..]),
            sof,
            eof,
            check: FrameCheck::Verified,
        })
    }
}
