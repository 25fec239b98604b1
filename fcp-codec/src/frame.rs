//! Decoded Fibre Channel frame

use crate::checksum::frame_crc;
use crate::fcoe::{Eof, Sof};
use crate::header::{FCtl, FcHeader, FcType, RCtl};
use bytes::Bytes;

/// Outcome of the CRC check performed while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    /// The codec or the adapter validated the CRC.
    Verified,
    /// CRC carried in the trailer, left for the consumer to validate.
    Unchecked(u32),
}

/// One Fibre Channel frame: header, payload and delimiters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcFrame {
    pub header: FcHeader,
    pub payload: Bytes,
    pub sof: Sof,
    pub eof: Eof,
    pub check: FrameCheck,
}

impl FcFrame {
    /// Single-frame sequence: SOFi3 / EOFt.
    pub fn new(header: FcHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
            sof: Sof::I3,
            eof: Eof::T,
            check: FrameCheck::Verified,
        }
    }

    pub fn with_delimiters(mut self, sof: Sof, eof: Eof) -> Self {
        self.sof = sof;
        self.eof = eof;
        self
    }

    pub fn r_ctl(&self) -> RCtl {
        self.header.r_ctl
    }

    pub fn fc_type(&self) -> FcType {
        self.header.fc_type
    }

    pub fn f_ctl(&self) -> FCtl {
        self.header.f_ctl
    }

    /// CRC this frame should carry on the wire. Fill bytes flagged in the
    /// header are zeros.
    pub fn compute_crc(&self) -> u32 {
        let fill = self.header.fill_bytes();
        if fill == 0 {
            return frame_crc(&self.header.to_bytes(), &self.payload);
        }
        let mut padded = Vec::with_capacity(self.payload.len() + fill);
        padded.extend_from_slice(&self.payload);
        padded.resize(self.payload.len() + fill, 0);
        frame_crc(&self.header.to_bytes(), &padded)
    }

    /// Whether the frame content matches its CRC. Frames whose CRC was
    /// already verified always pass.
    pub fn crc_valid(&self) -> bool {
        match self.check {
            FrameCheck::Verified => true,
            FrameCheck::Unchecked(crc) => crc == self.compute_crc(),
        }
    }

    /// First payload byte, which is the command code for link services.
    pub fn opcode(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}
