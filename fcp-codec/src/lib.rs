//! Wire formats for the FC/FCoE SCSI initiator
//!
//! This crate encodes and decodes:
//! - the 24-byte Fibre Channel frame header
//! - FCoE encapsulation (header, trailer, optional VLAN tag) and the frame CRC
//! - FCP information units: FCP_CMND, FCP_XFER_RDY, FCP_RSP
//! - extended link services used by the initiator: PLOGI, PRLI, LOGO, REC,
//!   SRR, LS_ACC and LS_RJT
//! - basic link services: BA_ACC and BA_RJT
//!
//! All multi-byte fields are big-endian except the FCoE CRC, which is
//! carried little-endian in the trailer.

pub mod bls;
pub mod checksum;
pub mod codec;
pub mod els;
pub mod fcoe;
pub mod fcp;
pub mod frame;
pub mod header;

pub use codec::{FcoeCodec, FrameCodec, RawFcCodec};
pub use frame::{FcFrame, FrameCheck};
pub use header::{FCtl, FcHeader, FcType, RCtl};
