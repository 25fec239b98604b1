//! Fibre Channel identifiers
//!
//! Port identifiers (24-bit N_Port IDs), world-wide names and the 8-byte SAM
//! logical unit number encoding carried in FCP_CMND.

use crate::error::{FcError, FcResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 24-bit Fibre Channel port identifier (D_ID / S_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FcId(u32);

impl FcId {
    /// Well-known fabric login server address
    pub const FABRIC_LOGIN: FcId = FcId(0xFF_FFFE);
    /// Well-known directory server address
    pub const DIRECTORY: FcId = FcId(0xFF_FFFC);

    /// Create a port identifier, rejecting values wider than 24 bits.
    pub fn new(value: u32) -> FcResult<Self> {
        if value > 0xFF_FFFF {
            return Err(FcError::InvalidData(format!(
                "FC_ID {:#x} does not fit in 24 bits",
                value
            )));
        }
        Ok(Self(value))
    }

    /// Build from the three big-endian bytes used in frame headers.
    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self(u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]))
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [(self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8]
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn domain(self) -> u8 {
        (self.0 >> 16) as u8
    }
}

impl fmt::Display for FcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

/// 64-bit world-wide name (port or node)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Wwn(u64);

impl Wwn {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Wwn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// Logical unit number in the 8-byte SAM format
///
/// Each addressing level takes two bytes. A flat integer LUN is split into
/// 16-bit levels, lowest level first, so LUN 5 encodes as `00 05 00 00 ..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScsiLun([u8; 8]);

impl ScsiLun {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn from_u64(lun: u64) -> Self {
        let mut bytes = [0u8; 8];
        let mut rest = lun;
        for level in bytes.chunks_exact_mut(2) {
            level[0] = (rest >> 8) as u8;
            level[1] = rest as u8;
            rest >>= 16;
        }
        Self(bytes)
    }

    pub fn to_u64(self) -> u64 {
        self.0
            .chunks_exact(2)
            .enumerate()
            .fold(0u64, |acc, (level, pair)| {
                acc | (u64::from(pair[0]) << 8 | u64::from(pair[1])) << (level * 16)
            })
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<u64> for ScsiLun {
    fn from(lun: u64) -> Self {
        Self::from_u64(lun)
    }
}

impl fmt::Display for ScsiLun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_u64())
    }
}
