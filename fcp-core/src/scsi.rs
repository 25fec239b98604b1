//! SCSI status codes, data direction and CDB container

use crate::error::{FcError, FcResult};
use serde::{Deserialize, Serialize};

/// SCSI status byte reported in FCP_RSP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScsiStatus {
    Good,
    CheckCondition,
    ConditionMet,
    Busy,
    ReservationConflict,
    TaskSetFull,
    AcaActive,
    TaskAborted,
    Other(u8),
}

impl ScsiStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => ScsiStatus::Good,
            0x02 => ScsiStatus::CheckCondition,
            0x04 => ScsiStatus::ConditionMet,
            0x08 => ScsiStatus::Busy,
            0x18 => ScsiStatus::ReservationConflict,
            0x28 => ScsiStatus::TaskSetFull,
            0x30 => ScsiStatus::AcaActive,
            0x40 => ScsiStatus::TaskAborted,
            other => ScsiStatus::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ScsiStatus::Good => 0x00,
            ScsiStatus::CheckCondition => 0x02,
            ScsiStatus::ConditionMet => 0x04,
            ScsiStatus::Busy => 0x08,
            ScsiStatus::ReservationConflict => 0x18,
            ScsiStatus::TaskSetFull => 0x28,
            ScsiStatus::AcaActive => 0x30,
            ScsiStatus::TaskAborted => 0x40,
            ScsiStatus::Other(v) => v,
        }
    }

    /// The target is temporarily unable to accept the command.
    pub fn is_busy(self) -> bool {
        matches!(self, ScsiStatus::Busy | ScsiStatus::TaskSetFull)
    }
}

impl Default for ScsiStatus {
    fn default() -> Self {
        ScsiStatus::Good
    }
}

/// Direction of the data phase, seen from the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataDirection {
    #[default]
    None,
    /// Data-in: target to initiator
    Read,
    /// Data-out: initiator to target
    Write,
}

/// Maximum CDB length carried in a basic FCP_CMND
pub const MAX_CDB_LEN: usize = 16;

/// Command descriptor block, zero padded to 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cdb {
    bytes: [u8; MAX_CDB_LEN],
    len: u8,
}

impl Cdb {
    pub fn new(cdb: &[u8]) -> FcResult<Self> {
        if cdb.is_empty() || cdb.len() > MAX_CDB_LEN {
            return Err(FcError::InvalidData(format!(
                "CDB length {} outside 1..={}",
                cdb.len(),
                MAX_CDB_LEN
            )));
        }
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[..cdb.len()].copy_from_slice(cdb);
        Ok(Self {
            bytes,
            len: cdb.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8; MAX_CDB_LEN] {
        &self.bytes
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
