//! FCP information units

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fcp_core::scsi::MAX_CDB_LEN;
use fcp_core::{Cdb, DataDirection, FcError, FcResult, ScsiLun, ScsiStatus};

pub const FCP_CMND_LEN: usize = 32;
pub const FCP_XFER_RDY_LEN: usize = 12;
/// FCP_RSP without the extension block
pub const FCP_RSP_BASE_LEN: usize = 12;
/// FCP_RSP with resid / sense length / response length
pub const FCP_RSP_EXT_LEN: usize = 24;
/// Sense bytes kept from a response
pub const MAX_SENSE_LEN: usize = 96;

const FCP_CFL_RDDATA: u8 = 0x02;
const FCP_CFL_WRDATA: u8 = 0x01;

bitflags! {
    /// Task management flags (FCP_CMND byte 10)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TmFlags: u8 {
        const ABORT_TASK_SET = 0x02;
        const CLEAR_TASK_SET = 0x04;
        const LUN_RESET = 0x10;
        const TARGET_RESET = 0x20;
        const CLEAR_ACA = 0x40;
    }
}

bitflags! {
    /// FCP_RSP flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RspFlags: u8 {
        const RSP_LEN_VAL = 0x01;
        const SNS_LEN_VAL = 0x02;
        const RESID_OVER = 0x04;
        const RESID_UNDER = 0x08;
        const CONF_REQ = 0x10;
    }
}

/// Task attribute carried in FCP_CMND byte 9
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskAttribute {
    #[default]
    Simple,
    HeadOfQueue,
    Ordered,
    Aca,
}

impl TaskAttribute {
    fn as_u8(self) -> u8 {
        match self {
            TaskAttribute::Simple => 0,
            TaskAttribute::HeadOfQueue => 1,
            TaskAttribute::Ordered => 2,
            TaskAttribute::Aca => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value & 0x07 {
            1 => TaskAttribute::HeadOfQueue,
            2 => TaskAttribute::Ordered,
            4 => TaskAttribute::Aca,
            _ => TaskAttribute::Simple,
        }
    }
}

/// Response codes found at byte 3 of FCP_RSP_INFO
pub mod rsp_code {
    pub const TMF_COMPLETE: u8 = 0x00;
    pub const DATA_LEN_INVALID: u8 = 0x01;
    pub const CMND_FIELDS_INVALID: u8 = 0x02;
    pub const DATA_PARAM_MISMATCH: u8 = 0x03;
    pub const TMF_REJECTED: u8 = 0x04;
    pub const TMF_FAILED: u8 = 0x05;
    pub const TMF_INVALID_LUN: u8 = 0x09;
}

/// FCP_CMND information unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpCmnd {
    pub lun: ScsiLun,
    pub crn: u8,
    pub task_attribute: TaskAttribute,
    pub tm_flags: TmFlags,
    pub direction: DataDirection,
    pub cdb: [u8; MAX_CDB_LEN],
    pub data_len: u32,
}

impl FcpCmnd {
    pub fn scsi(lun: ScsiLun, cdb: &Cdb, direction: DataDirection, data_len: u32) -> Self {
        Self {
            lun,
            crn: 0,
            task_attribute: TaskAttribute::Simple,
            tm_flags: TmFlags::empty(),
            direction,
            cdb: *cdb.as_bytes(),
            data_len,
        }
    }

    pub fn task_management(lun: ScsiLun, tm_flags: TmFlags) -> Self {
        Self {
            lun,
            crn: 0,
            task_attribute: TaskAttribute::Simple,
            tm_flags,
            direction: DataDirection::None,
            cdb: [0; MAX_CDB_LEN],
            data_len: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FCP_CMND_LEN);
        buf.put_slice(self.lun.as_bytes());
        buf.put_u8(self.crn);
        buf.put_u8(self.task_attribute.as_u8());
        buf.put_u8(self.tm_flags.bits());
        buf.put_u8(match self.direction {
            DataDirection::None => 0,
            DataDirection::Read => FCP_CFL_RDDATA,
            DataDirection::Write => FCP_CFL_WRDATA,
        });
        buf.put_slice(&self.cdb);
        buf.put_u32(self.data_len);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> FcResult<Self> {
        if buf.len() < FCP_CMND_LEN {
            return Err(FcError::FrameInvalid(format!(
                "FCP_CMND needs {} bytes, got {}",
                FCP_CMND_LEN,
                buf.len()
            )));
        }
        let mut lun = [0u8; 8];
        buf.copy_to_slice(&mut lun);
        let crn = buf.get_u8();
        let task_attribute = TaskAttribute::from_u8(buf.get_u8());
        let tm_flags = TmFlags::from_bits_retain(buf.get_u8());
        let flags = buf.get_u8();
        let direction = if flags & FCP_CFL_RDDATA != 0 {
            DataDirection::Read
        } else if flags & FCP_CFL_WRDATA != 0 {
            DataDirection::Write
        } else {
            DataDirection::None
        };
        let mut cdb = [0u8; MAX_CDB_LEN];
        buf.copy_to_slice(&mut cdb);
        Ok(Self {
            lun: ScsiLun::from_bytes(lun),
            crn,
            task_attribute,
            tm_flags,
            direction,
            cdb,
            data_len: buf.get_u32(),
        })
    }
}

/// FCP_XFER_RDY information unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcpXferRdy {
    pub offset: u32,
    pub burst_len: u32,
}

impl FcpXferRdy {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FCP_XFER_RDY_LEN);
        buf.put_u32(self.offset);
        buf.put_u32(self.burst_len);
        buf.put_u32(0);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> FcResult<Self> {
        if buf.len() < FCP_XFER_RDY_LEN {
            return Err(FcError::FrameInvalid(format!(
                "FCP_XFER_RDY needs {} bytes, got {}",
                FCP_XFER_RDY_LEN,
                buf.len()
            )));
        }
        Ok(Self {
            offset: buf.get_u32(),
            burst_len: buf.get_u32(),
        })
    }
}

/// FCP_RSP information unit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FcpRsp {
    pub retry_delay: u16,
    pub flags: RspFlags,
    pub status: ScsiStatus,
    pub resid: u32,
    /// Response code from FCP_RSP_INFO, when present
    pub rsp_code: Option<u8>,
    pub sense: Bytes,
}

impl FcpRsp {
    pub fn good() -> Self {
        Self::default()
    }

    /// Residual the target reports as not transferred.
    pub fn resid_under(&self) -> u32 {
        if self.flags.contains(RspFlags::RESID_UNDER) {
            self.resid
        } else {
            0
        }
    }

    pub fn is_overrun(&self) -> bool {
        self.flags.contains(RspFlags::RESID_OVER)
    }

    pub fn encode(&self) -> Bytes {
        let mut flags = self.flags;
        if self.rsp_code.is_some() {
            flags |= RspFlags::RSP_LEN_VAL;
        }
        if !self.sense.is_empty() {
            flags |= RspFlags::SNS_LEN_VAL;
        }
        let extended = flags.intersects(
            RspFlags::RSP_LEN_VAL
                | RspFlags::SNS_LEN_VAL
                | RspFlags::RESID_OVER
                | RspFlags::RESID_UNDER,
        );
        let mut buf = BytesMut::with_capacity(FCP_RSP_EXT_LEN + 8 + self.sense.len());
        buf.put_bytes(0, 8);
        buf.put_u16(self.retry_delay);
        buf.put_u8(flags.bits());
        buf.put_u8(self.status.as_u8());
        if extended {
            buf.put_u32(self.resid);
            buf.put_u32(self.sense.len() as u32);
            buf.put_u32(if self.rsp_code.is_some() { 8 } else { 0 });
            if let Some(code) = self.rsp_code {
                buf.put_slice(&[0, 0, 0, code, 0, 0, 0, 0]);
            }
            buf.put_slice(&self.sense);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> FcResult<Self> {
        if payload.len() < FCP_RSP_BASE_LEN {
            return Err(FcError::FrameInvalid(format!(
                "FCP_RSP needs {} bytes, got {}",
                FCP_RSP_BASE_LEN,
                payload.len()
            )));
        }
        let mut buf = &payload[8..];
        let retry_delay = buf.get_u16();
        let flags = RspFlags::from_bits_retain(buf.get_u8());
        let status = ScsiStatus::from_u8(buf.get_u8());
        let mut rsp = Self {
            retry_delay,
            flags,
            status,
            ..Self::default()
        };
        let extended = flags.intersects(
            RspFlags::RSP_LEN_VAL
                | RspFlags::SNS_LEN_VAL
                | RspFlags::RESID_OVER
                | RspFlags::RESID_UNDER,
        );
        if !extended {
            return Ok(rsp);
        }
        if payload.len() < FCP_RSP_EXT_LEN {
            return Err(FcError::FrameInvalid(format!(
                "FCP_RSP flags {:#04x} need the extension block, got {} bytes",
                flags.bits(),
                payload.len()
            )));
        }
        rsp.resid = buf.get_u32();
        let sns_len = buf.get_u32() as usize;
        let rsp_len = buf.get_u32() as usize;

        if flags.contains(RspFlags::RSP_LEN_VAL) {
            if !matches!(rsp_len, 4 | 8) || buf.remaining() < rsp_len {
                return Err(FcError::FrameInvalid(format!(
                    "bad FCP_RSP_INFO length {}",
                    rsp_len
                )));
            }
            rsp.rsp_code = Some(buf[3]);
            buf.advance(rsp_len);
        }
        if flags.contains(RspFlags::SNS_LEN_VAL) {
            let keep = sns_len.min(MAX_SENSE_LEN).min(buf.remaining());
            rsp.sense = Bytes::copy_from_slice(&buf[..keep]);
        }
        Ok(rsp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmnd_layout() {
        let cdb = Cdb::new(&[0x28, 0, 0, 0, 0, 0x10, 0, 0, 0x80, 0]).unwrap();
        let cmnd = FcpCmnd::scsi(ScsiLun::from_u64(3), &cdb, DataDirection::Read, 65536);
        let bytes = cmnd.encode();

        assert_eq!(bytes.len(), FCP_CMND_LEN);
        assert_eq!(&bytes[0..8], &[0, 3, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bytes[10], 0);
        assert_eq!(bytes[11], FCP_CFL_RDDATA);
        assert_eq!(bytes[12], 0x28);
        assert_eq!(&bytes[28..32], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(FcpCmnd::decode(&bytes).unwrap(), cmnd);
    }

    #[test]
    fn test_tmf_cmnd() {
        let cmnd = FcpCmnd::task_management(ScsiLun::from_u64(1), TmFlags::LUN_RESET);
        let bytes = cmnd.encode();
        assert_eq!(bytes[10], 0x10);
        assert_eq!(bytes[11], 0);
        assert!(bytes[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_xfer_rdy() {
        let xfer = FcpXferRdy {
            offset: 8192,
            burst_len: 4096,
        };
        let bytes = xfer.encode();
        assert_eq!(&bytes[..], &[0, 0, 0x20, 0, 0, 0, 0x10, 0, 0, 0, 0, 0]);
        assert_eq!(FcpXferRdy::decode(&bytes).unwrap(), xfer);
    }

    #[test]
    fn test_rsp_good_is_short() {
        let bytes = FcpRsp::good().encode();
        assert_eq!(bytes.len(), FCP_RSP_BASE_LEN);
        let rsp = FcpRsp::decode(&bytes).unwrap();
        assert_eq!(rsp.status, ScsiStatus::Good);
        assert_eq!(rsp.resid_under(), 0);
    }

    #[test]
    fn test_rsp_with_sense_and_residual() {
        let rsp = FcpRsp {
            flags: RspFlags::RESID_UNDER,
            status: ScsiStatus::CheckCondition,
            resid: 512,
            sense: Bytes::from_static(&[0x70, 0, 0x05, 0, 0, 0, 0, 0x0a]),
            ..FcpRsp::default()
        };
        let bytes = rsp.encode();
        assert_eq!(bytes[10], (RspFlags::RESID_UNDER | RspFlags::SNS_LEN_VAL).bits());
        assert_eq!(&bytes[12..16], &[0, 0, 2, 0]);

        let decoded = FcpRsp::decode(&bytes).unwrap();
        assert_eq!(decoded.resid_under(), 512);
        assert_eq!(decoded.sense.len(), 8);
        assert_eq!(decoded.status, ScsiStatus::CheckCondition);
    }

    #[test]
    fn test_rsp_info_code() {
        let rsp = FcpRsp {
            rsp_code: Some(rsp_code::TMF_FAILED),
            ..FcpRsp::default()
        };
        let decoded = FcpRsp::decode(&rsp.encode()).unwrap();
        assert_eq!(decoded.rsp_code, Some(rsp_code::TMF_FAILED));
    }

    #[test]
    fn test_rsp_sense_is_clamped() {
        let rsp = FcpRsp {
            status: ScsiStatus::CheckCondition,
            sense: Bytes::from(vec![0xAB; 200]),
            ..FcpRsp::default()
        };
        let decoded = FcpRsp::decode(&rsp.encode()).unwrap();
        assert_eq!(decoded.sense.len(), MAX_SENSE_LEN);
    }

    #[test]
    fn test_rsp_truncated_extension() {
        let mut bytes = FcpRsp::good().encode().to_vec();
        bytes[10] = RspFlags::RESID_UNDER.bits();
        assert!(FcpRsp::decode(&bytes).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_rsp_decode_is_total(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..160),
        ) {
            let _ = FcpRsp::decode(&payload);
        }

        #[test]
        fn prop_rsp_keeps_status_residual_and_sense(
            status in proptest::prelude::any::<u8>(),
            resid in proptest::prelude::any::<u32>(),
            under in proptest::prelude::any::<bool>(),
            code in proptest::option::of(0u8..10),
            sense in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..160),
        ) {
            let rsp = FcpRsp {
                flags: if under { RspFlags::RESID_UNDER } else { RspFlags::empty() },
                status: ScsiStatus::from_u8(status),
                resid,
                rsp_code: code,
                sense: Bytes::from(sense.clone()),
                ..FcpRsp::default()
            };
            let decoded = FcpRsp::decode(&rsp.encode()).unwrap();
            proptest::prop_assert_eq!(decoded.status.as_u8(), status);
            proptest::prop_assert_eq!(decoded.resid_under(), if under { resid } else { 0 });
            proptest::prop_assert_eq!(decoded.rsp_code, code);
            let kept = sense.len().min(MAX_SENSE_LEN);
            proptest::prop_assert_eq!(&decoded.sense[..], &sense[..kept]);
        }

        #[test]
        fn prop_cmnd_fields_survive_the_wire(
            lun in 0u64..16384,
            cdb in proptest::collection::vec(proptest::prelude::any::<u8>(), 6..=16),
            direction in proptest::prop_oneof![
                proptest::strategy::Just(DataDirection::None),
                proptest::strategy::Just(DataDirection::Read),
                proptest::strategy::Just(DataDirection::Write),
            ],
            data_len in proptest::prelude::any::<u32>(),
        ) {
            let cdb = Cdb::new(&cdb).unwrap();
            let cmnd = FcpCmnd::scsi(ScsiLun::from_u64(lun), &cdb, direction, data_len);
            let bytes = cmnd.encode();
            proptest::prop_assert_eq!(bytes.len(), FCP_CMND_LEN);
            proptest::prop_assert_eq!(FcpCmnd::decode(&bytes).unwrap(), cmnd);
        }
    }
}
