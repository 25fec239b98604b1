//! Fibre Channel frame CRC
//!
//! The CRC covers the FC header and payload. It is the IEEE 802.3
//! polynomial, the same algorithm as the Ethernet FCS.

use crc::{CRC_32_ISO_HDLC, Crc};

const FC_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC over an encoded header followed by the payload.
pub fn frame_crc(header: &[u8], payload: &[u8]) -> u32 {
    let mut digest = FC_CRC.digest();
    digest.update(header);
    digest.update(payload);
    digest.finalize()
}
