//! Rust implementation of an FC/FCoE SCSI initiator
//!
//! This library drives SCSI commands to Fibre Channel targets, either in
//! software over an FCoE or raw FC link, or through an adapter that offloads
//! exchanges to firmware.
//!
//! # Architecture
//!
//! The library is organized as a workspace with multiple crates:
//!
//! - `fcp-core`: Identifiers, SCSI types, errors and the slot arena
//! - `fcp-codec`: FC header, FCoE encapsulation, FCP IUs, ELS and BLS payloads
//! - `fcp-transport`: Links, frame sinks and the hardware queue interface
//! - `fcp-session`: Session table, login driver and exchange manager
//! - `fcp-initiator`: Command engine, recovery, task management and events
//!
//! # Usage
//!
//! ```no_run
//! use fcp::codec::{FcoeCodec, codec::CrcMode};
//! use fcp::initiator::{InitiatorBuilder, IssueMode, LinkPort, ScsiRequest};
//! use fcp::session::ServiceParams;
//! use fcp::transport::MemoryLink;
//! use fcp::{Cdb, FcId, ScsiLun, Wwn};
//! use std::sync::Arc;
//!
//! # async fn run() -> fcp::FcResult<()> {
//! let (link, _peer) = MemoryLink::pair(64);
//! let local = ServiceParams::new(
//!     FcId::new(0x010100)?,
//!     Wwn::new(0x2000_0000_c9aa_0001),
//!     Wwn::new(0x1000_0000_c9aa_0001),
//! );
//! let codec = Arc::new(FcoeCodec::new(CrcMode::Verify));
//! let (initiator, _events, _port) =
//!     LinkPort::connect(link, codec, InitiatorBuilder::new(local), 64)?;
//!
//! let cdb = Cdb::new(&[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0])?;
//! let request = ScsiRequest::read(FcId::new(0x020200)?, ScsiLun::from_u64(0), cdb, 4096);
//! let outcome = initiator.execute(request, IssueMode::WaitReady).await?;
//! println!("{:?}", outcome.code);
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use fcp_core::{
    Cdb, DataDirection, FcError, FcId, FcResult, ScsiLun, ScsiStatus, SlotHandle, Wwn,
};

// Re-export wire formats
pub mod codec {
    pub use fcp_codec::*;
}

// Re-export transport collaborators
pub mod transport {
    pub use fcp_transport::*;
}

// Re-export session layer
pub mod session {
    pub use fcp_session::*;
}

// Re-export initiator engine
pub mod initiator {
    pub use fcp_initiator::*;
}
