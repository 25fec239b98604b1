//! Transport collaborators for the FC/FCoE initiator
//!
//! This crate provides the link abstraction that moves encoded frames, the
//! frame sink the protocol engine emits into, and the hardware queue
//! interface used when an adapter offloads exchanges to firmware.

pub mod error;
pub mod hw;
pub mod link;
pub mod memory;
pub mod sink;
pub mod udp;

pub use error::{FcError, FcResult};
pub use hw::{
    CompletionEvent, CompletionKind, CompletionSender, HwQueue, HwRequest, HwStatus, ItmfOp,
    completion_queue,
};
pub use link::{LinkAccessor, LinkLayer};
pub use memory::MemoryLink;
pub use sink::{FrameSink, QueuedSink, RecordingSink};
pub use udp::{UdpLink, UdpSettings};
