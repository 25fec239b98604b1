//! FCP SCSI initiator engine
//!
//! This crate drives SCSI commands over Fibre Channel exchanges:
//! - command admission, data transfer and status handling
//! - exchange-level error recovery with REC and SRR, falling back to ABTS
//! - task management and host reset with scoped cleanup
//! - hardware offload through an adapter queue
//! - per-LUN health tracking and the host event queue
//!
//! With the `sim` feature, `sim::TargetSim` is a scripted target for driving
//! the engine without a fabric.

pub mod builder;
pub mod command;
pub mod config;
pub mod data;
pub mod events;
pub mod hw;
pub mod initiator;
pub mod lun;
mod offload;
pub mod port;
pub mod recovery;
#[cfg(feature = "sim")]
pub mod sim;
pub mod statistics;
mod status;
pub mod timer;
pub mod tmf;

pub use builder::InitiatorBuilder;
pub use command::{
    CommandState, CompletionCode, CompletionHandler, Disposition, IssueMode, Outcome, Rejected,
    ScsiRequest,
};
pub use config::InitiatorConfig;
pub use data::TransferRanges;
pub use events::{EventMask, HostEvent, HostEventHandler, HostEventKind, HostEventReceiver};
pub use hw::{HwSlotState, HwTracker};
pub use initiator::FcpInitiator;
pub use lun::LunHealthTable;
pub use port::LinkPort;
pub use recovery::{RecoveryPlan, plan_recovery};
#[cfg(feature = "sim")]
pub use sim::{SimBehavior, TargetSim};
pub use statistics::StatisticsSnapshot;
pub use timer::{ManualTimers, TimerKey, TimerService, TokioTimers};
pub use tmf::ResetScope;
