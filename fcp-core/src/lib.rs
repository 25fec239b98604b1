//! Core types and utilities for the FC/FCoE SCSI initiator
//!
//! This crate provides the fundamental identifiers, SCSI constants, error
//! handling and the generation-tagged slot arena used throughout the
//! initiator implementation.

pub mod arena;
pub mod error;
pub mod ids;
pub mod scsi;

pub use arena::{SlotHandle, SlotTable};
pub use error::{FcError, FcResult};
pub use ids::{FcId, ScsiLun, Wwn};
pub use scsi::{Cdb, DataDirection, ScsiStatus};
