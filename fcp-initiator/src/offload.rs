//! Completions from an offloading adapter
//!
//! The firmware runs the whole exchange and reports a single completion per
//! request. Data and status of a finished ICMND go through the same length
//! accounting as the software path.

use crate::command::{CommandState, CompletionCode};
use crate::hw::HwOwner;
use crate::initiator::FcpInitiator;
use crate::status::{Settle, settle};
use fcp_codec::fcp::{FcpRsp, RspFlags};
use fcp_core::{DataDirection, SlotHandle};
use fcp_transport::{CompletionEvent, CompletionKind, HwStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl FcpInitiator {
    /// Handle one completion from the hardware queue.
    pub fn on_hw_completion(&self, event: CompletionEvent) {
        let Some(hw) = &self.hw else {
            log::warn!("hardware completion {:#010x} without an adapter", event.tag);
            return;
        };
        let tag = SlotHandle::from_tag(event.tag);

        if event.kind == CompletionKind::FirmwareReset {
            let flushed = hw.drain_except(Some(tag));
            log::warn!("firmware reset flushed {} hardware slots", flushed.len());
            for slot in flushed {
                match slot.owner {
                    HwOwner::Command(h) | HwOwner::Abort(h) => {
                        self.complete(h, CompletionCode::HostReset);
                    }
                    HwOwner::Waiter(waiter) => {
                        let _ = waiter.send(CompletionEvent::new(
                            event.tag,
                            CompletionKind::Itmf,
                            HwStatus::Aborted,
                        ));
                    }
                }
            }
        }

        let Some(slot) = hw.complete(tag) else {
            log::debug!("stale hardware completion {:#010x}", event.tag);
            return;
        };
        match slot.owner {
            HwOwner::Waiter(waiter) => {
                let _ = waiter.send(event);
            }
            HwOwner::Abort(handle) => self.on_hw_abort_done(handle, &event),
            HwOwner::Command(handle) => self.on_hw_command_done(handle, event),
        }
    }

    fn on_hw_abort_done(&self, handle: SlotHandle, event: &CompletionEvent) {
        let code = self.commands.with(handle, |c| {
            if c.state == CommandState::AbortPending {
                c.transition(CommandState::Aborted);
            }
            c.abort_code
        });
        let Some(code) = code else {
            return;
        };
        match event.status {
            HwStatus::Success | HwStatus::Aborted => {
                self.complete(handle, code);
            }
            status => {
                log::warn!("adapter could not abort command: {:?}", status);
                self.complete(handle, CompletionCode::TmfFailed);
            }
        }
    }

    fn on_hw_command_done(&self, handle: SlotHandle, event: CompletionEvent) {
        let code = self.commands.with(handle, |c| {
            // The adapter slot is closed already.
            c.hw_tag = None;
            match event.status {
                HwStatus::Success | HwStatus::DataCountMismatch => {
                    let moved = c.data_len().saturating_sub(event.residual);
                    if c.direction() == DataDirection::Read {
                        let len = event.data.len().min(c.buffer.len());
                        c.buffer[..len].copy_from_slice(&event.data[..len]);
                        if len > 0 {
                            c.ranges.insert(0, len as u32);
                        }
                    } else if moved > 0 {
                        c.ranges.insert(0, moved);
                    }
                    let mut flags = RspFlags::empty();
                    if event.residual > 0 {
                        flags |= RspFlags::RESID_UNDER;
                    }
                    c.rsp = Some(FcpRsp {
                        flags,
                        status: event.scsi_status,
                        resid: event.residual,
                        sense: event.sense.clone(),
                        ..FcpRsp::default()
                    });
                    c.transition(CommandState::AwaitingStatus);
                    match settle(c) {
                        Settle::Complete(code) => code,
                        _ => CompletionCode::DataUnderrun,
                    }
                }
                HwStatus::Timeout => CompletionCode::HwTimeout,
                HwStatus::Aborted if c.abort_in_progress() => c.abort_code,
                HwStatus::Aborted => CompletionCode::Aborted,
                HwStatus::ResourceExhausted => CompletionCode::HwResource,
                HwStatus::InvalidRequest => CompletionCode::HwInvalidRequest,
                HwStatus::FirmwareError => CompletionCode::FirmwareError,
            }
        });
        if let Some(code) = code {
            self.complete(handle, code);
        }
    }

    /// Feed completions from `completions` into the engine until the queue
    /// closes.
    pub fn spawn_hw_completions(
        self: &Arc<Self>,
        mut completions: mpsc::Receiver<CompletionEvent>,
    ) -> JoinHandle<()> {
        let me = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = completions.recv().await {
                let Some(initiator) = me.upgrade() else {
                    break;
                };
                initiator.on_hw_completion(event);
            }
            log::debug!("hardware completion queue closed");
        })
    }
}
