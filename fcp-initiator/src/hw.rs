//! Hardware completion tracking
//!
//! With an offloading adapter the firmware runs the exchange and reports one
//! completion per request. Each request occupies a slot whose handle doubles
//! as the wire tag (`generation << 16 | index`), so a completion for a slot
//! that was already released and reused is recognised as stale.

use fcp_core::{FcError, FcResult, SlotHandle, SlotTable};
use fcp_transport::{CompletionEvent, HwQueue, HwRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Hardware I/O slot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwSlotState {
    #[default]
    Unused,
    CmdPending,
    CmdComplete,
    AbtsPending,
    AbtsComplete,
}

/// Who the completion of a slot goes to
pub(crate) enum HwOwner {
    /// ICMND of a command
    Command(SlotHandle),
    /// ITMF abort or terminate issued for a command
    Abort(SlotHandle),
    /// Task management or firmware reset awaited by a caller
    Waiter(oneshot::Sender<CompletionEvent>),
}

pub(crate) struct HwSlot {
    pub state: HwSlotState,
    pub owner: HwOwner,
}

/// Slots and submission for the hardware path
pub struct HwTracker {
    queue: Arc<dyn HwQueue>,
    slots: SlotTable<HwSlot>,
    submit_lock: Mutex<()>,
}

impl HwTracker {
    pub fn new(queue: Arc<dyn HwQueue>, depth: usize) -> Self {
        Self {
            queue,
            slots: SlotTable::with_capacity(depth),
            submit_lock: Mutex::new(()),
        }
    }

    pub(crate) fn acquire_slot(&self, owner: HwOwner) -> Option<SlotHandle> {
        self.slots
            .insert(HwSlot {
                state: HwSlotState::CmdPending,
                owner,
            })
            .ok()
    }

    /// Hand `request` to the queue under the slot's tag. When no descriptor
    /// is free, reclaims completed ones once and re-checks.
    pub fn submit(&self, handle: SlotHandle, request: HwRequest) -> FcResult<()> {
        let _guard = self.submit_lock.lock();
        if self.queue.free_descriptors() == 0 {
            let reclaimed = self.queue.reclaim();
            log::debug!("hardware queue full, reclaimed {}", reclaimed);
            if self.queue.free_descriptors() == 0 {
                return Err(FcError::ResourceExhausted("hardware queue".into()));
            }
        }
        self.queue.submit(handle.to_tag(), request)
    }

    /// Reserve a slot and submit; the slot is released again on failure.
    pub(crate) fn start(&self, owner: HwOwner, request: HwRequest) -> FcResult<SlotHandle> {
        let handle = self
            .acquire_slot(owner)
            .ok_or_else(|| FcError::ResourceExhausted("hardware slots".into()))?;
        if let Err(e) = self.submit(handle, request) {
            self.slots.take(handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn state(&self, handle: SlotHandle) -> HwSlotState {
        self.slots.with(handle, |s| s.state).unwrap_or_default()
    }

    pub fn set_state(&self, handle: SlotHandle, state: HwSlotState) -> bool {
        self.slots.with(handle, |s| s.state = state).is_some()
    }

    /// Close the slot for a completion and hand back its owner.
    pub(crate) fn complete(&self, handle: SlotHandle) -> Option<HwSlot> {
        self.slots.with(handle, |s| {
            s.state = match s.state {
                HwSlotState::AbtsPending => HwSlotState::AbtsComplete,
                _ => HwSlotState::CmdComplete,
            }
        })?;
        self.slots.take(handle)
    }

    pub fn release(&self, handle: SlotHandle) -> bool {
        self.slots.take(handle).is_some()
    }

    /// Close every slot except `keep`.
    pub(crate) fn drain_except(&self, keep: Option<SlotHandle>) -> Vec<HwSlot> {
        self.slots
            .handles()
            .into_iter()
            .filter(|h| Some(*h) != keep)
            .filter_map(|h| self.slots.take(h))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}
