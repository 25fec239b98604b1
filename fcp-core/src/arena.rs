//! Generation-tagged slot arena
//!
//! Outstanding commands and hardware I/O slots live in a fixed-capacity
//! table. A [`SlotHandle`] names a slot together with the generation it was
//! issued under; once the slot is released its generation advances, so any
//! later lookup through a stale handle (a late response, an expired timer, a
//! duplicate completion) finds nothing instead of touching a reused slot.
//! A slot whose generation is exhausted is retired rather than wrapped, so
//! no handle is ever issued twice.
//!
//! Each slot is guarded by its own lock. Closures passed to
//! [`SlotTable::with`] run under that lock and must not call back into the
//! same table for the same slot.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Largest table the 16-bit tag encoding can address
pub const MAX_SLOTS: usize = u16::MAX as usize;

/// Stable reference to a slot valid for one occupancy
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle {
    index: u16,
    generation: u16,
}

impl SlotHandle {
    /// Pack into the 32-bit tag handed to hardware: generation in the high
    /// half, slot index in the low half.
    pub fn to_tag(self) -> u32 {
        u32::from(self.generation) << 16 | u32::from(self.index)
    }

    pub fn from_tag(tag: u32) -> Self {
        Self {
            index: tag as u16,
            generation: (tag >> 16) as u16,
        }
    }

    pub fn index(self) -> usize {
        usize::from(self.index)
    }

    pub fn generation(self) -> u16 {
        self.generation
    }
}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}g{}", self.index, self.generation)
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.to_tag())
    }
}

struct SlotEntry<T> {
    generation: u16,
    value: Option<T>,
}

/// Fixed-capacity table of generation-tagged slots
pub struct SlotTable<T> {
    slots: Box<[Mutex<SlotEntry<T>>]>,
    free: Mutex<Vec<u16>>,
    retired: AtomicUsize,
}

impl<T> SlotTable<T> {
    /// Create a table with `capacity` slots (clamped to [`MAX_SLOTS`]).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_SLOTS);
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(SlotEntry {
                    generation: 0,
                    value: None,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Lowest indices are handed out first.
        let free = (0..capacity as u16).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            retired: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.capacity() - self.free.lock().len() - self.retired()
    }

    /// Slots taken out of service after using up every generation.
    pub fn retired(&self) -> usize {
        self.retired.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place `value` in a free slot. Gives the value back when the table is
    /// full.
    pub fn insert(&self, value: T) -> Result<SlotHandle, T> {
        let Some(index) = self.free.lock().pop() else {
            return Err(value);
        };
        let mut entry = self.slots[usize::from(index)].lock();
        debug_assert!(entry.value.is_none());
        entry.value = Some(value);
        Ok(SlotHandle {
            index,
            generation: entry.generation,
        })
    }

    /// Run `f` against the live value behind `handle`.
    ///
    /// Returns `None` when the handle is stale or the slot is empty.
    pub fn with<R>(&self, handle: SlotHandle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut entry = self.slots.get(handle.index())?.lock();
        if entry.generation != handle.generation {
            return None;
        }
        entry.value.as_mut().map(f)
    }

    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.with(handle, |_| ()).is_some()
    }

    /// Release the slot and hand back its value. Only the first caller for a
    /// given handle gets `Some`.
    pub fn take(&self, handle: SlotHandle) -> Option<T> {
        self.take_if(handle, |_| true)
    }

    /// Release the slot only if `pred` accepts the current value.
    pub fn take_if(&self, handle: SlotHandle, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let (value, reusable) = {
            let mut entry = self.slots.get(handle.index())?.lock();
            if entry.generation != handle.generation {
                return None;
            }
            if !entry.value.as_ref().is_some_and(pred) {
                return None;
            }
            let value = entry.value.take();
            match entry.generation.checked_add(1) {
                Some(next) => {
                    entry.generation = next;
                    (value, true)
                }
                None => (value, false),
            }
        };
        if reusable {
            self.free.lock().push(handle.index);
        } else {
            log::warn!("slot {} retired after {} generations", handle.index, u16::MAX);
            self.retired.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Snapshot of handles for every occupied slot.
    pub fn handles(&self) -> Vec<SlotHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.lock();
                entry.value.as_ref().map(|_| SlotHandle {
                    index: index as u16,
                    generation: entry.generation,
                })
            })
            .collect()
    }

    /// Handles of occupied slots whose value satisfies `pred`.
    pub fn select(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<SlotHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.lock();
                match entry.value.as_ref() {
                    Some(value) if pred(value) => Some(SlotHandle {
                        index: index as u16,
                        generation: entry.generation,
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

impl<T> fmt::Debug for SlotTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("retired", &self.retired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_take() {
        let table = SlotTable::with_capacity(2);
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();
        assert_eq!(table.insert("c"), Err("c"));
        assert_eq!(table.len(), 2);

        assert_eq!(table.take(a), Some("a"));
        assert_eq!(table.take(a), None);
        assert_eq!(table.with(b, |v| *v), Some("b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let table = SlotTable::with_capacity(1);
        let first = table.insert(1u32).unwrap();
        table.take(first);
        let second = table.insert(2u32).unwrap();

        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(table.with(first, |v| *v), None);
        assert_eq!(table.take(first), None);
        assert_eq!(table.with(second, |v| *v), Some(2));
    }

    #[test]
    fn test_tag_roundtrip() {
        let table = SlotTable::with_capacity(4);
        let h = table.insert(()).unwrap();
        table.take(h);
        let h = table.insert(()).unwrap();
        assert_eq!(h.generation(), 1);
        assert_eq!(SlotHandle::from_tag(h.to_tag()), h);
        assert_eq!(h.to_tag() >> 16, 1);
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let table = SlotTable::with_capacity(2);
        let keep = table.insert(0u32).unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut last = None;
        while let Ok(h) = table.insert(1u32) {
            assert!(seen.insert(h.to_tag()), "tag {} issued twice", h);
            assert_eq!(table.take(h), Some(1));
            last = Some(h);
        }
        let last = last.unwrap();
        assert_eq!(last.generation(), u16::MAX);
        assert_eq!(seen.len(), usize::from(u16::MAX) + 1);
        assert_eq!(table.retired(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.with(last, |v| *v), None);

        // The other slot keeps working.
        assert_eq!(table.take(keep), Some(0));
        let again = table.insert(2u32).unwrap();
        assert_eq!(again.index(), keep.index());
        assert_eq!(again.generation(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_if_and_select() {
        let table = SlotTable::with_capacity(8);
        let handles: Vec<_> = (0..5u32).map(|i| table.insert(i).unwrap()).collect();

        let even = table.select(|v| v % 2 == 0);
        assert_eq!(even.len(), 3);
        assert_eq!(table.take_if(handles[1], |v| *v == 7), None);
        assert_eq!(table.take_if(handles[1], |v| *v == 1), Some(1));
        assert_eq!(table.handles().len(), 4);
    }

    #[test]
    fn test_concurrent_take_is_exclusive() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let table = Arc::new(SlotTable::with_capacity(1));
        let h = table.insert(42u32).unwrap();
        let winners = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if table.take(h).is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
