//! Data phase accounting
//!
//! Frames may arrive out of order and may be retransmitted after SRR, so
//! the bytes moved are tracked as a set of ranges rather than a counter.
//! The total counts each byte once; the contiguous prefix is what REC and
//! SRR reason about.

/// Disjoint, sorted byte ranges `[start, end)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferRanges {
    ranges: Vec<(u32, u32)>,
}

impl TransferRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `len` bytes at `offset`. Returns the number of bytes not seen
    /// before.
    pub fn insert(&mut self, offset: u32, len: u32) -> u32 {
        if len == 0 {
            return 0;
        }
        let before = self.total();
        let mut start = offset;
        let mut end = offset.saturating_add(len);
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &(s, e) in &self.ranges {
            if e < start {
                merged.push((s, e));
            } else if end < s {
                if !placed {
                    merged.push((start, end));
                    placed = true;
                }
                merged.push((s, e));
            } else {
                start = start.min(s);
                end = end.max(e);
            }
        }
        if !placed {
            merged.push((start, end));
        }
        self.ranges = merged;
        self.total() - before
    }

    /// Bytes covered, each counted once.
    pub fn total(&self) -> u32 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Length of the gap-free prefix starting at offset zero.
    pub fn contiguous(&self) -> u32 {
        match self.ranges.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }

    pub fn contains(&self, offset: u32, len: u32) -> bool {
        let end = offset.saturating_add(len);
        self.ranges.iter().any(|&(s, e)| s <= offset && end <= e)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Split `[offset, end)` into frame-sized `(offset, len)` pieces.
pub fn chunks(offset: u32, end: u32, max_payload: u32) -> impl Iterator<Item = (u32, u32)> {
    let step = max_payload.max(1);
    let mut next = offset;
    std::iter::from_fn(move || {
        if next >= end {
            return None;
        }
        let len = step.min(end - next);
        let piece = (next, len);
        next += len;
        Some(piece)
    })
}
