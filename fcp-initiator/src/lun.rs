//! LUN health tracking
//!
//! Consecutive hard failures on one LUN mark it degraded; new commands to
//! a degraded LUN fail fast until a LUN or target reset succeeds.

use fcp_core::{FcId, ScsiLun};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LunHealth {
    consecutive_failures: u32,
    degraded: bool,
}

#[derive(Debug)]
pub struct LunHealthTable {
    threshold: u32,
    luns: Mutex<HashMap<(FcId, ScsiLun), LunHealth>>,
}

impl LunHealthTable {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            luns: Mutex::new(HashMap::new()),
        }
    }

    /// Record a completion. Returns true when this one degraded the LUN.
    pub fn record(&self, d_id: FcId, lun: ScsiLun, hard_failure: bool) -> bool {
        let mut luns = self.luns.lock();
        if !hard_failure {
            if let Some(health) = luns.get_mut(&(d_id, lun)) {
                health.consecutive_failures = 0;
            }
            return false;
        }
        let health = luns.entry((d_id, lun)).or_default();
        health.consecutive_failures += 1;
        if !health.degraded && health.consecutive_failures >= self.threshold {
            health.degraded = true;
            log::warn!(
                "LUN {} on {} degraded after {} consecutive failures",
                lun.to_u64(),
                d_id,
                health.consecutive_failures
            );
            return true;
        }
        false
    }

    pub fn is_degraded(&self, d_id: FcId, lun: ScsiLun) -> bool {
        self.luns
            .lock()
            .get(&(d_id, lun))
            .is_some_and(|h| h.degraded)
    }

    pub fn failures(&self, d_id: FcId, lun: ScsiLun) -> u32 {
        self.luns
            .lock()
            .get(&(d_id, lun))
            .map_or(0, |h| h.consecutive_failures)
    }

    pub fn clear(&self, d_id: FcId, lun: ScsiLun) {
        self.luns.lock().remove(&(d_id, lun));
    }

    /// Forget every LUN behind `d_id`.
    pub fn clear_target(&self, d_id: FcId) {
        self.luns.lock().retain(|(id, _), _| *id != d_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_after_threshold() {
        let table = LunHealthTable::new(3);
        let d_id = FcId::new(0x0a0b0c).unwrap();
        let lun = ScsiLun::from_u64(2);
        assert!(!table.record(d_id, lun, true));
        assert!(!table.record(d_id, lun, true));
        assert!(table.record(d_id, lun, true));
        assert!(table.is_degraded(d_id, lun));
        // Only the crossing reports.
        assert!(!table.record(d_id, lun, true));
        assert!(!table.is_degraded(d_id, ScsiLun::from_u64(3)));
    }

    #[test]
    fn test_success_resets_streak() {
        let table = LunHealthTable::new(2);
        let d_id = FcId::new(0x0a0b0c).unwrap();
        let lun = ScsiLun::from_u64(0);
        table.record(d_id, lun, true);
        table.record(d_id, lun, false);
        assert_eq!(table.failures(d_id, lun), 0);
        assert!(!table.record(d_id, lun, true));
    }

    #[test]
    fn test_clear_target() {
        let table = LunHealthTable::new(1);
        let a = FcId::new(1).unwrap();
        let b = FcId::new(2).unwrap();
        table.record(a, ScsiLun::from_u64(0), true);
        table.record(a, ScsiLun::from_u64(1), true);
        table.record(b, ScsiLun::from_u64(0), true);
        table.clear_target(a);
        assert!(!table.is_degraded(a, ScsiLun::from_u64(1)));
        assert!(table.is_degraded(b, ScsiLun::from_u64(0)));
        table.clear(b, ScsiLun::from_u64(0));
        assert!(!table.is_degraded(b, ScsiLun::from_u64(0)));
    }
}
