//! Initiator statistics collection

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the initiator while it runs
///
/// Every counter is an independent atomic, so a snapshot taken while
/// traffic flows is not a consistent cut across counters.
#[derive(Debug, Default)]
pub struct InitiatorStatistics {
    commands_issued: AtomicU64,
    commands_completed: AtomicU64,
    commands_failed: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    crc_errors: AtomicU64,
    timeouts: AtomicU64,
    rec_sent: AtomicU64,
    srr_sent: AtomicU64,
    abts_sent: AtomicU64,
    resets: AtomicU64,
    events_dropped: AtomicU64,
}

/// Point-in-time copy of [`InitiatorStatistics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub commands_issued: u64,
    pub commands_completed: u64,
    /// Completions with any code other than `Ok`
    pub commands_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Inbound frames with no matching exchange
    pub frames_dropped: u64,
    pub crc_errors: u64,
    pub timeouts: u64,
    pub rec_sent: u64,
    pub srr_sent: u64,
    pub abts_sent: u64,
    pub resets: u64,
    pub events_dropped: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl InitiatorStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        increment_commands_issued => commands_issued,
        increment_commands_failed => commands_failed,
        increment_commands_completed => commands_completed,
        increment_frames_sent => frames_sent,
        increment_frames_received => frames_received,
        increment_frames_dropped => frames_dropped,
        increment_crc_errors => crc_errors,
        increment_timeouts => timeouts,
        increment_rec_sent => rec_sent,
        increment_srr_sent => srr_sent,
        increment_abts_sent => abts_sent,
        increment_resets => resets,
    }

    pub fn set_events_dropped(&self, dropped: u64) {
        self.events_dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatisticsSnapshot {
            commands_issued: get(&self.commands_issued),
            commands_completed: get(&self.commands_completed),
            commands_failed: get(&self.commands_failed),
            frames_sent: get(&self.frames_sent),
            frames_received: get(&self.frames_received),
            frames_dropped: get(&self.frames_dropped),
            crc_errors: get(&self.crc_errors),
            timeouts: get(&self.timeouts),
            rec_sent: get(&self.rec_sent),
            srr_sent: get(&self.srr_sent),
            abts_sent: get(&self.abts_sent),
            resets: get(&self.resets),
            events_dropped: get(&self.events_dropped),
        }
    }

    /// Reset all counters to zero.
    pub fn clear(&self) {
        for c in [
            &self.commands_issued,
            &self.commands_completed,
            &self.commands_failed,
            &self.frames_sent,
            &self.frames_received,
            &self.frames_dropped,
            &self.crc_errors,
            &self.timeouts,
            &self.rec_sent,
            &self.srr_sent,
            &self.abts_sent,
            &self.resets,
            &self.events_dropped,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

impl StatisticsSnapshot {
    /// Share of completed commands that failed, in percent.
    pub fn failure_rate(&self) -> f64 {
        if self.commands_completed == 0 {
            0.0
        } else {
            self.commands_failed as f64 / self.commands_completed as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_clear() {
        let stats = InitiatorStatistics::new();
        stats.increment_commands_issued();
        stats.increment_commands_completed();
        stats.increment_commands_completed();
        stats.increment_commands_failed();
        stats.increment_rec_sent();

        let snap = stats.snapshot();
        assert_eq!(snap.commands_issued, 1);
        assert_eq!(snap.rec_sent, 1);
        assert!((snap.failure_rate() - 50.0).abs() < f64::EPSILON);

        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_empty_failure_rate() {
        assert_eq!(StatisticsSnapshot::default().failure_rate(), 0.0);
    }
}
