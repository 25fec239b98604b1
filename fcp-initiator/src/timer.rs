//! Command timers
//!
//! Each command owns at most one live timer. Arming a new period bumps the
//! command's token, so an expiry carrying an old token is recognised as
//! stale under the slot lock and ignored, even if cancellation raced with
//! the expiry being delivered.

use fcp_core::SlotHandle;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies one timer period of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    pub command: SlotHandle,
    pub token: u32,
}

/// Schedules command timers; expiries are fed back to
/// `FcpInitiator::on_timer`
pub trait TimerService: Send + Sync {
    fn arm(&self, key: TimerKey, after: Duration);

    /// Best effort; a late expiry is filtered by its token.
    fn cancel(&self, key: TimerKey);
}

/// Timers backed by Tokio sleeps, expiries delivered on a channel
pub struct TokioTimers {
    expired: mpsc::UnboundedSender<TimerKey>,
    pending: Arc<Mutex<HashMap<TimerKey, JoinHandle<()>>>>,
}

impl TokioTimers {
    /// Must be called from within a Tokio runtime.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                expired: tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl TimerService for TokioTimers {
    fn arm(&self, key: TimerKey, after: Duration) {
        let expired = self.expired.clone();
        let pending = self.pending.clone();
        let mut map = self.pending.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            pending.lock().remove(&key);
            let _ = expired.send(key);
        });
        if let Some(old) = map.insert(key, task) {
            old.abort();
        }
    }

    fn cancel(&self, key: TimerKey) {
        if let Some(task) = self.pending.lock().remove(&key) {
            task.abort();
        }
    }
}

/// Timers that only fire when told to; for tests and simulations
#[derive(Debug, Default)]
pub struct ManualTimers {
    armed: Mutex<BTreeMap<TimerKey, Duration>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Armed timers with their durations.
    pub fn armed(&self) -> Vec<(TimerKey, Duration)> {
        self.armed.lock().iter().map(|(k, d)| (*k, *d)).collect()
    }

    pub fn is_armed(&self, command: SlotHandle) -> bool {
        self.armed.lock().keys().any(|k| k.command == command)
    }

    /// Latest armed duration for `command`.
    pub fn duration(&self, command: SlotHandle) -> Option<Duration> {
        self.armed
            .lock()
            .iter()
            .filter(|(k, _)| k.command == command)
            .max_by_key(|(k, _)| k.token)
            .map(|(_, d)| *d)
    }

    /// Disarm the newest timer of `command` and return its key for delivery.
    pub fn expire(&self, command: SlotHandle) -> Option<TimerKey> {
        let mut armed = self.armed.lock();
        let key = armed
            .keys()
            .filter(|k| k.command == command)
            .max_by_key(|k| k.token)
            .copied()?;
        armed.remove(&key);
        Some(key)
    }

    /// Disarm everything and return the keys.
    pub fn expire_all(&self) -> Vec<TimerKey> {
        std::mem::take(&mut *self.armed.lock()).into_keys().collect()
    }
}

impl TimerService for ManualTimers {
    fn arm(&self, key: TimerKey, after: Duration) {
        self.armed.lock().insert(key, after);
    }

    fn cancel(&self, key: TimerKey) {
        self.armed.lock().remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: u32, token: u32) -> TimerKey {
        TimerKey {
            command: SlotHandle::from_tag(tag),
            token,
        }
    }

    #[test]
    fn test_manual_expire_newest() {
        let timers = ManualTimers::new();
        timers.arm(key(1, 1), Duration::from_secs(10));
        timers.arm(key(1, 2), Duration::from_secs(3));
        timers.arm(key(2, 1), Duration::from_secs(5));
        assert_eq!(timers.duration(SlotHandle::from_tag(1)), Some(Duration::from_secs(3)));
        assert_eq!(timers.expire(SlotHandle::from_tag(1)), Some(key(1, 2)));
        timers.cancel(key(1, 1));
        assert!(!timers.is_armed(SlotHandle::from_tag(1)));
        assert_eq!(timers.expire_all(), vec![key(2, 1)]);
        assert!(timers.armed().is_empty());
    }

    #[tokio::test]
    async fn test_tokio_timer_fires() {
        let (timers, mut rx) = TokioTimers::new();
        timers.arm(key(7, 1), Duration::from_millis(50));
        timers.arm(key(8, 1), Duration::from_millis(10));
        timers.cancel(key(8, 1));
        assert_eq!(rx.recv().await, Some(key(7, 1)));
        assert_eq!(timers.pending(), 0);
    }
}
