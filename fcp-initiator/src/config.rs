//! Initiator configuration
//!
//! All timeouts are kept in milliseconds so the structure serializes to
//! plain numbers. Missing fields take their default when deserializing.

use fcp_session::LoginConfig;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Timeouts, retry bounds and capacities of one initiator port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitiatorConfig {
    /// Command timer when the session supports REC
    pub command_timeout_ms: u64,
    /// Command timer when it does not; shorter, since expiry aborts
    pub coarse_timeout_ms: u64,
    /// Wait for a REC or SRR answer, and the re-arm after a busy responder
    pub rec_tov_ms: u64,
    /// Wait for late data after a GOOD status with a short count
    pub grace_period_ms: u64,
    pub abort_timeout_ms: u64,
    pub tmf_timeout_ms: u64,
    /// Wait for hardware terminate requests during a LUN reset
    pub term_timeout_ms: u64,
    pub host_reset_timeout_ms: u64,
    pub els_timeout_ms: u64,
    /// How long `IssueMode::WaitReady` waits for a session to log in
    pub login_wait_ms: u64,
    pub login_retries: u32,
    pub login_retry_delay_ms: u64,
    pub max_recovery_retries: u32,
    /// Consecutive hard failures that degrade a LUN
    pub lun_failure_threshold: u32,
    /// Largest data field this port sends or accepts
    pub max_payload: u16,
    pub xid_min: u16,
    pub xid_max: u16,
    pub max_outstanding: usize,
    pub hw_queue_depth: usize,
    pub event_queue_depth: usize,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            coarse_timeout_ms: 5_000,
            rec_tov_ms: 3_000,
            grace_period_ms: 100,
            abort_timeout_ms: 10_000,
            tmf_timeout_ms: 10_000,
            term_timeout_ms: 500,
            host_reset_timeout_ms: 10_000,
            els_timeout_ms: 20_000,
            login_wait_ms: 10_000,
            login_retries: 3,
            login_retry_delay_ms: 500,
            max_recovery_retries: 3,
            lun_failure_threshold: 5,
            max_payload: 2048,
            xid_min: 0x0001,
            xid_max: 0x0FFF,
            max_outstanding: 1024,
            hw_queue_depth: 256,
            event_queue_depth: 64,
        }
    }
}

impl InitiatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = millis(timeout);
        self
    }

    pub fn with_coarse_timeout(mut self, timeout: Duration) -> Self {
        self.coarse_timeout_ms = millis(timeout);
        self
    }

    pub fn with_rec_tov(mut self, timeout: Duration) -> Self {
        self.rec_tov_ms = millis(timeout);
        self
    }

    pub fn with_grace_period(mut self, period: Duration) -> Self {
        self.grace_period_ms = millis(period);
        self
    }

    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout_ms = millis(timeout);
        self
    }

    pub fn with_tmf_timeout(mut self, timeout: Duration) -> Self {
        self.tmf_timeout_ms = millis(timeout);
        self
    }

    pub fn with_term_timeout(mut self, timeout: Duration) -> Self {
        self.term_timeout_ms = millis(timeout);
        self
    }

    pub fn with_els_timeout(mut self, timeout: Duration) -> Self {
        self.els_timeout_ms = millis(timeout);
        self
    }

    pub fn with_login_wait(mut self, timeout: Duration) -> Self {
        self.login_wait_ms = millis(timeout);
        self
    }

    pub fn with_login_retries(mut self, retries: u32) -> Self {
        self.login_retries = retries;
        self
    }

    pub fn with_max_recovery_retries(mut self, retries: u32) -> Self {
        self.max_recovery_retries = retries;
        self
    }

    pub fn with_lun_failure_threshold(mut self, threshold: u32) -> Self {
        self.lun_failure_threshold = threshold;
        self
    }

    pub fn with_max_payload(mut self, size: u16) -> Self {
        self.max_payload = size;
        self
    }

    pub fn with_xid_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.xid_min = *range.start();
        self.xid_max = *range.end();
        self
    }

    pub fn with_max_outstanding(mut self, count: usize) -> Self {
        self.max_outstanding = count;
        self
    }

    pub fn with_hw_queue_depth(mut self, depth: usize) -> Self {
        self.hw_queue_depth = depth;
        self
    }

    pub fn with_event_queue_depth(mut self, depth: usize) -> Self {
        self.event_queue_depth = depth;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn coarse_timeout(&self) -> Duration {
        Duration::from_millis(self.coarse_timeout_ms)
    }

    pub fn rec_tov(&self) -> Duration {
        Duration::from_millis(self.rec_tov_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn tmf_timeout(&self) -> Duration {
        Duration::from_millis(self.tmf_timeout_ms)
    }

    pub fn term_timeout(&self) -> Duration {
        Duration::from_millis(self.term_timeout_ms)
    }

    pub fn host_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.host_reset_timeout_ms)
    }

    pub fn els_timeout(&self) -> Duration {
        Duration::from_millis(self.els_timeout_ms)
    }

    pub fn login_wait(&self) -> Duration {
        Duration::from_millis(self.login_wait_ms)
    }

    pub fn xid_range(&self) -> RangeInclusive<u16> {
        self.xid_min..=self.xid_max
    }

    pub fn login_config(&self) -> LoginConfig {
        LoginConfig {
            retries: self.login_retries,
            retry_delay: Duration::from_millis(self.login_retry_delay_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
