//! Initiator builder
//!
//! Collects the collaborators of an [`FcpInitiator`] (frame sink, timer
//! service, optional hardware queue) and its configuration, then wires them
//! together.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use fcp_initiator::{InitiatorBuilder, InitiatorConfig};
//! use fcp_session::ServiceParams;
//! use fcp_transport::QueuedSink;
//! # async fn run(local: ServiceParams) -> fcp_core::FcResult<()> {
//! let (sink, _outbound) = QueuedSink::channel(256);
//! let (initiator, _events) = InitiatorBuilder::new(local)
//!     .config(InitiatorConfig::default().with_max_recovery_retries(3))
//!     .sink(std::sync::Arc::new(sink))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use crate::config::InitiatorConfig;
use crate::events::{HostEventQueue, HostEventReceiver};
use crate::hw::HwTracker;
use crate::initiator::{FcpInitiator, Parts};
use crate::timer::{TimerService, TokioTimers};
use fcp_core::{FcError, FcResult};
use fcp_session::ServiceParams;
use fcp_transport::{FrameSink, HwQueue};
use std::sync::Arc;

/// Builder for [`FcpInitiator`]
///
/// # Required
/// - a frame sink, unless every exchange is offloaded to hardware
///
/// # Defaults
/// - configuration: [`InitiatorConfig::default()`]
/// - timers: [`TokioTimers`], driven by a task on the current runtime
/// - no hardware queue (software exchanges)
pub struct InitiatorBuilder {
    local: ServiceParams,
    config: InitiatorConfig,
    sink: Option<Arc<dyn FrameSink>>,
    timers: Option<Arc<dyn TimerService>>,
    hw_queue: Option<Arc<dyn HwQueue>>,
}

impl InitiatorBuilder {
    /// Create a builder for the local port described by `local`
    ///
    /// # Arguments
    /// * `local` - Local port identity and service parameters advertised
    ///   at login
    pub fn new(local: ServiceParams) -> Self {
        Self {
            local,
            config: InitiatorConfig::default(),
            sink: None,
            timers: None,
            hw_queue: None,
        }
    }

    pub fn config(mut self, config: InitiatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set where outbound frames go
    pub fn sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the timer service
    ///
    /// # Note
    /// Expiries of a custom service must be fed to
    /// [`FcpInitiator::on_timer`] by the caller.
    pub fn timers(mut self, timers: Arc<dyn TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Offload commands and task management to an adapter queue
    ///
    /// Completions must be fed to [`FcpInitiator::on_hw_completion`], for
    /// example with [`FcpInitiator::spawn_hw_completions`].
    pub fn hw_queue(mut self, queue: Arc<dyn HwQueue>) -> Self {
        self.hw_queue = Some(queue);
        self
    }

    /// Build the initiator
    ///
    /// # Returns
    /// The initiator and the receiving end of its host event queue
    ///
    /// # Errors
    /// - `InvalidData` if no frame sink was configured or the exchange id
    ///   range is empty
    /// - `Closed` if default timers were requested outside a Tokio runtime
    pub fn build(self) -> FcResult<(Arc<FcpInitiator>, HostEventReceiver)> {
        let sink = self
            .sink
            .ok_or_else(|| FcError::InvalidData("initiator needs a frame sink".into()))?;
        if self.config.xid_min > self.config.xid_max {
            return Err(FcError::InvalidData(format!(
                "empty exchange id range {:#06x}..={:#06x}",
                self.config.xid_min, self.config.xid_max
            )));
        }
        let local = self.local.with_max_frame_size(self.config.max_payload);
        let (events, receiver) = HostEventQueue::new(self.config.event_queue_depth);
        let hw = self
            .hw_queue
            .map(|queue| HwTracker::new(queue, self.config.hw_queue_depth));

        let (timers, expiries): (Arc<dyn TimerService>, _) = match self.timers {
            Some(timers) => (timers, None),
            None => {
                let runtime =
                    tokio::runtime::Handle::try_current().map_err(|_| FcError::Closed)?;
                let (timers, expiries) = TokioTimers::new();
                (Arc::new(timers), Some((runtime, expiries)))
            }
        };

        let initiator = FcpInitiator::new(Parts {
            config: self.config,
            local,
            sink,
            timers,
            hw,
            events,
        });

        if let Some((runtime, mut expiries)) = expiries {
            let me = Arc::downgrade(&initiator);
            runtime.spawn(async move {
                while let Some(key) = expiries.recv().await {
                    let Some(initiator) = me.upgrade() else {
                        break;
                    };
                    initiator.on_timer(key);
                }
            });
        }
        log::info!(
            "initiator on {} ({}), {} byte frames, {}",
            local.port_id,
            local.wwpn,
            local.max_frame_size,
            if initiator.hw.is_some() {
                "hardware offload"
            } else {
                "software exchanges"
            }
        );
        Ok((initiator, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimers;
    use fcp_core::{FcId, Wwn};
    use fcp_transport::RecordingSink;

    fn local() -> ServiceParams {
        ServiceParams::new(
            FcId::new(0x010100).unwrap(),
            Wwn::new(0x2000_0000_c9aa_0001),
            Wwn::new(0x1000_0000_c9aa_0001),
        )
    }

    #[test]
    fn test_sink_required() {
        let err = InitiatorBuilder::new(local())
            .timers(Arc::new(ManualTimers::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, FcError::InvalidData(_)));
    }

    #[test]
    fn test_default_timers_need_runtime() {
        let err = InitiatorBuilder::new(local())
            .sink(Arc::new(RecordingSink::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, FcError::Closed));
    }

    #[tokio::test]
    async fn test_build_applies_config() {
        let config = InitiatorConfig::default().with_max_payload(1024);
        let (initiator, _events) = InitiatorBuilder::new(local())
            .config(config.clone())
            .sink(Arc::new(RecordingSink::new()))
            .build()
            .unwrap();
        assert_eq!(initiator.config(), &config);
        assert_eq!(initiator.local_port(), local().port_id);
        assert_eq!(initiator.sessions().local().max_frame_size, 1024);
        assert_eq!(initiator.outstanding(), 0);
    }
}
