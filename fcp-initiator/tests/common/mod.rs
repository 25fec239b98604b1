//! Shared harness: an initiator wired to a recording sink, manual timers
//! and a simulated target.

#![allow(dead_code)]

use fcp_core::{Cdb, FcId, ScsiLun, SlotHandle, Wwn};
use fcp_initiator::{
    CompletionHandler, FcpInitiator, HostEvent, HostEventKind, HostEventReceiver,
    InitiatorBuilder, InitiatorConfig, ManualTimers, Outcome, ScsiRequest, SimBehavior,
    TargetSim,
};
use fcp_session::{ServiceParams, Session};
use fcp_transport::{HwQueue, RecordingSink};
use parking_lot::Mutex;
use std::sync::Arc;

pub const INITIATOR: u32 = 0x010100;
pub const TARGET: u32 = 0x020200;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn target_id() -> FcId {
    FcId::new(TARGET).unwrap()
}

pub fn lun(n: u64) -> ScsiLun {
    ScsiLun::from_u64(n)
}

pub fn read10() -> Cdb {
    Cdb::new(&[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0]).unwrap()
}

pub fn write10() -> Cdb {
    Cdb::new(&[0x2a, 0, 0, 0, 0, 0, 0, 0, 8, 0]).unwrap()
}

pub fn test_unit_ready() -> Cdb {
    Cdb::new(&[0x00, 0, 0, 0, 0, 0]).unwrap()
}

pub fn read(lun_id: u64, len: u32) -> ScsiRequest {
    ScsiRequest::read(target_id(), lun(lun_id), read10(), len)
}

/// Outcomes delivered to completion handlers, in order
#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<Vec<Outcome>>>);

impl Outcomes {
    pub fn handler(&self) -> Box<dyn CompletionHandler> {
        let outcomes = self.0.clone();
        Box::new(move |outcome: Outcome| outcomes.lock().push(outcome))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn last(&self) -> Option<Outcome> {
        self.0.lock().last().cloned()
    }

    /// The one outcome delivered so far.
    pub fn single(&self) -> Outcome {
        let outcomes = self.0.lock();
        assert_eq!(outcomes.len(), 1, "expected exactly one completion");
        outcomes[0].clone()
    }
}

pub struct Harness {
    pub initiator: Arc<FcpInitiator>,
    pub events: HostEventReceiver,
    pub sink: Arc<RecordingSink>,
    pub timers: Arc<ManualTimers>,
    pub sim: TargetSim,
}

impl Harness {
    pub fn new(config: InitiatorConfig, behavior: SimBehavior) -> Self {
        Self::build(config, behavior, None)
    }

    pub fn with_hw(config: InitiatorConfig, behavior: SimBehavior, hw: Arc<dyn HwQueue>) -> Self {
        Self::build(config, behavior, Some(hw))
    }

    fn build(config: InitiatorConfig, behavior: SimBehavior, hw: Option<Arc<dyn HwQueue>>) -> Self {
        init_logging();
        let local = ServiceParams::new(
            FcId::new(INITIATOR).unwrap(),
            Wwn::new(0x2000_0000_c9aa_0001),
            Wwn::new(0x1000_0000_c9aa_0001),
        );
        let sink = Arc::new(RecordingSink::new());
        let timers = Arc::new(ManualTimers::new());
        let mut builder = InitiatorBuilder::new(local)
            .config(config)
            .sink(sink.clone())
            .timers(timers.clone());
        if let Some(hw) = hw {
            builder = builder.hw_queue(hw);
        }
        let (initiator, events) = builder.build().unwrap();
        let sim = TargetSim::new(target_id(), Wwn::new(0x2100_0024_ff00_0001))
            .with_behavior(behavior);
        Self {
            initiator,
            events,
            sink,
            timers,
            sim,
        }
    }

    /// Log in to the simulated target, pumping frames until the session is
    /// ready.
    pub async fn login(&mut self) -> Arc<Session> {
        let session = self.initiator.login(self.sim.port_id);
        self.wait_ready(&session).await;
        session
    }

    /// Pump frames until a login already under way finishes.
    pub async fn wait_ready(&mut self, session: &Session) {
        for _ in 0..200 {
            self.pump();
            if session.is_ready() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("login to {} did not complete", session.remote_id());
    }

    pub fn pump(&mut self) -> usize {
        self.sim.pump(&self.sink, &self.initiator)
    }

    /// Queue `request` and deliver whatever the target answers.
    pub fn submit(&mut self, request: ScsiRequest) -> (SlotHandle, Outcomes) {
        let outcomes = Outcomes::default();
        let handle = self
            .initiator
            .queue_command(request, outcomes.handler())
            .unwrap_or_else(|rejected| panic!("rejected: {}", rejected));
        self.pump();
        (handle, outcomes)
    }

    /// Fire the newest timer of `handle` and deliver the consequences.
    /// Returns false when no timer was armed.
    pub fn expire(&mut self, handle: SlotHandle) -> bool {
        let Some(key) = self.timers.expire(handle) else {
            return false;
        };
        self.initiator.on_timer(key);
        self.pump();
        true
    }

    /// Keep firing timers until `handle` completes or `limit` expiries
    /// have been spent. Returns the number of expiries used.
    pub fn run_to_completion(&mut self, handle: SlotHandle, limit: usize) -> usize {
        let mut fired = 0;
        while self.initiator.is_outstanding(handle) && fired < limit {
            assert!(self.expire(handle), "outstanding command without a timer");
            fired += 1;
        }
        fired
    }

    /// Drain events until one of `kind` shows up.
    pub fn find_event(&mut self, kind: HostEventKind) -> Option<HostEvent> {
        while let Some(event) = self.events.try_recv() {
            if event.kind == kind {
                return Some(event);
            }
        }
        None
    }
}
