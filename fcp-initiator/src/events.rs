//! Host event queue
//!
//! Management-plane notifications (link state, target login and logout,
//! RSCN, degraded LUNs, resets) go to a bounded queue. When the consumer
//! falls behind, new events are dropped and counted; the producer never
//! waits. Each event is also available as a fixed 16-byte record.

use bitflags::bitflags;
use fcp_core::{FcError, FcId, FcResult, Wwn};
use fcp_session::{SessionEvent, SessionEventListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Encoded event record length
pub const HOST_EVENT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostEventKind {
    LinkUp = 1,
    LinkDown = 2,
    TargetLogin = 3,
    TargetLogout = 4,
    Rscn = 5,
    LunDegraded = 6,
    Reset = 7,
    RecUnsupported = 8,
}

impl HostEventKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => HostEventKind::LinkUp,
            2 => HostEventKind::LinkDown,
            3 => HostEventKind::TargetLogin,
            4 => HostEventKind::TargetLogout,
            5 => HostEventKind::Rscn,
            6 => HostEventKind::LunDegraded,
            7 => HostEventKind::Reset,
            8 => HostEventKind::RecUnsupported,
            _ => return None,
        })
    }

    pub fn mask(self) -> EventMask {
        match self {
            HostEventKind::LinkUp => EventMask::LINK_UP,
            HostEventKind::LinkDown => EventMask::LINK_DOWN,
            HostEventKind::TargetLogin => EventMask::TARGET_LOGIN,
            HostEventKind::TargetLogout => EventMask::TARGET_LOGOUT,
            HostEventKind::Rscn => EventMask::RSCN,
            HostEventKind::LunDegraded => EventMask::LUN_DEGRADED,
            HostEventKind::Reset => EventMask::RESET,
            HostEventKind::RecUnsupported => EventMask::REC_UNSUPPORTED,
        }
    }
}

bitflags! {
    /// Event kinds a consumer wants to see
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const LINK_UP = 1 << 0;
        const LINK_DOWN = 1 << 1;
        const TARGET_LOGIN = 1 << 2;
        const TARGET_LOGOUT = 1 << 3;
        const RSCN = 1 << 4;
        const LUN_DEGRADED = 1 << 5;
        const RESET = 1 << 6;
        const REC_UNSUPPORTED = 1 << 7;
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::all()
    }
}

/// One management-plane event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent {
    pub kind: HostEventKind,
    /// Port the event is about; zero for port-wide events
    pub fc_id: FcId,
    pub seq: u32,
    pub wwpn: Wwn,
}

impl HostEvent {
    /// `kind`, `fc_id[3]`, `seq` (BE32), `wwpn` (BE64)
    pub fn encode(&self) -> [u8; HOST_EVENT_LEN] {
        let mut out = [0u8; HOST_EVENT_LEN];
        out[0] = self.kind as u8;
        out[1..4].copy_from_slice(&self.fc_id.to_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..16].copy_from_slice(&self.wwpn.to_bytes());
        out
    }

    pub fn decode(record: &[u8]) -> FcResult<Self> {
        if record.len() != HOST_EVENT_LEN {
            return Err(FcError::InvalidData(format!(
                "host event record is {} bytes, expected {}",
                record.len(),
                HOST_EVENT_LEN
            )));
        }
        let kind = HostEventKind::from_u8(record[0]).ok_or_else(|| {
            FcError::InvalidData(format!("unknown host event kind {}", record[0]))
        })?;
        let mut fc_id = [0u8; 3];
        fc_id.copy_from_slice(&record[1..4]);
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&record[4..8]);
        let mut wwpn = [0u8; 8];
        wwpn.copy_from_slice(&record[8..16]);
        Ok(Self {
            kind,
            fc_id: FcId::from_bytes(fc_id),
            seq: u32::from_be_bytes(seq),
            wwpn: Wwn::from_bytes(wwpn),
        })
    }
}

#[derive(Debug)]
struct Shared {
    seq: AtomicU32,
    dropped: AtomicU64,
    mask: AtomicU32,
}

/// Producer side of the host event queue
#[derive(Clone)]
pub struct HostEventQueue {
    tx: mpsc::Sender<HostEvent>,
    shared: Arc<Shared>,
}

/// Consumer side of the host event queue
#[derive(Debug)]
pub struct HostEventReceiver {
    rx: mpsc::Receiver<HostEvent>,
    shared: Arc<Shared>,
}

impl HostEventQueue {
    pub fn new(depth: usize) -> (Self, HostEventReceiver) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let shared = Arc::new(Shared {
            seq: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
            mask: AtomicU32::new(EventMask::all().bits()),
        });
        (
            Self {
                tx,
                shared: shared.clone(),
            },
            HostEventReceiver { rx, shared },
        )
    }

    /// Queue an event unless the consumer masked it out. Returns false when
    /// it was dropped because the queue is full.
    pub fn post(&self, kind: HostEventKind, fc_id: FcId, wwpn: Wwn) -> bool {
        let mask = EventMask::from_bits_retain(self.shared.mask.load(Ordering::Acquire));
        if !mask.contains(kind.mask()) {
            return true;
        }
        let event = HostEvent {
            kind,
            fc_id,
            seq: self.shared.seq.fetch_add(1, Ordering::AcqRel),
            wwpn,
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("host event queue full, dropped {:?}", kind);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl HostEventReceiver {
    pub fn set_mask(&self, mask: EventMask) {
        self.shared.mask.store(mask.bits(), Ordering::Release);
    }

    pub fn mask(&self) -> EventMask {
        EventMask::from_bits_retain(self.shared.mask.load(Ordering::Acquire))
    }

    /// Events lost to a full queue so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Next event passing the current mask.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        loop {
            let event = self.rx.recv().await?;
            if self.mask().contains(event.kind.mask()) {
                return Some(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<HostEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if self.mask().contains(event.kind.mask()) {
                return Some(event);
            }
        }
        None
    }

    /// Deliver events to `handler` until every producer is gone.
    pub async fn run(mut self, handler: Arc<dyn HostEventHandler>) {
        while let Some(event) = self.recv().await {
            handler.on_host_event(event);
        }
    }
}

/// Consumer of host events
pub trait HostEventHandler: Send + Sync {
    fn on_host_event(&self, event: HostEvent);
}

/// Republishes session events as host events.
pub(crate) struct SessionEventBridge {
    pub events: HostEventQueue,
}

impl SessionEventListener for SessionEventBridge {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Ready { remote, wwpn, .. } => {
                self.events.post(HostEventKind::TargetLogin, remote, wwpn);
            }
            SessionEvent::LoggedOut { remote, .. } => {
                self.events
                    .post(HostEventKind::TargetLogout, remote, Wwn::default());
            }
            SessionEvent::RecUnsupported { remote, .. } => {
                self.events
                    .post(HostEventKind::RecUnsupported, remote, Wwn::default());
            }
            SessionEvent::LoginFailed { .. } => {}
        }
    }
}
