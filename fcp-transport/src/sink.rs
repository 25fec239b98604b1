//! Outbound frame sinks
//!
//! The protocol engine emits frames from the issue path and from the
//! delivery path, neither of which may block. Sinks therefore accept or
//! refuse a frame immediately; refusal for lack of room is
//! [`FcError::ResourceExhausted`], which callers treat as retryable.

use crate::error::{FcError, FcResult};
use fcp_codec::FcFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Non-blocking destination for outbound frames
pub trait FrameSink: Send + Sync {
    /// Queue one frame for transmission.
    fn send(&self, frame: FcFrame) -> FcResult<()>;

    /// Try to free transmit resources. Returns the number of descriptors
    /// released.
    fn reclaim(&self) -> usize {
        0
    }
}

/// Bounded queue feeding a link writer task
#[derive(Debug, Clone)]
pub struct QueuedSink {
    tx: mpsc::Sender<FcFrame>,
}

impl QueuedSink {
    /// Create a sink and the receiver a link pump drains.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<FcFrame>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }
}

impl FrameSink for QueuedSink {
    fn send(&self, frame: FcFrame) -> FcResult<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                FcError::ResourceExhausted("transmit queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => FcError::Closed,
        })
    }
}

/// Sink that keeps every frame for inspection
///
/// Used by tests and the simulated target harness. Failures can be injected
/// to exercise the exhaustion paths.
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<VecDeque<FcFrame>>,
    fail_next: AtomicUsize,
    reclaims: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` frames with `ResourceExhausted`.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Remove and return everything sent so far.
    pub fn take(&self) -> Vec<FcFrame> {
        self.frames.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reclaim passes requested.
    pub fn reclaims(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl FrameSink for RecordingSink {
    fn send(&self, frame: FcFrame) -> FcResult<()> {
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(FcError::ResourceExhausted("injected sink failure".to_string()));
        }
        self.frames.lock().push_back(frame);
        Ok(())
    }

    fn reclaim(&self) -> usize {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
        0
    }
}
