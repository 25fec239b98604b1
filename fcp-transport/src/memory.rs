//! In-memory link pair

use crate::error::{FcError, FcResult};
use crate::link::LinkAccessor;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One end of an in-memory, frame-preserving link
pub struct MemoryLink {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
    closed: bool,
}

impl MemoryLink {
    /// Create two connected ends, each buffering up to `depth` frames.
    pub fn pair(depth: usize) -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = mpsc::channel(depth);
        let (b_tx, a_rx) = mpsc::channel(depth);
        (
            MemoryLink {
                tx: Some(a_tx),
                rx: a_rx,
                closed: false,
            },
            MemoryLink {
                tx: Some(b_tx),
                rx: b_rx,
                closed: false,
            },
        )
    }
}

#[async_trait]
impl LinkAccessor for MemoryLink {
    async fn recv(&mut self) -> FcResult<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, frame: Bytes) -> FcResult<()> {
        let tx = self.tx.as_ref().ok_or(FcError::Closed)?;
        tx.send(frame).await.map_err(|_| FcError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> FcResult<()> {
        self.closed = true;
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_preserves_frames() {
        let (mut a, mut b) = MemoryLink::pair(4);
        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (mut a, mut b) = MemoryLink::pair(4);
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(matches!(a.send(Bytes::new()).await, Err(FcError::Closed)));
        assert_eq!(b.recv().await.unwrap(), None);
    }
}
