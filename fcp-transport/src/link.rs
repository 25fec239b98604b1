//! Link accessor trait for the transport layer

use crate::error::FcResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Frame-oriented access to a physical or emulated link
///
/// Each call moves exactly one encoded frame; the link never splits or
/// coalesces them.
#[async_trait]
pub trait LinkAccessor: Send + Sync {
    /// Receive the next frame.
    ///
    /// # Returns
    ///
    /// `Ok(None)` once the peer has closed the link
    async fn recv(&mut self) -> FcResult<Option<Bytes>>;

    /// Send one encoded frame
    async fn send(&mut self, frame: Bytes) -> FcResult<()>;

    /// Check if the link is closed
    fn is_closed(&self) -> bool;

    /// Close the link
    async fn close(&mut self) -> FcResult<()>;
}

/// Link that must be opened before use
#[async_trait]
pub trait LinkLayer: LinkAccessor {
    /// Open the physical link
    async fn open(&mut self) -> FcResult<()>;
}
