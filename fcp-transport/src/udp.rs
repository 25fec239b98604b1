//! Frames tunnelled over UDP, one encoded frame per datagram

use crate::error::{FcError, FcResult};
use crate::link::{LinkAccessor, LinkLayer};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest datagram accepted; an FCoE PDU with a full payload fits easily
pub const MAX_DATAGRAM_SIZE: usize = 2240;

/// UDP link settings
#[derive(Debug, Clone)]
pub struct UdpSettings {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub timeout: Option<Duration>,
}

impl UdpSettings {
    pub fn new(local_address: SocketAddr, remote_address: SocketAddr) -> Self {
        Self {
            local_address,
            remote_address,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Frame link over a UDP socket
pub struct UdpLink {
    socket: Option<UdpSocket>,
    settings: UdpSettings,
    closed: bool,
}

impl UdpLink {
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            socket: None,
            settings,
            closed: true,
        }
    }

    /// Create from `local` and `remote` address strings
    pub fn from_addresses(local: &str, remote: &str) -> FcResult<Self> {
        let local = local
            .parse()
            .map_err(|e| FcError::InvalidData(format!("Invalid local address: {}", e)))?;
        let remote = remote
            .parse()
            .map_err(|e| FcError::InvalidData(format!("Invalid remote address: {}", e)))?;
        Ok(Self::new(UdpSettings::new(local, remote)))
    }

    fn socket(&self) -> FcResult<&UdpSocket> {
        self.socket.as_ref().ok_or_else(|| {
            FcError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "UDP link not open",
            ))
        })
    }
}

#[async_trait]
impl LinkLayer for UdpLink {
    async fn open(&mut self) -> FcResult<()> {
        if !self.closed {
            return Err(FcError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Link has already been opened",
            )));
        }
        let socket = UdpSocket::bind(self.settings.local_address).await?;
        self.socket = Some(socket);
        self.closed = false;
        Ok(())
    }
}

#[async_trait]
impl LinkAccessor for UdpLink {
    async fn recv(&mut self) -> FcResult<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        let socket = self.socket()?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = match self.settings.timeout {
                Some(timeout) => tokio::time::timeout(timeout, socket.recv_from(&mut buf))
                    .await
                    .map_err(|_| FcError::Timeout)??,
                None => socket.recv_from(&mut buf).await?,
            };
            // Datagrams from anyone but the peer are ignored
            if addr == self.settings.remote_address {
                buf.truncate(len);
                return Ok(Some(Bytes::from(buf)));
            }
            log::debug!("dropping datagram from unexpected peer {}", addr);
        }
    }

    async fn send(&mut self, frame: Bytes) -> FcResult<()> {
        let socket = self.socket()?;
        let sent = socket.send_to(&frame, self.settings.remote_address).await?;
        if sent != frame.len() {
            return Err(FcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short datagram write",
            )));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> FcResult<()> {
        self.socket = None;
        self.closed = true;
        Ok(())
    }
}
