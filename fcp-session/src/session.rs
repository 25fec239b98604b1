//! Remote port session

use crate::error::{FcError, FcResult};
use crate::params::{FcpParams, RemotePort, ServiceParams};
use crate::state::SessionState;
use fcp_core::FcId;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Table key: local FC_ID in the upper bits, remote FC_ID in the low 24
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl SessionKey {
    pub fn new(local: FcId, remote: FcId) -> Self {
        Self(u64::from(local.value()) << 24 | u64::from(remote.value()))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}:{:06x}", self.0 >> 24, self.0 & 0xFF_FFFF)
    }
}

/// Login session with one remote port
///
/// Shared between the session table and every command bound to it. Command
/// bindings are counted explicitly with [`Session::acquire`] /
/// [`Session::release`] so the table knows when a logged-out session can go.
pub struct Session {
    key: SessionKey,
    remote_id: FcId,
    local: ServiceParams,
    remote: RwLock<Option<RemotePort>>,
    fcp: RwLock<FcpParams>,
    state: Mutex<SessionState>,
    ready: watch::Sender<bool>,
    rec_supported: AtomicBool,
    rec_rejected: AtomicBool,
    refs: AtomicUsize,
}

impl Session {
    pub fn new(local: ServiceParams, remote_id: FcId) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            key: SessionKey::new(local.port_id, remote_id),
            remote_id,
            local,
            remote: RwLock::new(None),
            fcp: RwLock::new(FcpParams {
                max_frame_size: local.max_frame_size,
                e_d_tov_ms: local.e_d_tov_ms,
                ..FcpParams::default()
            }),
            state: Mutex::new(SessionState::Init),
            ready,
            rec_supported: AtomicBool::new(false),
            rec_rejected: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn remote_id(&self) -> FcId {
        self.remote_id
    }

    pub fn local(&self) -> &ServiceParams {
        &self.local
    }

    /// Remote identity learned from the PLOGI accept.
    pub fn remote_port(&self) -> Option<RemotePort> {
        *self.remote.read()
    }

    pub fn fcp_params(&self) -> FcpParams {
        *self.fcp.read()
    }

    /// Largest payload to place in one frame to this port.
    pub fn max_payload(&self) -> usize {
        usize::from(self.fcp.read().max_frame_size)
    }

    pub fn e_d_tov(&self) -> Duration {
        Duration::from_millis(u64::from(self.fcp.read().e_d_tov_ms))
    }

    pub fn r_a_tov(&self) -> Duration {
        Duration::from_millis(u64::from(self.local.r_a_tov_ms))
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `new_state`, validating the transition.
    pub fn transition(&self, new_state: SessionState) -> FcResult<()> {
        let mut state = self.state.lock();
        state.validate_transition(new_state)?;
        if *state != new_state {
            log::debug!(
                "session {}: {} -> {}",
                self.key,
                state.as_str(),
                new_state.as_str()
            );
        }
        *state = new_state;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Wait until the session is ready, at most `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> FcResult<()> {
        let mut rx = self.ready.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(FcError::Closed),
            Err(_) => Err(FcError::NoSession(self.remote_id.to_string())),
        }
    }

    pub fn rec_supported(&self) -> bool {
        self.rec_supported.load(Ordering::Acquire)
    }

    /// Turn sequence-level recovery off for good. Returns whether it was on.
    ///
    /// Later logins keep it off even when PRLI advertises retry support.
    pub fn clear_rec_supported(&self) -> bool {
        self.rec_rejected.store(true, Ordering::Release);
        self.rec_supported.swap(false, Ordering::AcqRel)
    }

    /// Whether the remote port has rejected REC as unsupported.
    pub fn rec_rejected(&self) -> bool {
        self.rec_rejected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_rec_rejected(&self) {
        self.rec_rejected.store(true, Ordering::Release);
        self.rec_supported.store(false, Ordering::Release);
    }

    /// Record the results of a successful PLOGI / PRLI.
    pub fn apply_login(&self, remote: RemotePort, fcp: FcpParams) {
        *self.remote.write() = Some(remote);
        *self.fcp.write() = fcp;
        let rec = fcp.retry && !self.rec_rejected();
        self.rec_supported.store(rec, Ordering::Release);
    }

    /// Take a reference on behalf of a command.
    pub fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a command reference. Returns the count left.
    pub fn release(&self) -> usize {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("ready", &self.is_ready())
            .field("rec_supported", &self.rec_supported())
            .field("rec_rejected", &self.rec_rejected())
            .field("refs", &self.refs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcp_core::Wwn;

    fn session() -> Session {
        let local = ServiceParams::new(FcId::new(0x010001).unwrap(), Wwn::new(1), Wwn::new(2));
        Session::new(local, FcId::new(0x020002).unwrap())
    }

    #[test]
    fn test_key_layout() {
        let key = SessionKey::new(FcId::new(0x0A0B0C).unwrap(), FcId::new(0x010203).unwrap());
        assert_eq!(key.value(), 0x0A0B0C_010203);
        assert_eq!(key.to_string(), "0a0b0c:010203");
    }

    #[test]
    fn test_refcount() {
        let s = session();
        assert_eq!(s.acquire(), 1);
        assert_eq!(s.acquire(), 2);
        assert_eq!(s.release(), 1);
        assert_eq!(s.release(), 0);
        assert_eq!(s.release(), 0);
    }

    #[test]
    fn test_rec_flag_follows_prli() {
        let s = session();
        assert!(!s.rec_supported());
        s.apply_login(
            RemotePort {
                port_id: s.remote_id(),
                wwpn: Wwn::new(3),
                wwnn: Wwn::new(4),
            },
            FcpParams {
                retry: true,
                target: true,
                max_frame_size: 1024,
                e_d_tov_ms: 2000,
                ..FcpParams::default()
            },
        );
        assert!(s.rec_supported());
        assert_eq!(s.max_payload(), 1024);
        assert!(s.clear_rec_supported());
        assert!(!s.clear_rec_supported());
    }

    #[test]
    fn test_rec_rejection_survives_login() {
        let s = session();
        let remote = RemotePort {
            port_id: s.remote_id(),
            wwpn: Wwn::new(3),
            wwnn: Wwn::new(4),
        };
        let fcp = FcpParams {
            retry: true,
            target: true,
            ..FcpParams::default()
        };
        s.apply_login(remote, fcp);
        assert!(s.clear_rec_supported());
        assert!(s.rec_rejected());

        s.apply_login(remote, fcp);
        assert!(!s.rec_supported());
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let s = std::sync::Arc::new(session());
        assert!(matches!(
            s.wait_ready(Duration::from_millis(10)).await,
            Err(FcError::NoSession(_))
        ));
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_ready(Duration::from_secs(5)).await })
        };
        s.set_ready(true);
        assert!(waiter.await.unwrap().is_ok());
    }
}
