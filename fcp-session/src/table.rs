//! Session table
//!
//! Maps (local port, remote port) to the one session that exists for that
//! pair. Sessions are created on first reference and removed once they are
//! logged out and no command holds them.

use crate::events::{SessionEvent, SessionEventListener};
use crate::login::{ElsRequester, LoginConfig, login, logout};
use crate::params::ServiceParams;
use crate::session::{Session, SessionKey};
use crate::state::SessionState;
use fcp_core::FcId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct SessionTable {
    local: ServiceParams,
    login: LoginConfig,
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
    /// Remote ports that rejected REC, kept across session removal
    rec_rejected: Mutex<HashSet<FcId>>,
    listeners: RwLock<Vec<Arc<dyn SessionEventListener>>>,
}

impl SessionTable {
    pub fn new(local: ServiceParams, login: LoginConfig) -> Self {
        Self {
            local,
            login,
            sessions: Mutex::new(HashMap::new()),
            rec_rejected: Mutex::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn local(&self) -> &ServiceParams {
        &self.local
    }

    /// Return the session for `(local, remote)`, creating it on first use.
    /// Concurrent callers get the same session.
    pub fn lookup_or_create(&self, local: FcId, remote: FcId) -> Arc<Session> {
        let key = SessionKey::new(local, remote);
        let mut sessions = self.sessions.lock();
        sessions
            .entry(key)
            .or_insert_with(|| {
                log::debug!("new session {}", key);
                let params = ServiceParams {
                    port_id: local,
                    ..self.local
                };
                let session = Session::new(params, remote);
                if self.rec_rejected.lock().contains(&remote) {
                    session.mark_rec_rejected();
                }
                Arc::new(session)
            })
            .clone()
    }

    pub fn get(&self, key: SessionKey) -> Option<Arc<Session>> {
        self.sessions.lock().get(&key).cloned()
    }

    /// Session to `remote` from this table's local port.
    pub fn find(&self, remote: FcId) -> Option<Arc<Session>> {
        self.get(SessionKey::new(self.local.port_id, remote))
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Deliver `event` to every registered listener.
    pub fn emit(&self, event: SessionEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }

    /// Set or clear the ready flag.
    pub fn mark_ready(&self, session: &Session, ready: bool) {
        if session.is_ready() != ready {
            log::info!(
                "session {} {}",
                session.key(),
                if ready { "ready" } else { "not ready" }
            );
        }
        session.set_ready(ready);
    }

    /// Start login in the background. Returns `None` when a login for this
    /// session is already running.
    pub fn start(
        self: &Arc<Self>,
        session: Arc<Session>,
        requester: Arc<dyn ElsRequester>,
    ) -> Option<JoinHandle<()>> {
        let state = session.state();
        if state.is_logging_in() {
            return None;
        }
        if state == SessionState::Ready {
            self.mark_ready(&session, false);
            // Re-login from scratch; Ready -> Init is always valid.
            let _ = session.transition(SessionState::Init);
        }
        let table = self.clone();
        Some(tokio::spawn(async move {
            let key = session.key();
            let remote = session.remote_id();
            match login(&session, requester.as_ref(), &table.login).await {
                Ok(()) => match session.transition(SessionState::Ready) {
                    Ok(()) => {
                        table.mark_ready(&session, true);
                        let wwpn = session.remote_port().map(|r| r.wwpn).unwrap_or_default();
                        table.emit(SessionEvent::Ready { key, remote, wwpn });
                    }
                    Err(e) => log::warn!("session {} changed during login: {}", key, e),
                },
                Err(e) => {
                    log::warn!("login to {} failed: {}", remote, e);
                    if session.state().is_logging_in() {
                        let _ = session.transition(SessionState::Failed);
                    }
                    table.emit(SessionEvent::LoginFailed {
                        key,
                        remote,
                        reason: e.to_string(),
                    });
                }
            }
        }))
    }

    /// Log out in the background; the session is removed once idle.
    pub fn stop(
        self: &Arc<Self>,
        session: Arc<Session>,
        requester: Arc<dyn ElsRequester>,
    ) -> JoinHandle<()> {
        self.mark_ready(&session, false);
        let table = self.clone();
        tokio::spawn(async move {
            let was_ready = session.transition(SessionState::LogoPending).is_ok();
            if was_ready {
                if let Err(e) = logout(&session, requester.as_ref()).await {
                    log::warn!("LOGO to {} failed: {}", session.remote_id(), e);
                }
            }
            table.logged_out(&session);
        })
    }

    /// The remote port is gone: by our LOGO, its LOGO, or a failed login
    /// being abandoned.
    pub fn logged_out(&self, session: &Session) {
        self.mark_ready(session, false);
        if let Err(e) = session.transition(SessionState::LoggedOut) {
            log::debug!("{}", e);
        }
        self.emit(SessionEvent::LoggedOut {
            key: session.key(),
            remote: session.remote_id(),
        });
        self.remove_if_idle(session.key());
    }

    /// Take a command reference on the session behind `key`.
    pub fn acquire(&self, key: SessionKey) -> Option<Arc<Session>> {
        let session = self.get(key)?;
        session.acquire();
        Some(session)
    }

    /// Drop a command reference; the last one after logout removes the
    /// session.
    pub fn release(&self, key: SessionKey) {
        let Some(session) = self.get(key) else {
            return;
        };
        if session.release() == 0 {
            self.remove_if_idle(key);
        }
    }

    fn remove_if_idle(&self, key: SessionKey) {
        let mut sessions = self.sessions.lock();
        let idle = sessions
            .get(&key)
            .is_some_and(|s| s.refs() == 0 && s.state() == SessionState::LoggedOut);
        if idle {
            if let Some(session) = sessions.remove(&key) {
                if session.rec_rejected() {
                    self.rec_rejected.lock().insert(session.remote_id());
                }
            }
            log::debug!("session {} removed", key);
        }
    }
}
