//! Session events
//!
//! Login completes over several round trips, so its outcome is reported
//! through listeners registered on the session table rather than through a
//! return value.

use crate::session::SessionKey;
use fcp_core::{FcId, Wwn};

/// Something that happened to a remote port session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// PLOGI and PRLI completed
    Ready {
        key: SessionKey,
        remote: FcId,
        wwpn: Wwn,
    },

    /// Login was rejected or timed out; the session stays in the table
    LoginFailed {
        key: SessionKey,
        remote: FcId,
        reason: String,
    },

    /// Local or remote logout
    LoggedOut { key: SessionKey, remote: FcId },

    /// The target rejected REC; sequence-level recovery is off for it
    RecUnsupported { key: SessionKey, remote: FcId },
}

impl SessionEvent {
    pub fn key(&self) -> SessionKey {
        match self {
            SessionEvent::Ready { key, .. }
            | SessionEvent::LoginFailed { key, .. }
            | SessionEvent::LoggedOut { key, .. }
            | SessionEvent::RecUnsupported { key, .. } => *key,
        }
    }

    pub fn remote(&self) -> FcId {
        match self {
            SessionEvent::Ready { remote, .. }
            | SessionEvent::LoginFailed { remote, .. }
            | SessionEvent::LoggedOut { remote, .. }
            | SessionEvent::RecUnsupported { remote, .. } => *remote,
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::LoginFailed { .. })
    }
}

/// Event listener for session events
pub trait SessionEventListener: Send + Sync {
    /// Called on the task that produced the event; must not block.
    fn on_event(&self, event: SessionEvent);
}

/// Callback-based event listener
pub struct CallbackEventListener<F>
where
    F: Fn(SessionEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackEventListener<F>
where
    F: Fn(SessionEvent) + Send + Sync,
{
    #[must_use]
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> SessionEventListener for CallbackEventListener<F>
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: SessionEvent) {
        (self.callback)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_callback_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = CallbackEventListener::new(move |e: SessionEvent| {
            sink.lock().unwrap().push(e);
        });
        let remote = FcId::new(0x020304).unwrap();
        let key = SessionKey::new(FcId::new(0x010000).unwrap(), remote);
        listener.on_event(SessionEvent::LoggedOut { key, remote });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].remote(), remote);
        assert_eq!(seen[0].key(), key);
        assert!(!seen[0].is_failure());
    }
}
