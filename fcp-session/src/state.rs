//! Remote port session state machine

use crate::error::{FcError, FcResult};

/// Login state of a remote port session
///
/// # State Transitions
/// ```text
/// Init -> PlogiPending -> PrliPending -> Ready
/// PlogiPending | PrliPending -> Failed      (reject or timeout)
/// Failed | LoggedOut -> PlogiPending        (login retried)
/// Ready -> LogoPending -> LoggedOut         (local logout)
/// Ready -> LoggedOut                        (remote logout)
/// Ready -> Init                             (host reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Created, login not started
    #[default]
    Init,
    /// PLOGI sent, waiting for the accept
    PlogiPending,
    /// Port login done, PRLI sent
    PrliPending,
    /// Process login done; commands may be issued
    Ready,
    /// LOGO sent
    LogoPending,
    LoggedOut,
    /// Last login attempt was rejected or timed out
    Failed,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    /// A login exchange is in flight.
    pub fn is_logging_in(&self) -> bool {
        matches!(self, SessionState::PlogiPending | SessionState::PrliPending)
    }

    /// Validate state transition
    pub fn validate_transition(&self, new_state: SessionState) -> FcResult<()> {
        use SessionState::*;
        let valid = match (*self, new_state) {
            (Init, PlogiPending) => true,
            (PlogiPending, PrliPending) => true,
            (PrliPending, Ready) => true,
            (PlogiPending | PrliPending, Failed) => true,
            (Failed | LoggedOut, PlogiPending) => true,
            (Ready, LogoPending) => true,
            (LogoPending, LoggedOut) => true,
            (Ready | PlogiPending | PrliPending, LoggedOut) => true,
            (Init | Failed, LoggedOut) => true,
            (Ready, Init) => true,
            (Init, Init) | (Ready, Ready) | (LoggedOut, LoggedOut) | (Failed, Failed) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(FcError::InvalidData(format!(
                "Invalid session state transition: {:?} -> {:?}",
                self, new_state
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "Init",
            SessionState::PlogiPending => "PlogiPending",
            SessionState::PrliPending => "PrliPending",
            SessionState::Ready => "Ready",
            SessionState::LogoPending => "LogoPending",
            SessionState::LoggedOut => "LoggedOut",
            SessionState::Failed => "Failed",
        }
    }
}
