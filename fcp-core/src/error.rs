use thiserror::Error;

/// Main error type for FC/FCoE initiator operations
#[derive(Error, Debug)]
pub enum FcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame invalid: {0}")]
    FrameInvalid(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Timeout")]
    Timeout,

    #[error("No ready session to {0}")]
    NoSession(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Request rejected: reason {reason:#04x}, explanation {explanation:#04x}")]
    Rejected { reason: u8, explanation: u8 },

    #[error("Operation aborted")]
    Aborted,

    #[error("Task management failed: {0}")]
    TmfFailed(String),

    #[error("LUN {0} is degraded")]
    LunDegraded(String),

    #[error("Closed")]
    Closed,
}

impl FcError {
    /// Whether the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FcError::ResourceExhausted(_) | FcError::NoSession(_) | FcError::Timeout
        )
    }
}

/// Result type alias for FC/FCoE initiator operations
pub type FcResult<T> = Result<T, FcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FcError::ResourceExhausted("xid".into()).is_retryable());
        assert!(FcError::NoSession("0x010203".into()).is_retryable());
        assert!(!FcError::Aborted.is_retryable());
        assert!(
            !FcError::Rejected {
                reason: 0x0b,
                explanation: 0
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display() {
        let err = FcError::Rejected {
            reason: 0x09,
            explanation: 0x2a,
        };
        assert_eq!(err.to_string(), "Request rejected: reason 0x09, explanation 0x2a");
    }
}
