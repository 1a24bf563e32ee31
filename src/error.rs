//! Session error taxonomy
//!
//! Every failure a session can report to its caller or carry in a
//! `Failed` state. Variants hold owned strings so errors can be cloned
//! into snapshots and events.

use crate::state::SessionState;

/// Errors produced by an audio session and its collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("no audio input device available: {0}")]
    DeviceUnavailable(String),

    #[error("failed to connect to {endpoint}: {message}")]
    ConnectionError { endpoint: String, message: String },

    #[error("transport is closed")]
    TransportClosed,

    #[error("{0} is already in progress")]
    AlreadyInProgress(&'static str),

    #[error("protocol violation in {state}: {message}")]
    ProtocolViolation { state: SessionState, message: String },

    #[error("audio capture failed: {0}")]
    CaptureFailure(String),

    #[error("no response within {timeout_ms}ms")]
    ResponseTimeout { timeout_ms: u64 },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("no artifact available")]
    NoArtifact,

    #[error("no retained capture to resend")]
    NothingToResend,

    #[error("failed to persist artifact: {0}")]
    PersistFailed(String),

    #[error("session task has stopped")]
    SessionGone,
}

impl SessionError {
    /// Short machine-readable code, used in IPC error responses
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::PermissionDenied(_) => "permission_denied",
            SessionError::DeviceUnavailable(_) => "device_unavailable",
            SessionError::ConnectionError { .. } => "connection_error",
            SessionError::TransportClosed => "transport_closed",
            SessionError::AlreadyInProgress(_) => "already_in_progress",
            SessionError::ProtocolViolation { .. } => "protocol_violation",
            SessionError::CaptureFailure(_) => "capture_failure",
            SessionError::ResponseTimeout { .. } => "response_timeout",
            SessionError::InvalidState { .. } => "invalid_state",
            SessionError::NoArtifact => "no_artifact",
            SessionError::NothingToResend => "nothing_to_resend",
            SessionError::PersistFailed(_) => "persist_failed",
            SessionError::SessionGone => "session_gone",
        }
    }

    /// Whether the caller can recover by re-opening and re-sending the
    /// buffered capture
    pub fn is_retry_required(&self) -> bool {
        matches!(self, SessionError::TransportClosed)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
