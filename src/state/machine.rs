//! Core state machine implementation
//!
//! Validates transitions between session states, tracks how long each
//! state was held and emits a `StateChanged` event for every transition.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::events::SessionEvent;

/// The possible states of an audio session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no transport yet
    Idle,
    /// Connection attempt in flight
    Connecting,
    /// Transport open, not capturing
    Connected,
    /// Capture active
    Recording,
    /// Capture stopped, finalizing outgoing audio
    Flushing,
    /// Outgoing audio sent, waiting for the server
    AwaitingResponse,
    /// A non-empty artifact is available
    Ready,
    /// Closed by the owner (terminal)
    Closed,
    /// Failed with a cause (terminal)
    Failed,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Recording => write!(f, "Recording"),
            SessionState::Flushing => write!(f, "Flushing"),
            SessionState::AwaitingResponse => write!(f, "AwaitingResponse"),
            SessionState::Ready => write!(f, "Ready"),
            SessionState::Closed => write!(f, "Closed"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

impl SessionState {
    /// Closed and Failed admit no further transitions except Failed -> Closed
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Capture is running
    pub fn is_recording(&self) -> bool {
        matches!(self, SessionState::Recording)
    }

    /// Something is pending that the UI would show as loading
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Flushing | SessionState::AwaitingResponse
        )
    }

    /// A playable result exists
    pub fn has_result(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    /// Whether `self -> next` is an edge of the session lifecycle
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        match (*self, next) {
            (Closed, _) => false,
            (Failed, Closed) => true,
            (Failed, _) => false,
            (_, Closed) | (_, Failed) => true,
            (Idle, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Recording) => true,
            // Manual resend of retained capture skips Recording
            (Connected, Flushing) => true,
            (Recording, Flushing) => true,
            (Flushing, AwaitingResponse) => true,
            (AwaitingResponse, Ready) => true,
            (Ready, Connected) => true,
            _ => false,
        }
    }
}

/// Owns the current state of one session and broadcasts its transitions
pub struct StateMachine {
    session_id: Uuid,
    /// Current state
    state: SessionState,
    /// Time when the current state was entered
    state_entered_at: Instant,
    /// Cause of the most recent failure
    last_error: Option<SessionError>,
    /// Channel for emitting session events
    event_tx: broadcast::Sender<SessionEvent>,
}

impl StateMachine {
    /// Create a new state machine in Idle
    pub fn new(session_id: Uuid, event_tx: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            state_entered_at: Instant::now(),
            last_error: None,
            event_tx,
        }
    }

    /// Get the current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Cause of the failure, if the session is Failed
    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Emit an event to subscribers; having none is fine
    pub fn emit(&self, event: SessionEvent) {
        debug!(session_id = %self.session_id, %event, "emitting event");
        let _ = self.event_tx.send(event);
    }

    /// Perform a state transition, rejecting edges the lifecycle does not have
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<()> {
        let old_state = self.state;
        if old_state == new_state {
            return Ok(());
        }
        if !old_state.can_transition_to(new_state) {
            warn!(
                session_id = %self.session_id,
                from = %old_state,
                to = %new_state,
                "rejected state transition"
            );
            return Err(SessionError::InvalidState {
                operation: "transition",
                state: old_state,
            });
        }

        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;

        info!(
            session_id = %self.session_id,
            from = %old_state,
            to = %new_state,
            duration_ms = duration_ms,
            "state transition"
        );

        self.state = new_state;
        self.state_entered_at = Instant::now();

        self.emit(SessionEvent::StateChanged {
            from: old_state,
            to: new_state,
            duration_ms,
        });

        Ok(())
    }

    /// Move to Failed, recording the cause. No-op when already terminal.
    pub fn fail(&mut self, cause: SessionError) {
        if self.state.is_terminal() {
            debug!(session_id = %self.session_id, %cause, "ignoring failure in terminal state");
            return;
        }

        warn!(session_id = %self.session_id, state = %self.state, %cause, "session failed");
        self.last_error = Some(cause.clone());
        // Every non-terminal state has an edge to Failed
        let _ = self.transition_to(SessionState::Failed);
        self.emit(SessionEvent::Failed {
            code: cause.code().to_string(),
            message: cause.to_string(),
        });
    }
}
