//! Events module for session observation
//!
//! Every state transition, artifact change and non-fatal warning a
//! session produces is broadcast as a `SessionEvent` so a UI layer can
//! render status without polling.

use serde::{Deserialize, Serialize};

use crate::state::SessionState;

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session moved between states
    StateChanged {
        from: SessionState,
        to: SessionState,
        /// Milliseconds spent in `from`
        duration_ms: u64,
    },

    /// Capture began producing fragments
    CaptureStarted,

    /// Capture stopped and its last fragment was observed
    CaptureStopped {
        fragments: usize,
        bytes: usize,
    },

    /// A streamed fragment went out on the transport
    FragmentSent {
        index: usize,
        bytes: usize,
    },

    /// A streamed fragment was dropped because the transport was not open
    FragmentDropped {
        index: usize,
        bytes: usize,
    },

    /// The whole buffered utterance went out as one payload
    PayloadSent {
        fragments: usize,
        bytes: usize,
    },

    /// The artifact was rebuilt from the inbound chunks
    ArtifactUpdated {
        generation: u64,
        chunks: usize,
        bytes: usize,
    },

    /// A previous artifact was released
    ArtifactReleased {
        generation: u64,
    },

    /// An inbound message arrived in a state that does not accept one
    ProtocolViolation {
        state: SessionState,
        message: String,
    },

    /// The transport went away underneath the session
    TransportLost,

    /// The session failed; the state has already moved to Failed
    Failed {
        code: String,
        message: String,
    },
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::StateChanged { from, to, duration_ms } => {
                write!(f, "STATE_CHANGED {} -> {} ({}ms)", from, to, duration_ms)
            }
            SessionEvent::CaptureStarted => write!(f, "CAPTURE_STARTED"),
            SessionEvent::CaptureStopped { fragments, bytes } => {
                write!(f, "CAPTURE_STOPPED ({} fragments, {} bytes)", fragments, bytes)
            }
            SessionEvent::FragmentSent { index, bytes } => {
                write!(f, "FRAGMENT_SENT #{} ({} bytes)", index, bytes)
            }
            SessionEvent::FragmentDropped { index, bytes } => {
                write!(f, "FRAGMENT_DROPPED #{} ({} bytes)", index, bytes)
            }
            SessionEvent::PayloadSent { fragments, bytes } => {
                write!(f, "PAYLOAD_SENT ({} fragments, {} bytes)", fragments, bytes)
            }
            SessionEvent::ArtifactUpdated { generation, chunks, bytes } => {
                write!(
                    f,
                    "ARTIFACT_UPDATED gen {} ({} chunks, {} bytes)",
                    generation, chunks, bytes
                )
            }
            SessionEvent::ArtifactReleased { generation } => {
                write!(f, "ARTIFACT_RELEASED gen {}", generation)
            }
            SessionEvent::ProtocolViolation { state, message } => {
                write!(f, "PROTOCOL_VIOLATION in {}: {}", state, message)
            }
            SessionEvent::TransportLost => write!(f, "TRANSPORT_LOST"),
            SessionEvent::Failed { code, message } => write!(f, "FAILED {}: {}", code, message),
        }
    }
}
