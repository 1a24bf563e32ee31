//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::session::SessionSnapshot;

/// Requests from a local client to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request service status and the current session, if any
    GetStatus,

    /// Replace the current session with a new one and connect it
    Open {
        #[serde(default)]
        endpoint: Option<String>,
    },

    StartCapture,

    StopCapture,

    /// Send the capture a replaced session left unsent
    Resend,

    /// Release the artifact and return to Connected
    Discard,

    /// Upload the current artifact
    Persist,

    /// Close the current session
    Close,

    /// Subscribe to session event notifications
    Subscribe,
}

/// Responses from the service to a client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,

    Status(ServiceStatus),

    /// The request was carried out
    Ok,

    /// Subscription confirmed
    Subscribed,

    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn no_session() -> Self {
        Self::error("no_session", "no session is open")
    }
}

impl From<SessionError> for Response {
    fn from(error: SessionError) -> Self {
        Self::error(error.code(), error.to_string())
    }
}

/// Push notification for subscribed clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Something happened to the current session
    Event { event: SessionEvent },

    /// Events were dropped for this client; resume from this snapshot
    Resync {
        skipped: u64,
        session: Option<SessionSnapshot>,
    },
}

/// Service status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: String,

    /// Uptime in seconds
    pub uptime_secs: u64,

    pub session: Option<SessionSnapshot>,

    /// Fragments waiting for a resend
    pub retained_fragments: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;

    #[test]
    fn test_request_serialization() {
        let req = Request::Open {
            endpoint: Some("ws://host/ws/audio".to_string()),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"open\""));
        assert!(json.contains("ws://host/ws/audio"));
    }

    #[test]
    fn test_open_endpoint_is_optional() {
        let req: Request = serde_json::from_str(r#"{"type":"open"}"#).unwrap();
        assert_eq!(req, Request::Open { endpoint: None });

        let req: Request = serde_json::from_str(r#"{"type":"start_capture"}"#).unwrap();
        assert_eq!(req, Request::StartCapture);

        let req: Request = serde_json::from_str(r#"{"type":"resend"}"#).unwrap();
        assert_eq!(req, Request::Resend);
    }

    #[test]
    fn test_error_response_carries_code() {
        let resp = Response::from(SessionError::AlreadyInProgress("capture"));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "already_in_progress");
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Status(ServiceStatus {
            version: "0.1.0".to_string(),
            uptime_secs: 3,
            session: None,
            retained_fragments: 0,
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["uptime_secs"], 3);
        assert!(json["session"].is_null());
    }

    #[test]
    fn test_notification_nests_event() {
        let note = Notification::Event {
            event: SessionEvent::StateChanged {
                from: SessionState::Connected,
                to: SessionState::Recording,
                duration_ms: 12,
            },
        };
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["type"], "state_changed");
        assert_eq!(json["event"]["to"], "recording");
    }

    #[test]
    fn test_resync_without_session() {
        let note = Notification::Resync {
            skipped: 4,
            session: None,
        };
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["type"], "resync");
        assert_eq!(json["skipped"], 4);
        assert!(json["session"].is_null());
    }
}
