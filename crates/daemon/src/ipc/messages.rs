//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types exchanged between the
//! CLI (or any local observer) and the daemon over Unix Domain Sockets.

use serde::{Deserialize, Serialize};

use crate::session::{
    BroadcastReport, DriverParams, RoomEvent, SessionError, SessionId, SessionSummary,
};

/// Requests that can be sent to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List every registered session.
    ListSessions,
    /// Create the session if needed and start it.
    StartSession {
        session_id: SessionId,
        params: DriverParams,
    },
    /// Replace the session with a fresh one and start it.
    RestartSession {
        session_id: SessionId,
        params: DriverParams,
    },
    /// Stop a session, keeping its history.
    StopSession { session_id: SessionId },
    /// Stop and forget a session.
    TerminateSession { session_id: SessionId },
    /// Send one line of input to a session.
    SendInput { session_id: SessionId, text: String },
    /// Send lines to several sessions. `None` targets every session.
    Broadcast {
        targets: Option<Vec<SessionId>>,
        inputs: Vec<String>,
    },
    /// Fetch a session's filtered output history.
    GetHistory { session_id: SessionId },
    /// Join the session's room. The connection then streams `Event`s.
    Attach {
        session_id: SessionId,
        /// Observer name; generated when absent.
        client_id: Option<String>,
    },
}

/// Responses sent from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        running: bool,
        uptime_secs: u64,
        session_count: usize,
        capacity: usize,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    Sessions { sessions: Vec<SessionSummary> },
    SessionStarted { session: SessionSummary },
    SessionStopped { session_id: SessionId },
    SessionTerminated { session_id: SessionId },
    InputSent { session_id: SessionId },
    Broadcasted { report: BroadcastReport },
    History {
        session_id: SessionId,
        chunks: Vec<String>,
    },
    /// The connection joined a room; events follow.
    Attached {
        session_id: SessionId,
        client_id: String,
    },
    /// Something happened in an attached room.
    Event { event: RoomEvent },
    /// An error occurred processing the request.
    Error { kind: IpcErrorKind, message: String },
}

impl IpcResponse {
    pub fn error(kind: IpcErrorKind, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SessionError> for IpcResponse {
    fn from(error: &SessionError) -> Self {
        IpcResponse::error(IpcErrorKind::from(error), error.to_string())
    }
}

/// Error categories carried over IPC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IpcErrorKind {
    AuthenticationFailed,
    CapacityExceeded,
    UnknownSession,
    InactiveSession,
    AlreadyActive,
    DriverIo,
    SpawnFailed,
    /// The request could not be parsed.
    InvalidRequest,
    /// The daemon is shutting down or hit an internal failure.
    Internal,
}

impl From<&SessionError> for IpcErrorKind {
    fn from(error: &SessionError) -> Self {
        match error {
            SessionError::AuthenticationFailed(_) => IpcErrorKind::AuthenticationFailed,
            SessionError::CapacityExceeded { .. } => IpcErrorKind::CapacityExceeded,
            SessionError::UnknownSession(_) => IpcErrorKind::UnknownSession,
            SessionError::InactiveSession(_) => IpcErrorKind::InactiveSession,
            SessionError::AlreadyActive(_) => IpcErrorKind::AlreadyActive,
            SessionError::DriverIo(_) => IpcErrorKind::DriverIo,
            SessionError::SpawnFailed(_) => IpcErrorKind::SpawnFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DriverKind, SessionState};

    #[test]
    fn test_unit_requests_serialize_as_strings() {
        for (request, expected) in [
            (IpcRequest::Ping, r#""Ping""#),
            (IpcRequest::Status, r#""Status""#),
            (IpcRequest::Stop, r#""Stop""#),
            (IpcRequest::ListSessions, r#""ListSessions""#),
        ] {
            let json = serde_json::to_string(&request).unwrap();
            assert_eq!(json, expected);
            let parsed: IpcRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn test_start_session_request_from_json() {
        let json = r#"{"StartSession":{"session_id":"build","params":{"kind":"local","command":"/bin/sh"}}}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();

        assert_eq!(
            request,
            IpcRequest::StartSession {
                session_id: "build".to_string(),
                params: DriverParams::local("/bin/sh"),
            }
        );
    }

    #[test]
    fn test_broadcast_request_to_all() {
        let json = r#"{"Broadcast":{"targets":null,"inputs":["uptime"]}}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();

        assert_eq!(
            request,
            IpcRequest::Broadcast {
                targets: None,
                inputs: vec!["uptime".to_string()],
            }
        );
    }

    #[test]
    fn test_attach_request_without_client_id() {
        let json = r#"{"Attach":{"session_id":"x","client_id":null}}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            IpcRequest::Attach {
                session_id: "x".to_string(),
                client_id: None,
            }
        );
    }

    #[test]
    fn test_error_response_shape() {
        let error = SessionError::CapacityExceeded { capacity: 2 };
        let response = IpcResponse::from(&error);
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains(r#""kind":"capacity_exceeded""#));
        assert!(json.contains("capacity exceeded"));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            IpcErrorKind::from(&SessionError::InactiveSession("x".to_string())),
            IpcErrorKind::InactiveSession
        );
        assert_eq!(
            IpcErrorKind::from(&SessionError::AuthenticationFailed("denied".to_string())),
            IpcErrorKind::AuthenticationFailed
        );
        assert_eq!(
            IpcErrorKind::from(&SessionError::UnknownSession("x".to_string())),
            IpcErrorKind::UnknownSession
        );
    }

    #[test]
    fn test_sessions_response_roundtrip() {
        let response = IpcResponse::Sessions {
            sessions: vec![SessionSummary {
                id: "a".to_string(),
                state: SessionState::Active,
                kind: DriverKind::Remote,
                driver: "remote:ops@example.org".to_string(),
                created_at: 1_700_000_000,
                history_chunks: 3,
                output_closed: false,
            }],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""state":"active""#));
        let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_event_response_embeds_room_event() {
        let response = IpcResponse::Event {
            event: RoomEvent::Output {
                session_id: "a".to_string(),
                chunk: "hi<br>".to_string(),
            },
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            r#"{"Event":{"event":{"event":"output","session_id":"a","chunk":"hi<br>"}}}"#
        );
    }
}
