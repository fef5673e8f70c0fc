//! Events - セッション単位のドメインイベント
//!
//! 各ステートマシンは `SessionEvent` をチャネルに流すだけで、
//! 配送（通知シンクへの fan-out）は forwarder が担当します。

use serde::{Deserialize, Serialize};

use super::ids::SessionId;
use super::session::SessionStatus;
use crate::redaction::sanitize_error_message;

/// Coarse container status shown to subscribers.
///
/// Several internal lifecycle states collapse into one value here
/// (e.g. start, wait-for-dev-server and HTTP check all report `Starting`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Idle,
    Creating,
    Ready,
    Installing,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ContainerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerStatus::Stopped | ContainerStatus::Failed)
    }
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    System,
}

/// Build lifecycle markers detected in dev-server output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildEvent {
    /// The dev server reported that it is listening.
    Ready,
    /// The dev server reported an error or a failed build.
    Error { message: String },
}

/// An event scoped to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        session_id: SessionId,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ContainerStatusChanged {
        session_id: SessionId,
        status: ContainerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Log {
        session_id: SessionId,
        source: LogSource,
        line: String,
    },
    Build {
        session_id: SessionId,
        event: BuildEvent,
    },
    FileUpdated {
        session_id: SessionId,
        path: String,
    },
    /// Something degraded without failing the session (e.g. metrics could not be persisted).
    Warning {
        session_id: SessionId,
        message: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::StatusChanged { session_id, .. }
            | SessionEvent::ContainerStatusChanged { session_id, .. }
            | SessionEvent::Log { session_id, .. }
            | SessionEvent::Build { session_id, .. }
            | SessionEvent::FileUpdated { session_id, .. }
            | SessionEvent::Warning { session_id, .. } => *session_id,
        }
    }

    /// Copy of this event with every error-bearing field sanitized for
    /// untrusted subscribers. Log lines are dev-server output and pass through.
    pub fn sanitized(&self) -> SessionEvent {
        match self {
            SessionEvent::StatusChanged {
                session_id,
                status,
                message,
            } => SessionEvent::StatusChanged {
                session_id: *session_id,
                status: *status,
                message: message.as_deref().map(sanitize_error_message),
            },
            SessionEvent::ContainerStatusChanged {
                session_id,
                status,
                error,
            } => SessionEvent::ContainerStatusChanged {
                session_id: *session_id,
                status: *status,
                error: error.as_deref().map(sanitize_error_message),
            },
            SessionEvent::Build {
                session_id,
                event: BuildEvent::Error { message },
            } => SessionEvent::Build {
                session_id: *session_id,
                event: BuildEvent::Error {
                    message: sanitize_error_message(message),
                },
            },
            SessionEvent::Warning {
                session_id,
                message,
            } => SessionEvent::Warning {
                session_id: *session_id,
                message: sanitize_error_message(message),
            },
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn event_is_tagged_by_type() {
        let id = SessionId::from_ulid(Ulid::new());
        let event = SessionEvent::FileUpdated {
            session_id: id,
            path: "src/main.tsx".to_string(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "file_updated");
        assert_eq!(v["path"], "src/main.tsx");
    }

    #[test]
    fn sanitized_strips_internal_paths() {
        let id = SessionId::from_ulid(Ulid::new());
        let event = SessionEvent::StatusChanged {
            session_id: id,
            status: SessionStatus::Failed,
            message: Some("failed to write /var/lib/loom/workspaces/abc/src/x.ts".to_string()),
        };

        let SessionEvent::StatusChanged { message, .. } = event.sanitized() else {
            panic!("variant changed");
        };
        let message = message.unwrap();
        assert!(message.contains("failed to write"));
        assert!(!message.contains("/var/lib/loom"));
    }

    #[test]
    fn container_terminal_statuses() {
        assert!(ContainerStatus::Stopped.is_terminal());
        assert!(ContainerStatus::Failed.is_terminal());
        assert!(!ContainerStatus::Running.is_terminal());
    }
}
