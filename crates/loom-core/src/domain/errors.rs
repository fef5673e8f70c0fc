//! Errors - エラー型と分類
//!
//! 関心ごとに `thiserror` の enum を分け、運用上の分類は
//! [`ErrorKind`] に集約します。呼び出し側は `kind()` で分類だけを見て
//! リトライ可否やステータスを決めます。

use std::path::PathBuf;

use thiserror::Error;

/// ErrorKind はエラーの運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A step's context prerequisites are unmet.
    Validation,
    /// A step reported failure.
    StepExecution,
    /// Retryable conflict reported by the container engine.
    TransientConflict,
    /// Container creation gave up (retries exhausted or breaker open).
    CreationExhausted,
    /// A state timer fired before the operation resolved.
    StateTimeout,
    /// Readiness polling ran out of attempts.
    HealthCheckExhausted,
    /// Cooperative abort.
    Cancelled,
    /// Filesystem, persistence, transport or engine plumbing failure.
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientConflict)
    }
}

/// WorkspaceError はサンドボックス境界とファイル I/O のエラー
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path rejected: {path:?} ({reason})")]
    PathRejected { path: String, reason: &'static str },

    #[error("path escapes workspace: {0}")]
    Escapes(PathBuf),

    #[error("template not allowed: {0:?}")]
    TemplateNotAllowed(String),

    #[error("template not found: {0:?}")]
    TemplateNotFound(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("workspace io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file persisted locally but sink rejected it: {0}")]
    Persistence(#[from] PersistenceError),
}

impl WorkspaceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkspaceError::PathRejected { .. }
            | WorkspaceError::Escapes(_)
            | WorkspaceError::TemplateNotAllowed(_)
            | WorkspaceError::TemplateNotFound(_)
            | WorkspaceError::NotFound(_) => ErrorKind::Validation,
            WorkspaceError::Io { .. } | WorkspaceError::Persistence(_) => {
                ErrorKind::Infrastructure
            }
        }
    }
}

/// EngineError はコンテナエンジン呼び出しのエラー
#[derive(Debug, Error)]
pub enum EngineError {
    /// Name or port already taken; usually clears on its own.
    #[error("engine conflict: {0}")]
    Conflict(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("engine command failed: {0}")]
    CommandFailed(String),

    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::TransientConflict
        } else {
            ErrorKind::Infrastructure
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortAllocationError {
    #[error("port range {start}-{end} exhausted")]
    Exhausted { start: u16, end: u16 },
}

/// ContainerError はコンテナライフサイクル全体のエラー
///
/// `Display` の文言はそのままイベントやログに出ます。
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container creation rejected: circuit breaker open")]
    CircuitOpen,

    #[error("container creation failed after {attempts} attempt(s): {source}")]
    CreationExhausted {
        attempts: u32,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Ports(#[from] PortAllocationError),

    #[error("{0}")]
    Timeout(String),

    #[error("Dev server did not answer HTTP after {attempts} attempts")]
    HealthCheckExhausted { attempts: u32 },

    #[error("Dev server exited before becoming ready")]
    DevServerExited,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("container lifecycle cancelled")]
    Cancelled,

    #[error("session already has a live container")]
    AlreadyActive,

    #[error("container supervisor is gone")]
    SupervisorGone,
}

impl ContainerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContainerError::CircuitOpen
            | ContainerError::CreationExhausted { .. }
            | ContainerError::Ports(_) => ErrorKind::CreationExhausted,
            ContainerError::Timeout(_) => ErrorKind::StateTimeout,
            ContainerError::HealthCheckExhausted { .. } => ErrorKind::HealthCheckExhausted,
            ContainerError::Engine(e) => e.kind(),
            ContainerError::Cancelled => ErrorKind::Cancelled,
            ContainerError::AlreadyActive => ErrorKind::Validation,
            ContainerError::DevServerExited | ContainerError::SupervisorGone => {
                ErrorKind::Infrastructure
            }
        }
    }
}

/// PipelineError は 1 ステップの失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("step {step} cannot run: {message}")]
    Validation { step: String, message: String },

    #[error("step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation { .. } => ErrorKind::Validation,
            PipelineError::StepFailed { .. } => ErrorKind::StepExecution,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            PipelineError::Validation { step, .. } | PipelineError::StepFailed { step, .. } => {
                Some(step)
            }
            PipelineError::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("no subscribers")]
    NoSubscribers,

    #[error("notification transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// OrchestratorError は呼び出し側に返るエラー
///
/// セッションの失敗そのものはエラーではなく `GenerationMetrics` で返ります。
/// ここに来るのはセッションを開始できなかったケースだけです。
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} already has a live container")]
    ContainerAlreadyActive(String),

    #[error("invalid session config: {0}")]
    InvalidSessionConfig(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("session task ended without reporting metrics")]
    TaskLost,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::SessionNotFound(_)
            | OrchestratorError::ContainerAlreadyActive(_)
            | OrchestratorError::InvalidSessionConfig(_) => ErrorKind::Validation,
            OrchestratorError::Workspace(e) => e.kind(),
            OrchestratorError::Container(e) => e.kind(),
            OrchestratorError::ShuttingDown => ErrorKind::Cancelled,
            OrchestratorError::Persistence(_) | OrchestratorError::TaskLost => {
                ErrorKind::Infrastructure
            }
        }
    }
}
