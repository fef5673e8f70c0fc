//! Domain model (ids, session, context, events, errors).
//!
//! ここにある型はどれも I/O を持ちません。状態遷移と副作用は
//! `pipeline` / `generation` / `container` 側が扱います。

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod session;

pub use self::context::{
    ArchitecturePlan, CapabilityContext, CapabilityResult, ContextUpdates, ValidationOutcome,
};
pub use self::errors::{
    ConfigError, ContainerError, EngineError, ErrorKind, NotifyError, OrchestratorError,
    PersistenceError, PipelineError, PortAllocationError, WorkspaceError,
};
pub use self::events::{BuildEvent, ContainerStatus, LogSource, SessionEvent};
pub use self::ids::{ContainerId, SessionId};
pub use self::session::{
    GenerationMetrics, InputMode, Session, SessionConfig, SessionMetrics, SessionStatus,
    TokenUsage,
};
