//! ContainerEngine port - コンテナエンジンの抽象化
//!
//! 本番は docker CLI、テストは台本どおりに振る舞う fake を使います。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::errors::EngineError;
use crate::domain::events::LogSource;
use crate::domain::ids::ContainerId;

/// Host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

/// Everything the engine needs to create one isolated runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Bind-mounted into the runtime.
    pub workspace_path: PathBuf,
    pub memory_limit_mb: u64,
    pub cpus: f64,
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub labels: Vec<(String, String)>,
}

/// One line of dev-server output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub source: LogSource,
    pub line: String,
}

impl LogLine {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            source: LogSource::Stdout,
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            source: LogSource::Stderr,
            line: line.into(),
        }
    }
}

/// Dev-server output. Closes when the process exits.
pub type LogStream = mpsc::Receiver<LogLine>;

/// ContainerEngine は 1 コンテナの操作を提供
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull/create and start the runtime. Conflicts surface as `EngineError::Conflict`.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

    async fn install_dependencies(&self, id: &ContainerId) -> Result<(), EngineError>;

    /// Launch the dev server and hand back its output stream.
    async fn start_dev_server(&self, id: &ContainerId) -> Result<LogStream, EngineError>;

    async fn stop_dev_server(&self, id: &ContainerId) -> Result<(), EngineError>;

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), EngineError>;

    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError>;
}
