//! DockerCliEngine - `docker` CLI を使うコンテナエンジン
//!
//! デーモン API ではなく CLI を `tokio::process` で呼びます。
//! stderr の内容から一時的な競合（名前・ポートの使用中）を判別し、
//! `EngineError::Conflict` として返します。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::domain::errors::EngineError;
use crate::domain::ids::ContainerId;
use crate::ports::{ContainerEngine, ContainerSpec, LogLine, LogStream};

const LOG_CHANNEL_CAPACITY: usize = 256;

const CONFLICT_MARKERS: &[&str] = &[
    "Conflict",
    "is already in use",
    "port is already allocated",
    "address already in use",
];

#[derive(Debug, Clone)]
pub struct DockerCliEngine {
    cli: String,
    dev_port: u16,
}

impl DockerCliEngine {
    pub fn new(dev_port: u16) -> Self {
        Self {
            cli: "docker".to_string(),
            dev_port,
        }
    }

    /// Use another docker-compatible CLI (e.g. `podman`).
    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    async fn run(&self, args: &[String]) -> Result<String, EngineError> {
        tracing::debug!(cli = %self.cli, ?args, "engine command");
        let output = Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(%stderr, status = ?output.status.code(), "engine command failed");
            return Err(classify_failure(&stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerEngine for DockerCliEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let id = self.run(&create_args(spec)).await?;
        if id.is_empty() {
            return Err(EngineError::CommandFailed(
                "docker run printed no container id".to_string(),
            ));
        }
        Ok(ContainerId::new(id))
    }

    async fn install_dependencies(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(&strings(&["exec", id.as_str(), "npm", "install", "--no-audit", "--no-fund"]))
            .await
            .map(|_| ())
    }

    async fn start_dev_server(&self, id: &ContainerId) -> Result<LogStream, EngineError> {
        let port = self.dev_port.to_string();
        let mut child = Command::new(&self.cli)
            .args([
                "exec",
                id.as_str(),
                "npm",
                "run",
                "dev",
                "--",
                "--host",
                "0.0.0.0",
                "--port",
                port.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let container = id.clone();

        tokio::spawn(async move {
            let out = forward_lines(stdout, tx.clone(), LogLine::stdout);
            let err = forward_lines(stderr, tx, LogLine::stderr);
            tokio::join!(out, err);
            match child.wait().await {
                Ok(status) => tracing::debug!(container_id = %container, ?status, "dev server exited"),
                Err(e) => tracing::warn!(container_id = %container, error = %e, "dev server wait failed"),
            }
        });

        Ok(rx)
    }

    async fn stop_dev_server(&self, id: &ContainerId) -> Result<(), EngineError> {
        match self
            .run(&strings(&["exec", id.as_str(), "pkill", "-f", "vite"]))
            .await
        {
            Ok(_) => Ok(()),
            // pkill exits 1 when nothing matched.
            Err(EngineError::CommandFailed(msg)) if msg.is_empty() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), EngineError> {
        let grace = grace.as_secs().to_string();
        self.run(&strings(&["stop", "-t", &grace, id.as_str()]))
            .await
            .map(|_| ())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError> {
        match self.run(&strings(&["rm", "-f", id.as_str()])).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

/// `docker run` arguments. The container idles until the dev server is exec'd.
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = strings(&["run", "-d", "--name"]);
    args.push(spec.name.clone());
    args.push("--memory".to_string());
    args.push(format!("{}m", spec.memory_limit_mb));
    args.push("--cpus".to_string());
    args.push(format!("{}", spec.cpus));
    for binding in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", binding.host, binding.container));
    }
    args.push("-v".to_string());
    args.push(format!("{}:/app", spec.workspace_path.display()));
    args.extend(strings(&["-w", "/app"]));
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(strings(&["sleep", "infinity"]));
    args
}

fn classify_failure(stderr: &str) -> EngineError {
    let message = stderr.trim().to_string();
    if CONFLICT_MARKERS.iter().any(|m| message.contains(m)) {
        EngineError::Conflict(message)
    } else if message.contains("No such container") {
        EngineError::NotFound(message)
    } else {
        EngineError::CommandFailed(message)
    }
}

async fn forward_lines<R>(
    reader: Option<R>,
    tx: mpsc::Sender<LogLine>,
    wrap: fn(String) -> LogLine,
) where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(wrap(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "dev server output read failed");
                break;
            }
        }
    }
}
