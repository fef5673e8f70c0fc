//! Orchestrator - リクエストからセッションを起動し、最後まで面倒を見る
//!
//! # 責務
//! - セッションごとに `GenerationRunner` を 1 つ spawn する
//! - 必要ならコンテナ（プレビュー）を 1 つ起動する
//! - セッション表（中止用のトークン・現在のステータス）を所有する
//! - 全イベントを forwarder 経由で通知シンクへ流す
//!
//! セッション同士は独立しています。共有するのはポートプールと
//! サーキットブレーカー（どちらも `ContainerManager` の中）だけです。

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::forwarder::EventForwarder;
use super::registry::{AbortOutcome, SessionRegistry};
use crate::config::EngineConfig;
use crate::container::{ContainerHandle, ContainerManager, ContainerRecord, ContainerState};
use crate::domain::errors::{ContainerError, OrchestratorError};
use crate::domain::events::SessionEvent;
use crate::domain::ids::SessionId;
use crate::domain::session::{GenerationMetrics, Session, SessionConfig, SessionStatus};
use crate::generation::{GenerationRunner, RunnerDeps};
use crate::observability::EngineCounts;
use crate::pipeline::PipelineBuilder;
use crate::ports::{Clock, IdGenerator, PersistenceSink, TimelineItem};
use crate::workspace::SandboxedWorkspace;

/// Awaitable handle to a submitted session.
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: SessionId,
    metrics: oneshot::Receiver<GenerationMetrics>,
}

impl SessionTicket {
    /// Final metrics, whatever the outcome.
    pub async fn wait(self) -> Result<GenerationMetrics, OrchestratorError> {
        self.metrics.await.map_err(|_| OrchestratorError::TaskLost)
    }
}

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) pipelines: PipelineBuilder,
    pub(crate) persistence: Arc<dyn PersistenceSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) containers: ContainerManager,
    pub(crate) registry: SessionRegistry,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) forwarder: Mutex<Option<EventForwarder>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Orchestrator はエンジン全体の入口
///
/// `OrchestratorBuilder` で作ります。Clone は同じインスタンスを指します。
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sessions", &self.inner.registry.len())
            .field("containers", &self.inner.containers)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start a session and return immediately.
    ///
    /// Errors here mean the session never started. Once started, every
    /// outcome (including failure and cancellation) arrives through the ticket.
    pub async fn submit(
        &self,
        prompt: impl Into<String>,
        config: SessionConfig,
    ) -> Result<SessionTicket, OrchestratorError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let pipeline = inner
            .pipelines
            .build(&config)
            .map_err(|e| OrchestratorError::InvalidSessionConfig(e.to_string()))?;

        let session_id = inner.ids.generate_session_id();
        let preview = config.preview;
        let session = Session::new(session_id, prompt, config, inner.clock.now());
        let span = tracing::info_span!("session", session_id = %session_id);

        let workspace = SandboxedWorkspace::open(
            &inner.config.workspace,
            session_id,
            inner.persistence.clone(),
            Some(inner.events.clone()),
        )
        .await?;
        let workspace_path = workspace.root().to_path_buf();

        if let Err(e) = inner.persistence.create_session(&session).await {
            tracing::warn!(parent: &span, error = %e, "session record not created");
            self.emit(SessionEvent::Warning {
                session_id,
                message: format!("session record not created: {e}"),
            });
        }

        let steps = pipeline.step_names().join(",");
        let cancel = inner.shutdown.child_token();
        let runner = GenerationRunner::new(
            session,
            pipeline,
            workspace,
            RunnerDeps {
                persistence: inner.persistence.clone(),
                clock: inner.clock.clone(),
                events: inner.events.clone(),
            },
            cancel.clone(),
            inner.config.generation.timeout(),
        );
        inner
            .registry
            .insert(session_id, cancel, runner.subscribe(), workspace_path);
        tracing::info!(parent: &span, %steps, "session submitted");

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let task = async move {
            let metrics = runner.run().await;
            let completed = metrics.status == SessionStatus::Completed;
            if tx.send(metrics).is_err() {
                tracing::debug!("ticket dropped before completion");
            }
            if preview && completed {
                this.start_preview(session_id).await;
            }
        };
        self.track(tokio::spawn(task.instrument(span)));

        Ok(SessionTicket {
            session_id,
            metrics: rx,
        })
    }

    /// Submit and wait for the final metrics.
    pub async fn run(
        &self,
        prompt: impl Into<String>,
        config: SessionConfig,
    ) -> Result<GenerationMetrics, OrchestratorError> {
        self.submit(prompt, config).await?.wait().await
    }

    /// Ask a session to stop. Repeated calls, and calls after the session
    /// finished, change nothing.
    pub fn abort(&self, session_id: SessionId) -> Result<AbortOutcome, OrchestratorError> {
        let outcome = self
            .inner
            .registry
            .abort(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        if outcome == AbortOutcome::Signalled {
            tracing::info!(%session_id, "session abort requested");
        }
        Ok(outcome)
    }

    pub fn status(&self, session_id: SessionId) -> Option<SessionStatus> {
        self.inner.registry.status(session_id)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.inner.registry.active()
    }

    pub async fn timeline(&self, session_id: SessionId) -> Result<Vec<TimelineItem>, OrchestratorError> {
        Ok(self.inner.persistence.get_timeline_items(session_id).await?)
    }

    pub fn counts(&self) -> EngineCounts {
        let mut counts = EngineCounts {
            pending: 0,
            generating: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            live_containers: self.inner.containers.live_count(),
            leased_ports: self.inner.containers.leased_ports(),
            breaker: self.inner.containers.breaker_state(),
        };
        for status in self.inner.registry.statuses() {
            match status {
                SessionStatus::Pending => counts.pending += 1,
                SessionStatus::Generating => counts.generating += 1,
                SessionStatus::Completed => counts.completed += 1,
                SessionStatus::Failed => counts.failed += 1,
                SessionStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// The session's live container, if any.
    pub fn container(&self, session_id: SessionId) -> Option<ContainerHandle> {
        self.inner.containers.get(session_id)
    }

    /// Create the session's container. At most one live container per session.
    pub fn launch_container(&self, session_id: SessionId) -> Result<ContainerHandle, OrchestratorError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let not_found = || OrchestratorError::SessionNotFound(session_id.to_string());
        let workspace_path: PathBuf = inner.registry.workspace_path(session_id).ok_or_else(not_found)?;
        // Aborting the session tears the container down. A finished session
        // ignores abort, so its preview lives until destroy or shutdown.
        let cancel = inner.registry.cancel_token(session_id).ok_or_else(not_found)?;

        inner
            .containers
            .launch(
                session_id,
                workspace_path,
                inner.events.clone(),
                cancel.child_token(),
            )
            .map_err(|e| match e {
                ContainerError::AlreadyActive => {
                    OrchestratorError::ContainerAlreadyActive(session_id.to_string())
                }
                other => OrchestratorError::Container(other),
            })
    }

    /// Send `DESTROY` to the session's container.
    pub fn destroy_container(&self, session_id: SessionId) -> Result<(), OrchestratorError> {
        let handle = self
            .container(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        handle.destroy();
        Ok(())
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.inner.containers
    }

    /// Abort every session, destroy every container and wait for all of it.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        tracing::info!(sessions = inner.registry.active().len(), "orchestrator shutting down");

        let tasks: Vec<_> = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "session task panicked");
            }
        }
        for handle in inner.containers.handles() {
            handle.wait_released().await;
        }

        let forwarder = inner.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.drain_and_stop().await;
        }
        tracing::info!("orchestrator stopped");
    }

    /// create → install → start → running, after a successful generation.
    async fn start_preview(&self, session_id: SessionId) {
        let handle = match self.launch_container(session_id) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "preview not started");
                return;
            }
        };

        let result: Result<ContainerRecord, ContainerError> = async {
            let record = handle.wait_until_ready().await?;
            if record.state != ContainerState::Ready {
                return Ok(record);
            }
            handle.install_deps()?;
            handle.wait_until_running().await
        }
        .await;

        match result {
            Ok(record) if record.state == ContainerState::Running => {
                tracing::info!(url = ?record.preview_url(), "preview running");
            }
            Ok(record) => {
                tracing::warn!(state = record.state.name(), error = ?record.state.error(), "preview did not start");
            }
            Err(e) => tracing::warn!(error = %e, "preview supervisor lost"),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::trace!("event channel closed");
        }
    }
}
