//! GenerationRunner - 生成ライフサイクルの副作用ランナー
//!
//! `machine::transition` に従って状態を進め、作業状態ではパイプラインの
//! 該当ステージを実行します。どの経路でも `completing*` を通るので、
//! 最終メトリクスの永続化と終端イベントの送信は必ず 1 回だけ行われます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::machine::{GenerationEvent, GenerationState, transition};
use crate::domain::context::CapabilityContext;
use crate::domain::errors::PipelineError;
use crate::domain::events::SessionEvent;
use crate::domain::session::{GenerationMetrics, Session, SessionMetrics, SessionStatus};
use crate::pipeline::{CapabilityPipeline, Stage};
use crate::ports::{Clock, PersistenceSink, SessionUpdate};
use crate::redaction::sanitize_error_message;
use crate::workspace::SandboxedWorkspace;

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct RunnerDeps {
    pub persistence: Arc<dyn PersistenceSink>,
    pub clock: Arc<dyn Clock>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

pub struct GenerationRunner {
    session: Session,
    pipeline: CapabilityPipeline,
    workspace: SandboxedWorkspace,
    deps: RunnerDeps,
    cancel: CancellationToken,
    timeout: Duration,

    state: GenerationState,
    ctx: CapabilityContext,
    deadline: Option<Instant>,
    status: watch::Sender<SessionStatus>,
    persistence_warning: bool,
}

impl GenerationRunner {
    pub fn new(
        session: Session,
        pipeline: CapabilityPipeline,
        workspace: SandboxedWorkspace,
        deps: RunnerDeps,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Self {
        let ctx = CapabilityContext::new(
            session.id,
            session.prompt.clone(),
            workspace.root().to_path_buf(),
            session.created_at,
            cancel.clone(),
        );
        let (status, _) = watch::channel(session.status);
        Self {
            session,
            pipeline,
            workspace,
            deps,
            cancel,
            timeout,
            state: GenerationState::Idle,
            ctx,
            deadline: None,
            status,
            persistence_warning: false,
        }
    }

    /// Follow the session status while the runner works.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Drive the session to a terminal state. Never fails: the outcome is in
    /// the returned metrics.
    pub async fn run(mut self) -> GenerationMetrics {
        self.apply(GenerationEvent::Start).await;
        while !self.state.is_terminal() {
            let event = self.next_event().await;
            self.apply(event).await;
        }

        let mut metrics = GenerationMetrics::from_session(&self.session);
        metrics.persistence_warning = self.persistence_warning;
        metrics
    }

    async fn next_event(&mut self) -> GenerationEvent {
        match self.state {
            GenerationState::Initializing => match self.run_stage(Stage::Prepare).await {
                Ok(()) => GenerationEvent::Initialized {
                    template: self.pipeline.has_stage(Stage::Template),
                },
                Err(event) => event,
            },
            GenerationState::LoadingTemplate => match self.run_stage(Stage::Template).await {
                Ok(()) => GenerationEvent::TemplateLoaded,
                Err(event) => event,
            },
            GenerationState::CodeGenerating => match self.run_stage(Stage::Generate).await {
                Ok(()) => GenerationEvent::CodeGenerated,
                Err(event) => event,
            },
            GenerationState::Completing
            | GenerationState::CompletingFailed { .. }
            | GenerationState::CompletingCancelled => {
                self.finish().await;
                GenerationEvent::Finished
            }
            // Start is always accepted from idle; anything else here is a no-op.
            _ => GenerationEvent::Abort,
        }
    }

    /// One pipeline stage raced against abort and the generation timeout.
    /// An interrupted step is dropped; its usage is not counted.
    async fn run_stage(&mut self, stage: Stage) -> Result<(), GenerationEvent> {
        if self.cancel.is_cancelled() {
            return Err(GenerationEvent::Abort);
        }
        let deadline = *self
            .deadline
            .get_or_insert_with(|| Instant::now() + self.timeout);
        let timeout = self.timeout;

        let Self {
            pipeline,
            ctx,
            workspace,
            cancel,
            ..
        } = self;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationEvent::Abort),
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(?stage, "generation timed out");
                Err(GenerationEvent::TimedOut { error: timeout_message(timeout) })
            }
            result = pipeline.execute_stage(stage, ctx, workspace) => match result {
                Ok(report) => {
                    tracing::debug!(?stage, executed = ?report.executed, skipped = ?report.skipped, "stage done");
                    Ok(())
                }
                Err(PipelineError::Cancelled) => Err(GenerationEvent::Abort),
                Err(e) => Err(GenerationEvent::StepFailed { error: e.to_string() }),
            },
        }
    }

    async fn apply(&mut self, event: GenerationEvent) {
        let Some(next) = transition(&self.state, &event) else {
            tracing::debug!(state = self.state.name(), ?event, "event ignored");
            return;
        };
        let prev = std::mem::replace(&mut self.state, next);
        tracing::debug!(from = prev.name(), to = self.state.name(), "generation transition");

        match &self.state {
            GenerationState::Initializing => {
                let now = self.deps.clock.now();
                self.ctx.started_at = now;
                self.session.mark_generating(now);
                self.deadline = Some(Instant::now() + self.timeout);
                self.publish(SessionStatus::Generating, None);
            }
            state if state.is_terminal() => {
                self.deadline = None;
                let status = state.status();
                let message = self.session.error_message.clone();
                tracing::info!(
                    status = %status,
                    total_tokens = self.ctx.tokens.total(),
                    steps = self.ctx.steps_completed,
                    "generation finished"
                );
                self.publish(status, message);
            }
            _ => {}
        }
    }

    /// Final bookkeeping, shared by success, failure and cancellation.
    async fn finish(&mut self) {
        let now = self.deps.clock.now();
        let (status, error) = match &self.state {
            GenerationState::Completing => (SessionStatus::Completed, None),
            GenerationState::CompletingFailed { error } => {
                (SessionStatus::Failed, Some(error.clone()))
            }
            _ => (SessionStatus::Cancelled, None),
        };
        if let Some(error) = &error {
            tracing::warn!(%error, "generation failed");
        }

        let elapsed = (now - self.ctx.started_at).num_milliseconds();
        let metrics = SessionMetrics {
            tokens: self.ctx.tokens,
            cost_usd: self.ctx.cost_usd,
            tool_calls: self.ctx.tool_calls,
            steps_completed: self.ctx.steps_completed,
            duration_ms: u64::try_from(elapsed).unwrap_or(0),
        };
        let error_message = error.as_deref().map(sanitize_error_message);
        self.session
            .finish(status, metrics.clone(), error_message.clone(), now);

        let update = SessionUpdate {
            status,
            metrics,
            error_message,
            updated_at: now,
        };
        if let Err(e) = self.deps.persistence.update_session(self.session.id, update).await {
            tracing::warn!(error = %e, "persisting final metrics failed");
            self.persistence_warning = true;
            self.emit(SessionEvent::Warning {
                session_id: self.session.id,
                message: format!("final metrics may be unreliable: {e}"),
            });
        }
    }

    fn publish(&self, status: SessionStatus, message: Option<String>) {
        self.status.send_replace(status);
        self.emit(SessionEvent::StatusChanged {
            session_id: self.session.id,
            status,
            message,
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.deps.events.send(event).is_err() {
            tracing::trace!("event channel closed");
        }
    }
}

fn timeout_message(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("Generation timed out after {} minutes", secs / 60)
    } else {
        format!("Generation timed out after {secs} seconds")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::domain::context::CapabilityResult;
    use crate::domain::session::{SessionConfig, TokenUsage};
    use crate::impls::InMemoryPersistence;
    use crate::pipeline::PipelineBuilder;
    use crate::ports::{GenerationService, StepRequest, SystemClock};
    use crate::domain::ids::SessionId;
    use async_trait::async_trait;
    use chrono::Utc;
    use ulid::Ulid;

    /// Generation takes `delay`, then reports fixed usage.
    struct Slow {
        delay: Duration,
    }

    #[async_trait]
    impl GenerationService for Slow {
        async fn run(&self, _request: StepRequest<'_>) -> CapabilityResult {
            tokio::time::sleep(self.delay).await;
            CapabilityResult::success().with_usage(TokenUsage::new(100, 50), 0.002, 3)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        runner: GenerationRunner,
        persistence: Arc<InMemoryPersistence>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        cancel: CancellationToken,
    }

    async fn fixture(delay: Duration, timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(InMemoryPersistence::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SessionId::from_ulid(Ulid::new());
        let session = Session::new(id, "todo app", SessionConfig::default(), Utc::now());
        persistence.create_session(&session).await.unwrap();

        let workspace = SandboxedWorkspace::open(
            &WorkspaceConfig {
                base_dir: dir.path().to_path_buf(),
                templates_dir: dir.path().join("templates"),
                allowed_templates: vec![],
            },
            id,
            persistence.clone(),
            Some(tx.clone()),
        )
        .await
        .unwrap();
        let pipeline = PipelineBuilder::new(Arc::new(Slow { delay }))
            .build(&session.config)
            .unwrap();
        let cancel = CancellationToken::new();
        let runner = GenerationRunner::new(
            session,
            pipeline,
            workspace,
            RunnerDeps {
                persistence: persistence.clone(),
                clock: Arc::new(SystemClock),
                events: tx,
            },
            cancel.clone(),
            timeout,
        );
        Fixture {
            _dir: dir,
            runner,
            persistence,
            events: rx,
            cancel,
        }
    }

    fn statuses(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionStatus> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StatusChanged { status, .. } = event {
                out.push(status);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn completes_and_persists_once() {
        let mut f = fixture(Duration::from_secs(1), Duration::from_secs(900)).await;
        let status = f.runner.subscribe();

        let metrics = f.runner.run().await;

        assert_eq!(metrics.status, SessionStatus::Completed);
        assert_eq!(metrics.total_tokens, 150);
        assert_eq!(metrics.tool_calls, 3);
        assert!(!metrics.persistence_warning);
        assert_eq!(*status.borrow(), SessionStatus::Completed);
        assert_eq!(
            statuses(&mut f.events),
            vec![SessionStatus::Generating, SessionStatus::Completed]
        );
        let stored = f.persistence.session(metrics.session_id).unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(f.persistence.update_count(metrics.session_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_session() {
        let mut f = fixture(Duration::from_secs(3600), Duration::from_secs(120)).await;

        let metrics = f.runner.run().await;

        assert_eq!(metrics.status, SessionStatus::Failed);
        assert_eq!(
            metrics.error_message.as_deref(),
            Some("Generation timed out after 2 minutes")
        );
        assert_eq!(metrics.total_tokens, 0);
        assert_eq!(statuses(&mut f.events).last(), Some(&SessionStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_step_cancels() {
        let f = fixture(Duration::from_secs(30), Duration::from_secs(900)).await;
        let cancel = f.cancel.clone();
        let task = tokio::spawn(f.runner.run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        cancel.cancel();
        let metrics = task.await.unwrap();

        assert_eq!(metrics.status, SessionStatus::Cancelled);
        assert_eq!(metrics.total_tokens, 0);
        assert_eq!(metrics.error_message, None);
        assert_eq!(f.persistence.update_count(metrics.session_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_degrades_to_warning() {
        let mut f = fixture(Duration::from_millis(10), Duration::from_secs(900)).await;
        f.persistence.fail_updates(true);

        let metrics = f.runner.run().await;

        assert_eq!(metrics.status, SessionStatus::Completed);
        assert!(metrics.persistence_warning);
        let mut saw_warning = false;
        while let Ok(event) = f.events.try_recv() {
            saw_warning |= matches!(event, SessionEvent::Warning { .. });
        }
        assert!(saw_warning);
    }

    #[test]
    fn timeout_messages() {
        assert_eq!(
            timeout_message(Duration::from_secs(900)),
            "Generation timed out after 15 minutes"
        );
        assert_eq!(
            timeout_message(Duration::from_secs(45)),
            "Generation timed out after 45 seconds"
        );
    }
}
