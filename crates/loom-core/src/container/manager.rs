//! ContainerManager - コンテナライフサイクルの副作用ランナー
//!
//! セッションごとに 1 つの supervisor タスクを spawn し、`machine::transition`
//! の結果に従って状態の entry / exit アクションを実行します。
//!
//! # 実行モデル
//! - 1 状態につき実行中の操作は高々 1 つ（`inflight`）
//! - 操作・コマンド・状態タイマー・ログのうち最初に届いたものでイベントを作る
//! - 実行中の操作は強制中断しない。状態を離れるときに future を drop するだけ
//! - 終端状態に入ったら、ポート・コンテナ・ログバッファを 1 回だけ解放する

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::health::{HealthChecker, HealthOutcome};
use super::logs::LogManager;
use super::machine::{ContainerEvent, ContainerState, transition};
use super::ports_pool::{PortAllocator, PortLease};
use crate::config::{ContainerConfig, EngineConfig};
use crate::domain::errors::{ContainerError, EngineError};
use crate::domain::events::{BuildEvent, ContainerStatus, LogSource, SessionEvent};
use crate::domain::ids::{ContainerId, SessionId};
use crate::ports::{Clock, ContainerEngine, ContainerSpec, HttpProbe, LogLine, LogStream, PortBinding};
use crate::resilience::{BreakerState, CircuitBreaker, RetryPolicy};

/// Extra time allowed on top of the stop grace period during teardown.
const TEARDOWN_SLACK: Duration = Duration::from_secs(5);

/// External requests accepted by a live container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerCommand {
    InstallDeps,
    StopServer,
    Destroy,
}

/// Observable snapshot of one container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerRecord {
    pub session_id: SessionId,
    pub state: ContainerState,
    pub container_id: Option<ContainerId>,
    pub ports: Option<PortLease>,
    pub creation_attempts: u32,
    pub created_at: Option<DateTime<Utc>>,
    /// Set once every owned resource has been returned.
    pub released: bool,
}

impl ContainerRecord {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: ContainerState::Idle,
            container_id: None,
            ports: None,
            creation_attempts: 0,
            created_at: None,
            released: false,
        }
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.status()
    }

    pub fn preview_url(&self) -> Option<String> {
        self.ports.map(|p| format!("http://127.0.0.1:{}/", p.client_port))
    }
}

/// Cloneable handle to one container's supervisor.
#[derive(Clone)]
pub struct ContainerHandle {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<ContainerCommand>,
    record: watch::Receiver<ContainerRecord>,
    logs: Arc<LogManager>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("session_id", &self.session_id)
            .field("record", &*self.record.borrow())
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn record(&self) -> ContainerRecord {
        self.record.borrow().clone()
    }

    pub fn status(&self) -> ContainerStatus {
        self.record.borrow().status()
    }

    pub fn install_deps(&self) -> Result<(), ContainerError> {
        self.send(ContainerCommand::InstallDeps)
    }

    pub fn stop_server(&self) -> Result<(), ContainerError> {
        self.send(ContainerCommand::StopServer)
    }

    /// Route to `stopped`. Destroying a finished container is a no-op.
    pub fn destroy(&self) {
        let _ = self.commands.send(ContainerCommand::Destroy);
    }

    fn send(&self, command: ContainerCommand) -> Result<(), ContainerError> {
        self.commands
            .send(command)
            .map_err(|_| ContainerError::SupervisorGone)
    }

    /// Up to `n` most recent log lines, oldest first. Empty once released.
    pub fn recent_logs(&self, n: usize) -> Vec<LogLine> {
        self.logs.recent(self.session_id, n)
    }

    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&ContainerRecord) -> bool,
    ) -> Result<ContainerRecord, ContainerError> {
        let mut rx = self.record.clone();
        let record = rx
            .wait_for(|r| pred(r))
            .await
            .map_err(|_| ContainerError::SupervisorGone)?;
        Ok(record.clone())
    }

    /// Resolves at `ready` or at a terminal state.
    pub async fn wait_until_ready(&self) -> Result<ContainerRecord, ContainerError> {
        self.wait_for(|r| r.state == ContainerState::Ready || r.state.is_terminal())
            .await
    }

    /// Resolves at `running` or at a terminal state.
    pub async fn wait_until_running(&self) -> Result<ContainerRecord, ContainerError> {
        self.wait_for(|r| r.state == ContainerState::Running || r.state.is_terminal())
            .await
    }

    /// Resolves after teardown has released every resource.
    pub async fn wait_released(&self) -> ContainerRecord {
        match self.wait_for(|r| r.released).await {
            Ok(record) => record,
            Err(_) => self.record(),
        }
    }
}

struct Shared {
    engine: Arc<dyn ContainerEngine>,
    clock: Arc<dyn Clock>,
    ports: PortAllocator,
    breaker: CircuitBreaker,
    logs: Arc<LogManager>,
    health: HealthChecker,
    retry: RetryPolicy,
    config: ContainerConfig,
    live: Mutex<HashMap<SessionId, ContainerHandle>>,
}

/// ContainerManager は全セッションのコンテナを管理
///
/// セッション間で共有されるのはポートプールとサーキットブレーカーだけです。
#[derive(Clone)]
pub struct ContainerManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("live", &self.live_count())
            .field("leased_ports", &self.leased_ports())
            .field("breaker", &self.breaker_state())
            .finish_non_exhaustive()
    }
}

impl ContainerManager {
    pub fn new(
        config: &EngineConfig,
        engine: Arc<dyn ContainerEngine>,
        probe: Arc<dyn HttpProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                clock,
                ports: PortAllocator::from_config(&config.container),
                breaker: CircuitBreaker::from_config(&config.circuit_breaker),
                logs: Arc::new(LogManager::new(config.logs.clone())),
                health: HealthChecker::new(probe, &config.health),
                retry: RetryPolicy::from(&config.retry),
                config: config.container.clone(),
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create the session's container (the `CREATE` event) and supervise it.
    ///
    /// Events go to `events`. Cancelling `cancel` is the same as `DESTROY`.
    pub fn launch(
        &self,
        session_id: SessionId,
        workspace_path: PathBuf,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Result<ContainerHandle, ContainerError> {
        let mut live = self.shared.live.lock();
        if live.contains_key(&session_id) {
            return Err(ContainerError::AlreadyActive);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = watch::channel(ContainerRecord::new(session_id));
        let handle = ContainerHandle {
            session_id,
            commands: commands_tx,
            record: record_rx,
            logs: self.shared.logs.clone(),
        };
        live.insert(session_id, handle.clone());
        drop(live);

        let supervisor = Supervisor {
            session_id,
            workspace_path,
            shared: self.shared.clone(),
            state: ContainerState::Idle,
            record: ContainerRecord::new(session_id),
            record_tx,
            commands: commands_rx,
            commands_open: true,
            events,
            cancel,
            lease: None,
            container: None,
            log_stream: None,
            readiness: None,
            inflight: None,
            deadline: None,
            released: false,
        };
        let span = tracing::info_span!("container", session_id = %session_id);
        tokio::spawn(supervisor.run().instrument(span));

        Ok(handle)
    }

    pub fn get(&self, session_id: SessionId) -> Option<ContainerHandle> {
        self.shared.live.lock().get(&session_id).cloned()
    }

    pub fn handles(&self) -> Vec<ContainerHandle> {
        self.shared.live.lock().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.shared.live.lock().len()
    }

    pub fn leased_ports(&self) -> usize {
        self.shared.ports.in_use()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.shared.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    pub fn logs(&self) -> &LogManager {
        &self.shared.logs
    }
}

type OpFuture = Pin<Box<dyn Future<Output = OpResult> + Send>>;

/// Result of the operation invoked by the current state.
enum OpResult {
    Created { id: ContainerId, attempts: u32 },
    CreateFailed { error: EngineError, attempts: u32 },
    Installed,
    Started(LogStream),
    Healthy { status: u16 },
    Failed(ContainerError),
}

struct Deadline {
    at: Instant,
    on_expiry: ContainerEvent,
}

impl Deadline {
    fn after(duration: Duration, on_expiry: ContainerEvent) -> Self {
        Self {
            at: Instant::now() + duration,
            on_expiry,
        }
    }
}

struct Supervisor {
    session_id: SessionId,
    workspace_path: PathBuf,
    shared: Arc<Shared>,
    state: ContainerState,
    record: ContainerRecord,
    record_tx: watch::Sender<ContainerRecord>,
    commands: mpsc::UnboundedReceiver<ContainerCommand>,
    commands_open: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,

    // Owned resources. Each is taken exactly once.
    lease: Option<PortLease>,
    container: Option<ContainerId>,
    log_stream: Option<LogStream>,
    readiness: Option<CancellationToken>,
    inflight: Option<OpFuture>,
    deadline: Option<Deadline>,
    released: bool,
}

impl Supervisor {
    async fn run(mut self) {
        self.apply(ContainerEvent::Create);
        while !self.state.is_terminal() {
            if let Some(event) = self.next_event().await {
                self.apply(event);
            }
        }
        self.release_resources().await;
    }

    async fn next_event(&mut self) -> Option<ContainerEvent> {
        let deadline_at = self.deadline.as_ref().map(|d| d.at);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(ContainerEvent::Destroy),
            command = self.commands.recv(), if self.commands_open => self.on_command(command).await,
            _ = tokio::time::sleep_until(deadline_at.unwrap_or_else(Instant::now)), if deadline_at.is_some() => {
                self.on_deadline()
            }
            result = poll_inflight(&mut self.inflight) => {
                self.inflight = None;
                self.on_op_result(result)
            }
            line = recv_log(&mut self.log_stream), if self.log_stream.is_some() => self.on_log_line(line),
        }
    }

    /// Run transitions until no follow-up event remains.
    fn apply(&mut self, event: ContainerEvent) {
        let mut pending = Some(event);
        while let Some(event) = pending.take() {
            let Some(next) = transition(&self.state, &event) else {
                tracing::debug!(state = self.state.name(), ?event, "event ignored");
                continue;
            };

            self.exit_state(&next);
            let prev = std::mem::replace(&mut self.state, next);
            tracing::debug!(from = prev.name(), to = self.state.name(), "container transition");

            self.record.state = self.state.clone();
            self.publish();
            if prev.status() != self.state.status() {
                self.emit(SessionEvent::ContainerStatusChanged {
                    session_id: self.session_id,
                    status: self.state.status(),
                    error: self.state.error().map(str::to_string),
                });
            }
            if let Some(error) = self.state.error() {
                tracing::warn!(error, "container failed");
            }

            pending = self.enter_state();
        }
    }

    /// Exit actions shared by every state.
    fn exit_state(&mut self, next: &ContainerState) {
        self.inflight = None;
        self.deadline = None;
        if let Some(token) = self.readiness.take() {
            token.cancel();
        }
        if !next.has_dev_server() {
            self.log_stream = None;
        }
    }

    /// Entry actions. May return an immediate follow-up event.
    fn enter_state(&mut self) -> Option<ContainerEvent> {
        let config = &self.shared.config;
        match self.state {
            ContainerState::Creating => self.enter_creating(),
            ContainerState::Installing => {
                let id = self.container.clone()?;
                let engine = self.shared.engine.clone();
                self.inflight = Some(Box::pin(async move {
                    match engine.install_dependencies(&id).await {
                        Ok(()) => OpResult::Installed,
                        Err(e) => OpResult::Failed(e.into()),
                    }
                }));
                self.deadline = Some(Deadline::after(
                    config.install_timeout(),
                    timeout_event(format!(
                        "Dependency installation timed out after {}s",
                        config.install_timeout_secs
                    )),
                ));
                None
            }
            ContainerState::Starting => {
                let id = self.container.clone()?;
                let engine = self.shared.engine.clone();
                self.inflight = Some(Box::pin(async move {
                    match engine.start_dev_server(&id).await {
                        Ok(stream) => OpResult::Started(stream),
                        Err(e) => OpResult::Failed(e.into()),
                    }
                }));
                self.deadline = Some(Deadline::after(
                    config.start_timeout(),
                    timeout_event(format!(
                        "Dev server start timed out after {}s",
                        config.start_timeout_secs
                    )),
                ));
                None
            }
            ContainerState::WaitingForVite => {
                self.deadline = Some(Deadline::after(
                    config.vite_ready_timeout(),
                    timeout_event("Timeout waiting for Vite to be ready".to_string()),
                ));
                None
            }
            ContainerState::CheckingHttpReady => {
                let Some(url) = self.record.preview_url() else {
                    return Some(ContainerEvent::fail("no port lease for health check"));
                };
                let token = self.cancel.child_token();
                self.readiness = Some(token.clone());
                let health = self.shared.health.clone();
                self.inflight = Some(Box::pin(async move {
                    match health.wait_until_ready(&url, &token).await {
                        HealthOutcome::Ready { status, .. } => OpResult::Healthy { status },
                        HealthOutcome::Exhausted { attempts } => {
                            OpResult::Failed(ContainerError::HealthCheckExhausted { attempts })
                        }
                        HealthOutcome::Cancelled => OpResult::Failed(ContainerError::Cancelled),
                    }
                }));
                None
            }
            ContainerState::Running => {
                tracing::info!(url = ?self.record.preview_url(), "container running");
                self.deadline = Some(Deadline::after(config.max_runtime(), ContainerEvent::Destroy));
                None
            }
            ContainerState::Idle
            | ContainerState::Ready
            | ContainerState::Stopped
            | ContainerState::Failed { .. } => None,
        }
    }

    fn enter_creating(&mut self) -> Option<ContainerEvent> {
        if let Err(open) = self.shared.breaker.try_acquire() {
            tracing::warn!(%open, "container creation rejected");
            return Some(ContainerEvent::fail(ContainerError::CircuitOpen.to_string()));
        }

        let lease = match self.shared.ports.allocate() {
            Ok(lease) => lease,
            Err(e) => return Some(ContainerEvent::fail(ContainerError::from(e).to_string())),
        };
        self.lease = Some(lease);
        self.record.ports = Some(lease);
        self.publish();

        let config = &self.shared.config;
        let spec = ContainerSpec {
            name: format!("loom-{}", self.session_id.as_ulid().to_string().to_lowercase()),
            image: config.image.clone(),
            workspace_path: self.workspace_path.clone(),
            memory_limit_mb: config.memory_limit_mb,
            cpus: config.cpus,
            ports: vec![
                PortBinding {
                    host: lease.client_port,
                    container: config.client_container_port,
                },
                PortBinding {
                    host: lease.server_port,
                    container: config.server_container_port,
                },
            ],
            labels: vec![("loom.session".to_string(), self.session_id.to_string())],
        };

        let engine = self.shared.engine.clone();
        let retry = self.shared.retry.clone();
        let cancel = self.cancel.clone();
        self.inflight = Some(Box::pin(async move {
            let mut attempts = 0;
            let result = retry
                .run(
                    &cancel,
                    EngineError::is_transient,
                    |attempt, error, delay| {
                        tracing::warn!(attempt, %error, ?delay, "container create conflict, retrying");
                    },
                    |attempt| {
                        attempts = attempt;
                        engine.create(&spec)
                    },
                )
                .await;
            match result {
                Ok(id) => OpResult::Created { id, attempts },
                Err(error) => OpResult::CreateFailed { error, attempts },
            }
        }));
        self.deadline = Some(Deadline::after(
            config.creation_timeout(),
            timeout_event(format!(
                "Container creation timed out after {}s",
                config.creation_timeout_secs
            )),
        ));
        None
    }

    async fn on_command(&mut self, command: Option<ContainerCommand>) -> Option<ContainerEvent> {
        match command {
            None => {
                self.commands_open = false;
                None
            }
            Some(ContainerCommand::Destroy) => Some(ContainerEvent::Destroy),
            Some(ContainerCommand::InstallDeps) => Some(ContainerEvent::InstallDeps),
            Some(ContainerCommand::StopServer) => {
                if self.state != ContainerState::Running {
                    tracing::debug!(state = self.state.name(), "stop_server ignored");
                    return None;
                }
                if let Some(id) = &self.container
                    && let Err(e) = self.shared.engine.stop_dev_server(id).await
                {
                    tracing::warn!(error = %e, "stopping dev server failed");
                }
                Some(ContainerEvent::StopServer)
            }
        }
    }

    fn on_deadline(&mut self) -> Option<ContainerEvent> {
        let deadline = self.deadline.take()?;
        tracing::warn!(state = self.state.name(), "state timer fired");
        if self.state == ContainerState::Creating {
            self.shared.breaker.record_failure();
        }
        Some(deadline.on_expiry)
    }

    fn on_op_result(&mut self, result: OpResult) -> Option<ContainerEvent> {
        match result {
            OpResult::Created { id, attempts } => {
                self.shared.breaker.record_success();
                tracing::info!(container_id = %id, attempts, "container created");
                self.container = Some(id.clone());
                self.record.container_id = Some(id);
                self.record.creation_attempts = attempts;
                self.record.created_at = Some(self.shared.clock.now());
                Some(ContainerEvent::Created)
            }
            OpResult::CreateFailed { error, attempts } => {
                self.record.creation_attempts = attempts;
                if !self.cancel.is_cancelled() {
                    self.shared.breaker.record_failure();
                }
                let error = ContainerError::CreationExhausted {
                    attempts,
                    source: error,
                };
                Some(ContainerEvent::fail(error.to_string()))
            }
            OpResult::Installed => Some(ContainerEvent::Installed),
            OpResult::Started(stream) => {
                self.log_stream = Some(stream);
                Some(ContainerEvent::Started)
            }
            OpResult::Healthy { status } => {
                tracing::debug!(status, "dev server answered");
                Some(ContainerEvent::HttpReady)
            }
            OpResult::Failed(ContainerError::Cancelled) => Some(ContainerEvent::Destroy),
            OpResult::Failed(error) => Some(ContainerEvent::fail(error.to_string())),
        }
    }

    fn on_log_line(&mut self, line: Option<LogLine>) -> Option<ContainerEvent> {
        let Some(line) = line else {
            self.log_stream = None;
            if self.state == ContainerState::WaitingForVite {
                return Some(ContainerEvent::fail(ContainerError::DevServerExited.to_string()));
            }
            self.system_log("dev server output closed");
            return None;
        };

        let build = self.shared.logs.append(self.session_id, line.clone());
        self.emit(SessionEvent::Log {
            session_id: self.session_id,
            source: line.source,
            line: line.line,
        });

        let event = build?;
        let ready = event == BuildEvent::Ready;
        self.emit(SessionEvent::Build {
            session_id: self.session_id,
            event,
        });
        (ready && self.state == ContainerState::WaitingForVite).then_some(ContainerEvent::ViteReady)
    }

    /// Terminal-entry cleanup. Runs once; every step tolerates missing resources.
    async fn release_resources(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.inflight = None;
        self.deadline = None;
        self.log_stream = None;
        if let Some(token) = self.readiness.take() {
            token.cancel();
        }

        if let Some(id) = self.container.take() {
            let engine = &self.shared.engine;
            let budget = self.shared.config.stop_grace() + TEARDOWN_SLACK;
            match tokio::time::timeout(budget, engine.stop(&id, self.shared.config.stop_grace())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(container_id = %id, error = %e, "container stop failed"),
                Err(_) => tracing::warn!(container_id = %id, "container stop timed out"),
            }
            if let Err(e) = engine.remove(&id).await {
                tracing::warn!(container_id = %id, error = %e, "container remove failed");
            }
        }
        if let Some(lease) = self.lease.take() {
            self.shared.ports.release(&lease);
        }
        self.shared.logs.remove(self.session_id);
        self.shared.live.lock().remove(&self.session_id);

        self.record.released = true;
        self.publish();
        tracing::info!(state = self.state.name(), "container released");
    }

    fn system_log(&mut self, line: &str) {
        let entry = LogLine {
            source: LogSource::System,
            line: line.to_string(),
        };
        self.shared.logs.append(self.session_id, entry);
        self.emit(SessionEvent::Log {
            session_id: self.session_id,
            source: LogSource::System,
            line: line.to_string(),
        });
    }

    fn publish(&self) {
        self.record_tx.send_replace(self.record.clone());
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("event channel closed");
        }
    }
}

fn timeout_event(message: String) -> ContainerEvent {
    ContainerEvent::fail(ContainerError::Timeout(message).to_string())
}

async fn poll_inflight(slot: &mut Option<OpFuture>) -> OpResult {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn recv_log(stream: &mut Option<LogStream>) -> Option<LogLine> {
    match stream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
