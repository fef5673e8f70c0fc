#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use loom_core::config::EngineConfig;
use loom_core::domain::{CapabilityResult, ContainerId, EngineError, SessionId, TokenUsage};
use loom_core::impls::{BroadcastEventSink, InMemoryPersistence};
use loom_core::ports::{
    ContainerEngine, ContainerSpec, GenerationService, HttpProbe, LogLine, LogStream, ProbeError,
    StepKind, StepRequest,
};
use loom_core::{Orchestrator, OrchestratorBuilder};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

pub fn kind_name(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Planning => "planning",
        StepKind::Generation { .. } => "generation",
        StepKind::Validation => "validation",
        StepKind::Refinement { .. } => "refinement",
    }
}

pub fn usage(input: u64, output: u64, cost: f64, tool_calls: u32) -> CapabilityResult {
    CapabilityResult::success().with_usage(TokenUsage::new(input, output), cost, tool_calls)
}

/// Answers each step kind from a script. Kinds in `hold` never answer.
#[derive(Default)]
pub struct ScriptedGeneration {
    answers: Mutex<HashMap<&'static str, VecDeque<CapabilityResult>>>,
    hold: Mutex<Vec<&'static str>>,
    pub calls: Mutex<Vec<&'static str>>,
    pub step_done: Notify,
    writes: Mutex<Vec<(String, String)>>,
}

impl ScriptedGeneration {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(self: &Arc<Self>, kind: &'static str, result: CapabilityResult) -> Arc<Self> {
        self.answers.lock().entry(kind).or_default().push_back(result);
        self.clone()
    }

    pub fn hold(self: &Arc<Self>, kind: &'static str) -> Arc<Self> {
        self.hold.lock().push(kind);
        self.clone()
    }

    /// Generation writes this file through the workspace.
    pub fn write(self: &Arc<Self>, path: &str, content: &str) -> Arc<Self> {
        self.writes.lock().push((path.to_string(), content.to_string()));
        self.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl GenerationService for ScriptedGeneration {
    async fn run(&self, request: StepRequest<'_>) -> CapabilityResult {
        let kind = kind_name(request.kind);
        self.calls.lock().push(kind);
        if self.hold.lock().contains(&kind) {
            return std::future::pending().await;
        }

        if kind == "generation" {
            let writes = self.writes.lock().clone();
            for (path, content) in writes {
                if let Err(e) = request.workspace.write_file(&path, content.as_bytes()).await {
                    return CapabilityResult::failure(e.to_string());
                }
            }
        }

        let result = self
            .answers
            .lock()
            .get_mut(kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(CapabilityResult::success);
        self.step_done.notify_one();
        result
    }
}

/// Container engine with scripted `create` results.
#[derive(Default)]
pub struct FakeEngine {
    pub create_script: Mutex<VecDeque<Result<(), EngineError>>>,
    /// Once the script runs out, fail every create with this message.
    pub fail_creates: Mutex<Option<String>>,
    pub create_calls: AtomicU32,
    pub dev_server_lines: Mutex<Vec<LogLine>>,
    log_tx: Mutex<Vec<mpsc::Sender<LogLine>>>,
    pub removed: Mutex<Vec<ContainerId>>,
}

impl FakeEngine {
    pub fn creates(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn vite_ready(&self) {
        self.dev_server_lines
            .lock()
            .push(LogLine::stdout("  VITE v5.0.0  ready in 312 ms"));
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, _spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.create_script.lock().pop_front();
        match scripted {
            Some(Err(e)) => Err(e),
            Some(Ok(())) => Ok(ContainerId::new(format!("c{n}"))),
            None => match self.fail_creates.lock().clone() {
                Some(msg) => Err(EngineError::CommandFailed(msg)),
                None => Ok(ContainerId::new(format!("c{n}"))),
            },
        }
    }

    async fn install_dependencies(&self, _id: &ContainerId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start_dev_server(&self, _id: &ContainerId) -> Result<LogStream, EngineError> {
        let (tx, rx) = mpsc::channel(64);
        for line in self.dev_server_lines.lock().iter() {
            let _ = tx.try_send(line.clone());
        }
        self.log_tx.lock().push(tx);
        Ok(rx)
    }

    async fn stop_dev_server(&self, _id: &ContainerId) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stop(&self, _id: &ContainerId, _grace: Duration) -> Result<(), EngineError> {
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.removed.lock().push(id.clone());
        Ok(())
    }
}

/// Answers every probe with a fixed status.
pub struct FixedStatusProbe(pub u16);

#[async_trait]
impl HttpProbe for FixedStatusProbe {
    async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, ProbeError> {
        Ok(self.0)
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub orchestrator: Orchestrator,
    pub generation: Arc<ScriptedGeneration>,
    pub engine: Arc<FakeEngine>,
    pub persistence: Arc<InMemoryPersistence>,
    pub sink: BroadcastEventSink,
}

pub fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workspace.base_dir = dir.path().join("workspaces");
    config.workspace.templates_dir = dir.path().join("templates");
    config
}

pub fn harness(generation: Arc<ScriptedGeneration>) -> Harness {
    harness_with(generation, Arc::new(FakeEngine::default()))
}

pub fn harness_with(generation: Arc<ScriptedGeneration>, engine: Arc<FakeEngine>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(InMemoryPersistence::new());
    let sink = BroadcastEventSink::new(4096);
    let orchestrator = OrchestratorBuilder::new(test_config(&dir))
        .generation(generation.clone())
        .persistence(persistence.clone())
        .event_sink(Arc::new(sink.clone()))
        .container_engine(engine.clone())
        .http_probe(Arc::new(FixedStatusProbe(503)))
        .build()
        .unwrap();
    Harness {
        dir,
        orchestrator,
        generation,
        engine,
        persistence,
        sink,
    }
}

/// Wait until the preview container for `session_id` shows up.
pub async fn container_for(
    orchestrator: &Orchestrator,
    session_id: SessionId,
) -> loom_core::container::ContainerHandle {
    for _ in 0..1000 {
        if let Some(handle) = orchestrator.container(session_id) {
            return handle;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no container for {session_id}");
}

/// Receive events until `pred` matches one, or give up after a quiet second.
pub async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<loom_core::domain::SessionEvent>,
    mut pred: impl FnMut(&loom_core::domain::SessionEvent) -> bool,
) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return true,
            Ok(Ok(_)) | Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(_)) | Err(_) => return false,
        }
    }
}
