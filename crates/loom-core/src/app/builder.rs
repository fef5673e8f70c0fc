//! OrchestratorBuilder - オーケストレーターの構築とワイヤリング
//!
//! 生成サービスだけは必須です。それ以外のポートは省略すると
//! 開発用のデフォルト実装になります。設定は build() 時に検証します（Fail-fast）。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::forwarder::EventForwarder;
use super::orchestrator::{Inner, Orchestrator};
use super::registry::SessionRegistry;
use crate::config::EngineConfig;
use crate::container::ContainerManager;
use crate::domain::errors::ConfigError;
use crate::impls::{DockerCliEngine, InMemoryPersistence, ReqwestProbe};
use crate::pipeline::PipelineBuilder;
use crate::ports::{
    Clock, ContainerEngine, EventSink, GenerationService, HttpProbe, IdGenerator, NoopEventSink,
    PersistenceSink, SystemClock, UlidGenerator,
};

/// BuildError はオーケストレーター構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("a generation service is required")]
    MissingGenerationService,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot build HTTP probe client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// # 使用例
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new(EngineConfig::default())
///     .generation(Arc::new(MyService))
///     .event_sink(Arc::new(sink))
///     .build()?;
/// let metrics = orchestrator.run("a todo app", SessionConfig::default()).await?;
/// ```
///
/// `build()` spawns the event forwarder, so call it inside a tokio runtime.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    generation: Option<Arc<dyn GenerationService>>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    event_sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    engine: Option<Arc<dyn ContainerEngine>>,
    probe: Option<Arc<dyn HttpProbe>>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            generation: None,
            persistence: None,
            event_sink: None,
            clock: None,
            ids: None,
            engine: None,
            probe: None,
        }
    }

    pub fn generation(mut self, service: Arc<dyn GenerationService>) -> Self {
        self.generation = Some(service);
        self
    }

    pub fn persistence(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = Some(sink);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn container_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn http_probe(mut self, probe: Arc<dyn HttpProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        let generation = self.generation.ok_or(BuildError::MissingGenerationService)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryPersistence::with_clock(clock.clone())));
        let event_sink = self.event_sink.unwrap_or_else(|| Arc::new(NoopEventSink));
        let engine = self.engine.unwrap_or_else(|| {
            Arc::new(DockerCliEngine::new(self.config.container.client_container_port))
        });
        let probe: Arc<dyn HttpProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(ReqwestProbe::new()?),
        };

        let (events, rx) = mpsc::unbounded_channel();
        let forwarder = EventForwarder::spawn(rx, event_sink);
        let pipelines = PipelineBuilder::new(generation)
            .refinement_budget(self.config.generation.refinement_tool_budget);
        let containers = ContainerManager::new(&self.config, engine, probe, clock.clone());
        let registry = SessionRegistry::with_retention(self.config.generation.retained_sessions);

        Ok(Orchestrator::from_inner(Inner {
            config: self.config,
            pipelines,
            persistence,
            clock,
            ids,
            containers,
            registry,
            events,
            forwarder: Mutex::new(Some(forwarder)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::CapabilityResult;
    use crate::ports::StepRequest;
    use async_trait::async_trait;

    struct Nothing;

    #[async_trait]
    impl GenerationService for Nothing {
        async fn run(&self, _request: StepRequest<'_>) -> CapabilityResult {
            CapabilityResult::success()
        }
    }

    #[tokio::test]
    async fn build_requires_generation_service() {
        let result = OrchestratorBuilder::new(EngineConfig::default()).build();
        assert!(matches!(result, Err(BuildError::MissingGenerationService)));
    }

    #[tokio::test]
    async fn build_validates_config() {
        let mut config = EngineConfig::default();
        config.logs.prune_threshold = config.logs.max_entries;

        let result = OrchestratorBuilder::new(config)
            .generation(Arc::new(Nothing))
            .build();

        assert!(matches!(result, Err(BuildError::Config(ConfigError::Invalid { .. }))));
    }

    #[tokio::test]
    async fn build_with_defaults() {
        let orchestrator = OrchestratorBuilder::new(EngineConfig::default())
            .generation(Arc::new(Nothing))
            .build()
            .unwrap();
        let counts = orchestrator.counts();
        assert_eq!(counts.live_containers, 0);
        assert_eq!(counts.leased_ports, 0);
    }
}
