//! loom-core
//!
//! Orchestration engine that turns a natural-language request into a running
//! web application inside a disposable container.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, session, context, events, errors）
//! - **ports**: 外部協力者の抽象（生成サービス、永続化、通知、コンテナエンジン、HTTP、時計、ID）
//! - **pipeline**: 生成ステップ（Capability）の順序付き実行
//! - **generation**: 生成ライフサイクルのステートマシンとランナー
//! - **container**: コンテナライフサイクルのステートマシン、ポート・ログ・ヘルスチェック
//! - **resilience**: RetryPolicy と CircuitBreaker
//! - **workspace**: セッション単位のファイル境界
//! - **app**: Orchestrator とそのワイヤリング
//! - **impls**: ports の実装（in-memory, broadcast, docker CLI, reqwest）
//! - **config** / **redaction** / **observability**

pub mod app;
pub mod config;
pub mod container;
pub mod domain;
pub mod generation;
pub mod impls;
pub mod observability;
pub mod pipeline;
pub mod ports;
pub mod redaction;
pub mod resilience;
pub mod workspace;

pub use app::{AbortOutcome, Orchestrator, OrchestratorBuilder, SessionTicket};
pub use config::EngineConfig;
pub use domain::errors::{ErrorKind, OrchestratorError};
pub use domain::session::{GenerationMetrics, InputMode, SessionConfig, SessionStatus};
pub use observability::EngineCounts;
