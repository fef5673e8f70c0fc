//! Impls - ports の実装
//!
//! - **InMemoryPersistence**: 開発用・テスト用の永続化シンク
//! - **BroadcastEventSink**: tokio broadcast による通知シンク
//! - **DockerCliEngine**: `docker` CLI によるコンテナエンジン
//! - **ReqwestProbe**: reqwest による HTTP 到達確認

pub mod broadcast_sink;
pub mod docker;
pub mod http_probe;
pub mod inmem_persistence;

pub use self::broadcast_sink::BroadcastEventSink;
pub use self::docker::DockerCliEngine;
pub use self::http_probe::ReqwestProbe;
pub use self::inmem_persistence::InMemoryPersistence;
