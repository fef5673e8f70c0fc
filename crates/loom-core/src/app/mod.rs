//! App - アプリケーション層
//!
//! ports と各ステートマシンを組み合わせて、セッション単位の処理を動かします。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: ポートのワイヤリングと起動時検証
//! - **Orchestrator**: セッションの起動・中止・照会・シャットダウン
//! - **SessionRegistry**: オーケストレーターが所有するセッション表
//! - **EventForwarder**: イベントのサニタイズと通知シンクへの配送

pub mod builder;
pub mod forwarder;
pub mod orchestrator;
pub mod registry;

pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::forwarder::EventForwarder;
pub use self::orchestrator::{Orchestrator, SessionTicket};
pub use self::registry::{AbortOutcome, SessionRegistry};
