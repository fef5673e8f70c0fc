//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。コアが外部の協力者
//! （生成サービス、永続化、通知、コンテナエンジン、HTTP）に求める
//! 契約だけを trait として定義します。実装は `impls` とテストの fake にあります。

pub mod clock;
pub mod container_engine;
pub mod event_sink;
pub mod generation;
pub mod http_probe;
pub mod id_generator;
pub mod persistence;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::container_engine::{ContainerEngine, ContainerSpec, LogLine, LogStream, PortBinding};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::generation::{GenerationMode, GenerationService, StepKind, StepRequest};
pub use self::http_probe::{HttpProbe, ProbeError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::persistence::{PersistenceSink, SessionUpdate, TimelineEntry, TimelineItem};
