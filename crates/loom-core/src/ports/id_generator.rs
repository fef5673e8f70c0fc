//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + 乱数の ULID（本番用）

use crate::domain::ids::SessionId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はセッション ID を生成
///
/// `Send + Sync` を要求（複数のセッションタスクから使う）
pub trait IdGenerator: Send + Sync {
    fn generate_session_id(&self) -> SessionId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡すと timestamp 部分が固定されます。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_session_id(&self) -> SessionId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        SessionId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
