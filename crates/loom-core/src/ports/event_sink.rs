//! EventSink port - 通知の抽象化
//!
//! コアは emit するだけで、購読側から読むことはありません。
//! 実際の送信は app::forwarder が一箇所で行います。

use async_trait::async_trait;

use crate::domain::errors::NotifyError;
use crate::domain::events::SessionEvent;

/// EventSink はセッションイベントを購読者へ配る
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: SessionEvent) -> Result<(), NotifyError>;
}

/// NoopEventSink は何もしない
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: SessionEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}
