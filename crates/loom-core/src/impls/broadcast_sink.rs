//! BroadcastEventSink - tokio broadcast による通知シンク
//!
//! 購読者がいないときの `send` 失敗は `NotifyError::NoSubscribers` になります。
//! 遅い購読者は古いイベントを取りこぼします（`RecvError::Lagged`）。

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::errors::NotifyError;
use crate::domain::events::SessionEvent;
use crate::ports::EventSink;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: SessionEvent) -> Result<(), NotifyError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::SessionId;
    use ulid::Ulid;

    fn event() -> SessionEvent {
        SessionEvent::FileUpdated {
            session_id: SessionId::from_ulid(Ulid::new()),
            path: "index.html".to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let sink = BroadcastEventSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        let e = event();

        sink.emit(e.clone()).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), e);
        assert_eq!(b.recv().await.unwrap(), e);
    }

    #[tokio::test]
    async fn no_subscribers_is_reported() {
        let sink = BroadcastEventSink::new(8);
        assert_eq!(sink.emit(event()).await, Err(NotifyError::NoSubscribers));
    }
}
