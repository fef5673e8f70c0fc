//! EventForwarder - セッションイベントを通知シンクへ流す
//!
//! ステートマシンはチャネルに送るだけで、トランスポートを知りません。
//! ここで一度だけ受信し、エラー文言をサニタイズしてからシンクへ渡します。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::NotifyError;
use crate::domain::events::SessionEvent;
use crate::ports::EventSink;

pub struct EventForwarder {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl EventForwarder {
    pub fn spawn(rx: mpsc::UnboundedReceiver<SessionEvent>, sink: Arc<dyn EventSink>) -> Self {
        let stop = CancellationToken::new();
        let join = tokio::spawn(forward(rx, sink, stop.clone()));
        Self { stop, join }
    }

    /// Deliver whatever is already queued, then stop.
    pub async fn drain_and_stop(self) {
        self.stop.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "event forwarder panicked");
        }
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    sink: Arc<dyn EventSink>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => deliver(sink.as_ref(), event).await,
                None => break,
            },
            _ = stop.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    deliver(sink.as_ref(), event).await;
                }
                break;
            }
        }
    }
    tracing::debug!("event forwarder stopped");
}

async fn deliver(sink: &dyn EventSink, event: SessionEvent) {
    let session_id = event.session_id();
    match sink.emit(event.sanitized()).await {
        Ok(()) => {}
        Err(NotifyError::NoSubscribers) => tracing::trace!(%session_id, "no subscribers"),
        Err(e) => tracing::warn!(%session_id, error = %e, "event delivery failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::SessionStatus;
    use crate::domain::ids::SessionId;
    use crate::impls::BroadcastEventSink;
    use ulid::Ulid;

    #[tokio::test]
    async fn forwards_sanitized_events_and_drains_on_stop() {
        let sink = BroadcastEventSink::new(16);
        let mut sub = sink.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = EventForwarder::spawn(rx, Arc::new(sink));
        let id = SessionId::from_ulid(Ulid::new());

        tx.send(SessionEvent::StatusChanged {
            session_id: id,
            status: SessionStatus::Failed,
            message: Some("cannot write /home/dev/.loom/ws/x.ts".to_string()),
        })
        .unwrap();
        tx.send(SessionEvent::FileUpdated {
            session_id: id,
            path: "src/App.tsx".to_string(),
        })
        .unwrap();
        forwarder.drain_and_stop().await;

        let SessionEvent::StatusChanged { message, .. } = sub.recv().await.unwrap() else {
            panic!("expected status change");
        };
        assert_eq!(message.as_deref(), Some("cannot write [path]"));
        assert!(matches!(
            sub.recv().await.unwrap(),
            SessionEvent::FileUpdated { .. }
        ));
    }
}
