use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Notifications published alongside the loop for whoever is watching the
/// session, e.g. a UI that embeds the live stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    StreamUrl { stream_url: String },
}

/// Fire-and-forget receiver of loop events. Implementations must not block;
/// a lost event never fails the step that produced it.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LoopEvent);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LoopEvent) {}
}

impl EventSink for UnboundedSender<LoopEvent> {
    fn emit(&self, event: LoopEvent) {
        if let Err(e) = self.send(event) {
            debug!("event listener gone, dropping {:?}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn stream_event_shape() {
        let ev = LoopEvent::StreamUrl { stream_url: "https://s".into() };
        assert_eq!(serde_json::to_value(&ev).unwrap(), json!({"event": "stream_url", "stream_url": "https://s"}));
    }

    #[tokio::test]
    async fn channel_sink_delivers_and_tolerates_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(LoopEvent::StreamUrl { stream_url: "a".into() });
        assert_eq!(rx.recv().await, Some(LoopEvent::StreamUrl { stream_url: "a".into() }));
        drop(rx);
        tx.emit(LoopEvent::StreamUrl { stream_url: "b".into() });
    }
}
