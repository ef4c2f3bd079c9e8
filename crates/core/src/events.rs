//! Lifecycle events published by the manager. Subscribers (facade,
//! router) attach through the broadcast edge; the manager never holds
//! back-pointers to them.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MinerEvent {
    Created { name: String, kind: String },
    Running { name: String },
    Stopped { name: String },
    Exited { name: String, code: Option<i32> },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MinerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MinerEvent> {
        self.tx.subscribe()
    }

    /// Delivery is best-effort; a bus with no subscribers drops events.
    pub fn emit(&self, event: MinerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(MinerEvent::Created {
            name: "xmrig-001".to_string(),
            kind: "xmrig".to_string(),
        });
        match rx.recv().await.unwrap() {
            MinerEvent::Created { name, .. } => assert_eq!(name, "xmrig-001"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(MinerEvent::Stopped {
            name: "xmrig-001".to_string(),
        });
    }
}
