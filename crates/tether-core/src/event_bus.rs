use serde_json::{Map, Value};
use tokio::sync::broadcast;

use tether_types::EngineEvent;

const EVENT_BUS_CAPACITY: usize = 2048;

/// Fire-and-forget notification channel towards the host. Publishing never
/// blocks and never fails, even without subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Publishes `event_type` with `taskID` merged into the properties.
    pub fn publish_for_task(&self, task_id: &str, event_type: &str, properties: Value) {
        let mut props = match properties {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        props.insert("taskID".to_string(), Value::String(task_id.to_string()));
        self.publish(EngineEvent::new(event_type, Value::Object(props)));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_for_task_tags_task_id() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish_for_task("task_1", "task.idle", json!({"ts": 42}));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "task.idle");
        assert_eq!(event.properties["taskID"], "task_1");
        assert_eq!(event.properties["ts"], 42);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::new("message.created", json!({})));
    }
}
