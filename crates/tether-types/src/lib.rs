mod message;
mod provider;
mod stream;
mod transcript;

pub use message::*;
pub use provider::*;
pub use stream::*;
pub use transcript::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One-way notification emitted to the host (UI, editor, CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

pub fn new_task_id() -> String {
    format!("task_{}", uuid::Uuid::new_v4().simple())
}
