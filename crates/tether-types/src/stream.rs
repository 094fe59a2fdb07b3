use serde::{Deserialize, Serialize};

/// Provider-neutral streaming event. Provider adapters live outside this
/// workspace and translate their wire format into this sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },
    ToolCallDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        args_delta: String,
    },
    /// Terminal event for one tool call. Some providers send only this event,
    /// carrying the whole argument payload.
    ToolCallEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },
    /// Opaque reasoning side-channel data. Anthropic-family providers send a
    /// signature, OpenAI-compatible ones may send encrypted content.
    ReasoningSignature {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_content: Option<String>,
    },
    Usage(TokenUsage),
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl TokenUsage {
    pub fn is_trivially_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }

    /// Providers report usage in several partial events; later non-zero
    /// values win field by field.
    pub fn merge(&mut self, other: &TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_write_tokens > 0 {
            self.cache_write_tokens = other.cache_write_tokens;
        }
        if other.cache_read_tokens > 0 {
            self.cache_read_tokens = other.cache_read_tokens;
        }
        if other.reasoning_tokens.is_some() {
            self.reasoning_tokens = other.reasoning_tokens;
        }
        if other.total_cost.is_some() {
            self.total_cost = other.total_cost;
        }
    }
}
