use serde::{Deserialize, Serialize};

/// Wire-protocol family of the active provider. It decides how reasoning
/// side-channel data is attached to transcript entries and which cost formula
/// applies to cache tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    #[default]
    Anthropic,
    OpenaiCompatible,
}

/// Prices in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
    #[serde(default)]
    pub cache_write_price: f64,
    #[serde(default)]
    pub cache_read_price: f64,
}
