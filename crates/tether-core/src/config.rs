use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use tether_types::{ModelPricing, ProtocolFamily};

/// Runtime knobs of the orchestrator. Every field has a default so partial
/// config files deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delay before a blocking ask is promoted to interactive/resumable/idle.
    pub status_promotion_delay_ms: u64,
    /// Poll interval used while waiting on an ask, on top of change notification.
    pub ask_poll_interval_ms: u64,
    /// Delays between save retries. The first attempt is immediate.
    pub save_retry_backoff_ms: Vec<u64>,
    pub protocol_family: ProtocolFamily,
    pub pricing: ModelPricing,
    /// Tool names that hand work off to a child task.
    pub delegation_tools: Vec<String>,
    /// Delegate even when the parent's pending results could not be saved.
    pub delegation_best_effort: bool,
    pub repetition_guard: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            status_promotion_delay_ms: 2_000,
            ask_poll_interval_ms: 100,
            save_retry_backoff_ms: vec![100, 500, 1_500],
            protocol_family: ProtocolFamily::Anthropic,
            pricing: ModelPricing::default(),
            delegation_tools: vec!["new_task".to_string()],
            delegation_best_effort: false,
            repetition_guard: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn status_promotion_delay(&self) -> Duration {
        Duration::from_millis(self.status_promotion_delay_ms)
    }

    pub fn ask_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ask_poll_interval_ms.max(1))
    }

    pub fn save_retry_backoff(&self) -> Vec<Duration> {
        self.save_retry_backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn is_delegation_tool(&self, name: &str) -> bool {
        self.delegation_tools.iter().any(|tool| tool == name)
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, project file, `TETHER_*`
/// environment variables, then CLI overrides. Later layers win key by key.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::with_paths(global_path.as_deref(), path, cli_overrides).await
    }

    pub async fn with_paths(
        global_path: Option<&Path>,
        project_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global = match global_path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let project = read_json_file(&project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> OrchestratorConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "invalid orchestrator config, using defaults");
                OrchestratorConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await?;
        Ok(snapshot)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

pub(crate) async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
            Ok(empty_object())
        }
    }
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TETHER_GLOBAL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("tether").join("config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(raw) = std::env::var("TETHER_PROTOCOL_FAMILY") {
        let family = match raw.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some("anthropic"),
            "openai" | "openai_compatible" | "openai-compatible" => Some("openai_compatible"),
            _ => None,
        };
        if let Some(family) = family {
            deep_merge(&mut root, &json!({ "protocol_family": family }));
        }
    }
    if let Some(ms) = env_u64("TETHER_STATUS_DELAY_MS") {
        deep_merge(&mut root, &json!({ "status_promotion_delay_ms": ms }));
    }
    if let Some(ms) = env_u64("TETHER_ASK_POLL_MS") {
        deep_merge(&mut root, &json!({ "ask_poll_interval_ms": ms }));
    }
    if let Ok(raw) = std::env::var("TETHER_REPETITION_GUARD") {
        if let Some(enabled) = parse_bool_like(&raw) {
            deep_merge(&mut root, &json!({ "repetition_guard": enabled }));
        }
    }
    if let Ok(raw) = std::env::var("TETHER_DELEGATION_TOOLS") {
        let tools = parse_csv(&raw);
        if !tools.is_empty() {
            deep_merge(&mut root, &json!({ "delegation_tools": tools }));
        }
    }

    root
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
