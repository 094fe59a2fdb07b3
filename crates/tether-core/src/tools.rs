use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::stream_assembler::FinalizedToolCall;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("invalid arguments for `{tool}`: {detail}")]
    InvalidArguments { tool: String, detail: String },
    #[error("unknown tool `{0}`")]
    Unknown(String),
    #[error("tool `{0}` was cancelled")]
    Cancelled(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub output: String,
    pub metadata: Value,
}

impl ToolOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: json!({}),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, input: Value, cancel: CancellationToken) -> Result<ToolOutput, ToolError>;
}

/// Seam between the orchestrator and whatever actually runs tools.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Resolves aliases. The transcript keeps the presented name.
    fn canonical_name(&self, name: &str) -> String {
        name.to_string()
    }

    fn requires_approval(&self, name: &str) -> bool;

    async fn execute(
        &self,
        call: &FinalizedToolCall,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}

/// Name-keyed tool table with alias resolution and an optional fallback for
/// names nothing is registered under.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    aliases: HashMap<String, String>,
    fallback: Option<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(normalize_tool_name(tool.name()), tool);
        self
    }

    pub fn with_alias(mut self, alias: &str, target: &str) -> Self {
        self.aliases
            .insert(normalize_tool_name(alias), normalize_tool_name(target));
        self
    }

    pub fn with_fallback(mut self, tool: Arc<dyn Tool>) -> Self {
        self.fallback = Some(tool);
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools
            .get(&self.canonical_name(name))
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl ToolDispatch for ToolRegistry {
    fn canonical_name(&self, name: &str) -> String {
        let normalized = normalize_tool_name(name);
        self.aliases.get(&normalized).cloned().unwrap_or(normalized)
    }

    fn requires_approval(&self, name: &str) -> bool {
        self.lookup(name).map(|tool| tool.requires_approval()).unwrap_or(true)
    }

    async fn execute(
        &self,
        call: &FinalizedToolCall,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        if let Some(detail) = &call.parse_error {
            return Err(ToolError::InvalidArguments {
                tool: call.name.clone(),
                detail: detail.clone(),
            });
        }
        let Some(tool) = self.lookup(&call.dispatch_name) else {
            return Err(ToolError::Unknown(call.name.clone()));
        };
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled(call.name.clone()));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled(call.name.clone())),
            result = tool.execute(call.input.clone(), cancel.clone()) => result,
        }
    }
}

pub fn normalize_tool_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

/// Records the call instead of running it. Read-only names skip approval.
pub struct DryRunTool;

const READ_ONLY_PREFIXES: [&str; 4] = ["read_", "list_", "search_", "get_"];

#[async_trait]
impl Tool for DryRunTool {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn execute(&self, input: Value, _cancel: CancellationToken) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput {
            output: format!("dry run: {input}"),
            metadata: json!({ "dry_run": true }),
        })
    }
}

/// Registry that dry-runs every call, asking approval only for tools that
/// look like they write.
pub struct DryRunTools {
    registry: ToolRegistry,
}

impl DryRunTools {
    pub fn new() -> Self {
        Self {
            registry: ToolRegistry::new()
                .with_alias("todowrite", "update_todo_list")
                .with_alias("todo_write", "update_todo_list")
                .with_fallback(Arc::new(DryRunTool)),
        }
    }
}

impl Default for DryRunTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDispatch for DryRunTools {
    fn canonical_name(&self, name: &str) -> String {
        self.registry.canonical_name(name)
    }

    fn requires_approval(&self, name: &str) -> bool {
        let name = self.canonical_name(name);
        !READ_ONLY_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    async fn execute(
        &self,
        call: &FinalizedToolCall,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let mut output = self.registry.execute(call, cancel).await?;
        output.output = format!("{} {}", call.dispatch_name, output.output);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn requires_approval(&self) -> bool {
            false
        }

        async fn execute(&self, input: Value, _: CancellationToken) -> Result<ToolOutput, ToolError> {
            let text = input
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::InvalidArguments {
                    tool: "upper".to_string(),
                    detail: "missing `text`".to_string(),
                })?;
            Ok(ToolOutput::text(text.to_uppercase()))
        }
    }

    fn call(name: &str, input: Value) -> FinalizedToolCall {
        FinalizedToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            dispatch_name: name.to_string(),
            input,
            raw_arguments: String::new(),
            parse_error: None,
            index: 0,
            synthetic_index: true,
        }
    }

    #[tokio::test]
    async fn registry_resolves_aliases_and_executes() {
        let registry = ToolRegistry::new()
            .with_tool(Arc::new(Upper))
            .with_alias("Shout", "upper");
        assert_eq!(registry.canonical_name("Shout"), "upper");
        assert!(!registry.requires_approval("shout"));
        assert!(registry.requires_approval("missing"));

        let mut shout = call("Shout", json!({"text": "hi"}));
        shout.dispatch_name = registry.canonical_name(&shout.name);
        let out = registry
            .execute(&shout, CancellationToken::new())
            .await
            .expect("execute");
        assert_eq!(out.output, "HI");
    }

    #[tokio::test]
    async fn parse_failures_and_unknown_tools_are_errors() {
        let registry = ToolRegistry::new().with_tool(Arc::new(Upper));
        let mut broken = call("upper", json!({}));
        broken.parse_error = Some("EOF while parsing".to_string());
        assert!(matches!(
            registry.execute(&broken, CancellationToken::new()).await,
            Err(ToolError::InvalidArguments { .. })
        ));
        assert_eq!(
            registry
                .execute(&call("nope", json!({})), CancellationToken::new())
                .await,
            Err(ToolError::Unknown("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn cancelled_token_stops_execution() {
        let registry = ToolRegistry::new().with_tool(Arc::new(Upper));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            registry
                .execute(&call("upper", json!({"text": "x"})), cancel)
                .await,
            Err(ToolError::Cancelled("upper".to_string()))
        );
    }

    #[tokio::test]
    async fn dry_run_tools_gate_writes_only() {
        let tools = DryRunTools::new();
        assert!(!tools.requires_approval("read_file"));
        assert!(tools.requires_approval("write_to_file"));
        assert_eq!(tools.canonical_name("todowrite"), "update_todo_list");
        let out = tools
            .execute(&call("list_files", json!({"path": "."})), CancellationToken::new())
            .await
            .expect("dry run");
        assert!(out.output.starts_with("list_files dry run:"));
    }
}
