use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use tether_types::StreamChunk;

use crate::repetition_guard::{RepetitionDetection, RepetitionGuard};
use crate::token_cost::{TokenCostEstimator, Tokenizer};

/// Accumulation state of one streamed tool call.
#[derive(Debug, Clone)]
struct ToolInvocationState {
    id: String,
    name: String,
    arguments: String,
    provider_index: Option<u32>,
    index: u32,
    synthetic_index: bool,
    finalized: Option<FinalizedToolCall>,
}

impl ToolInvocationState {
    fn is_open(&self) -> bool {
        self.finalized.is_none()
    }

    fn echo(&self) -> ToolCallEcho {
        ToolCallEcho {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            finalized: !self.is_open(),
        }
    }

    fn finalize(&mut self) {
        if self.finalized.is_some() {
            return;
        }
        let (input, parse_error) = parse_arguments(&self.arguments);
        self.finalized = Some(FinalizedToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            dispatch_name: self.name.clone(),
            input,
            raw_arguments: self.arguments.clone(),
            parse_error,
            index: self.index,
            synthetic_index: self.synthetic_index,
        });
    }
}

/// A tool call whose arguments are complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizedToolCall {
    pub id: String,
    /// Name as the model presented it. Transcript entries always carry this.
    pub name: String,
    /// Name used to look up the executor; may be a resolved alias.
    pub dispatch_name: String,
    pub input: Value,
    pub raw_arguments: String,
    pub parse_error: Option<String>,
    pub index: u32,
    pub synthetic_index: bool,
}

impl FinalizedToolCall {
    pub fn parse_failed(&self) -> bool {
        self.parse_error.is_some()
    }
}

/// Live view of a tool call for UI echo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallEcho {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerStep {
    Continue,
    Text,
    Reasoning,
    ToolCall(ToolCallEcho),
    DeadLoop(RepetitionDetection),
    Done,
}

/// Everything one provider turn produced.
pub struct AssembledTurn {
    pub text: String,
    pub reasoning: String,
    pub reasoning_signature: Option<String>,
    pub reasoning_encrypted: Option<String>,
    pub tool_calls: Vec<FinalizedToolCall>,
    pub finish_reason: Option<String>,
    pub estimator: TokenCostEstimator,
}

impl AssembledTurn {
    pub fn any_parse_failed(&self) -> bool {
        self.tool_calls.iter().any(FinalizedToolCall::parse_failed)
    }
}

/// Folds the provider-neutral chunk sequence of one turn into text,
/// reasoning, and finalized tool calls.
pub struct StreamAssembler {
    text: String,
    reasoning: String,
    reasoning_signature: Option<String>,
    reasoning_encrypted: Option<String>,
    calls: Vec<ToolInvocationState>,
    used_indices: HashSet<u32>,
    next_synthetic: u32,
    guard: Option<RepetitionGuard>,
    estimator: TokenCostEstimator,
    finish_reason: Option<String>,
    done: bool,
}

impl StreamAssembler {
    pub fn new(tokenizer: Arc<Tokenizer>, repetition_guard: bool) -> Self {
        Self {
            text: String::new(),
            reasoning: String::new(),
            reasoning_signature: None,
            reasoning_encrypted: None,
            calls: Vec::new(),
            used_indices: HashSet::new(),
            next_synthetic: 0,
            guard: repetition_guard.then(RepetitionGuard::new),
            estimator: TokenCostEstimator::new(tokenizer),
            finish_reason: None,
            done: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn ingest(&mut self, chunk: StreamChunk) -> AssemblerStep {
        if self.done {
            tracing::debug!("ignoring chunk after end of stream");
            return AssemblerStep::Continue;
        }
        match chunk {
            StreamChunk::TextDelta { text } => {
                self.estimator.record_text(&text);
                self.text.push_str(&text);
                AssemblerStep::Text
            }
            StreamChunk::ReasoningDelta { text } => {
                self.estimator.record_reasoning(&text);
                self.reasoning.push_str(&text);
                if let Some(detection) = self.guard.as_mut().and_then(|guard| guard.push(&text)) {
                    return AssemblerStep::DeadLoop(detection);
                }
                AssemblerStep::Reasoning
            }
            StreamChunk::ReasoningSignature {
                signature,
                encrypted_content,
            } => {
                if signature.is_some() {
                    self.reasoning_signature = signature;
                }
                if encrypted_content.is_some() {
                    self.reasoning_encrypted = encrypted_content;
                }
                AssemblerStep::Continue
            }
            StreamChunk::ToolCallStart { id, name, index } => {
                let slot = match self.find_open_by_id(&id) {
                    Some(slot) => {
                        tracing::warn!(id = %id, "duplicate tool call start ignored");
                        if self.calls[slot].name.is_empty() {
                            self.calls[slot].name = name;
                        }
                        slot
                    }
                    None => self.open_call(id, name, index),
                };
                AssemblerStep::ToolCall(self.calls[slot].echo())
            }
            StreamChunk::ToolCallDelta {
                id,
                index,
                args_delta,
            } => {
                let Some(slot) = self.resolve_delta_target(id.as_deref(), index) else {
                    tracing::warn!(
                        id = id.as_deref().unwrap_or(""),
                        index = ?index,
                        "dropping tool-call delta for unknown invocation"
                    );
                    return AssemblerStep::Continue;
                };
                self.estimator.record_tool_arguments(&args_delta);
                self.calls[slot].arguments.push_str(&args_delta);
                AssemblerStep::ToolCall(self.calls[slot].echo())
            }
            StreamChunk::ToolCallEnd {
                id,
                name,
                arguments,
            } => {
                let slot = match self.find_open_by_id(&id) {
                    Some(slot) => slot,
                    None => self.open_call(id, name.clone().unwrap_or_default(), None),
                };
                let call = &mut self.calls[slot];
                if call.name.is_empty() {
                    if let Some(name) = name {
                        call.name = name;
                    }
                }
                if let Some(arguments) = arguments {
                    if call.arguments.is_empty() {
                        self.estimator.record_tool_arguments(&arguments);
                    }
                    call.arguments = arguments;
                }
                call.finalize();
                AssemblerStep::ToolCall(call.echo())
            }
            StreamChunk::Usage(usage) => {
                self.estimator.record_usage(&usage);
                AssemblerStep::Continue
            }
            StreamChunk::Done { finish_reason } => {
                self.finish_reason = finish_reason;
                self.finalize_open_calls();
                self.done = true;
                AssemblerStep::Done
            }
        }
    }

    /// Finalizes whatever is still open and hands back the turn.
    pub fn finish(mut self) -> AssembledTurn {
        self.finalize_open_calls();
        let tool_calls = self
            .calls
            .into_iter()
            .filter_map(|state| state.finalized)
            .filter(|call| {
                if call.name.trim().is_empty() {
                    tracing::warn!(id = %call.id, "dropping tool call without a name");
                    return false;
                }
                true
            })
            .collect();
        AssembledTurn {
            text: self.text,
            reasoning: self.reasoning,
            reasoning_signature: self.reasoning_signature,
            reasoning_encrypted: self.reasoning_encrypted,
            tool_calls,
            finish_reason: self.finish_reason,
            estimator: self.estimator,
        }
    }

    fn finalize_open_calls(&mut self) {
        for call in self.calls.iter_mut().filter(|call| call.is_open()) {
            call.finalize();
        }
    }

    fn open_call(&mut self, id: String, name: String, provider_index: Option<u32>) -> usize {
        let (index, synthetic_index) = match provider_index {
            Some(index) if !self.used_indices.contains(&index) => (index, false),
            _ => (self.allocate_synthetic_index(), true),
        };
        self.used_indices.insert(index);
        self.calls.push(ToolInvocationState {
            id,
            name,
            arguments: String::new(),
            provider_index,
            index,
            synthetic_index,
            finalized: None,
        });
        self.calls.len() - 1
    }

    fn allocate_synthetic_index(&mut self) -> u32 {
        while self.used_indices.contains(&self.next_synthetic) {
            self.next_synthetic += 1;
        }
        let index = self.next_synthetic;
        self.next_synthetic += 1;
        index
    }

    fn find_open_by_id(&self, id: &str) -> Option<usize> {
        self.calls
            .iter()
            .rposition(|call| call.is_open() && call.id == id)
    }

    fn resolve_delta_target(&self, id: Option<&str>, index: Option<u32>) -> Option<usize> {
        if let Some(id) = id {
            if let Some(slot) = self.find_open_by_id(id) {
                return Some(slot);
            }
        }
        if let Some(index) = index {
            return self
                .calls
                .iter()
                .rposition(|call| call.is_open() && call.provider_index == Some(index));
        }
        if id.is_none() {
            return self.calls.iter().rposition(ToolInvocationState::is_open);
        }
        None
    }
}

fn parse_arguments(raw: &str) -> (Value, Option<String>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (json!({}), None);
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => (value, None),
        Err(err) => (json!({}), Some(err.to_string())),
    }
}
