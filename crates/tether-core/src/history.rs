//! Keeps the provider-facing transcript structurally valid: unique tool-use
//! ids per assistant entry, every tool result paired with a tool use in the
//! preceding assistant entry, and nothing executed after a delegation call.

use std::collections::{HashMap, HashSet};

use tether_types::{ContentBlock, ProtocolFamily, Role, TranscriptEntry};

use crate::stream_assembler::FinalizedToolCall;

const MISSING_RESULT: &str =
    "Tool result missing: the tool was not executed before the conversation continued.";

/// Reasoning side-channel data attached to an assistant entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasoningPayload {
    pub text: String,
    pub signature: Option<String>,
    pub encrypted_content: Option<String>,
}

impl ReasoningPayload {
    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.encrypted_content.is_none()
    }
}

/// Assistant content ready to be appended, plus the invocations that should
/// actually execute.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantContent {
    pub content: Vec<ContentBlock>,
    pub invocations: Vec<FinalizedToolCall>,
    pub dropped_duplicates: Vec<String>,
}

/// What `append_user_entry` had to fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserEntryRepair {
    pub reassigned: usize,
    pub rewritten: usize,
    pub synthesized: usize,
}

impl UserEntryRepair {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

pub struct HistoryIntegrityEnforcer {
    family: ProtocolFamily,
    delegation_tools: Vec<String>,
    entries: Vec<TranscriptEntry>,
}

impl HistoryIntegrityEnforcer {
    pub fn new(family: ProtocolFamily, delegation_tools: Vec<String>) -> Self {
        Self::from_entries(family, delegation_tools, Vec::new())
    }

    pub fn from_entries(
        family: ProtocolFamily,
        delegation_tools: Vec<String>,
        entries: Vec<TranscriptEntry>,
    ) -> Self {
        Self {
            family,
            delegation_tools,
            entries,
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_delegation_tool(&self, name: &str) -> bool {
        self.delegation_tools.iter().any(|tool| tool == name)
    }

    /// Last entry that is not a condensation summary.
    pub fn last_effective(&self) -> Option<&TranscriptEntry> {
        self.entries.iter().rev().find(|entry| !entry.is_summary)
    }

    /// Tool uses of the effective last entry, if it is an assistant entry.
    pub fn open_tool_use_ids(&self) -> Vec<String> {
        match self.last_effective() {
            Some(entry) if entry.role == Role::Assistant => {
                entry.tool_use_ids().map(ToString::to_string).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Builds assistant content from streamed text and tool calls. A repeated
    /// tool-use id keeps its first occurrence; later ones are dropped.
    pub fn build_assistant_content(
        &self,
        text: &str,
        calls: &[FinalizedToolCall],
    ) -> AssistantContent {
        let mut content = Vec::new();
        if !text.trim().is_empty() {
            content.push(ContentBlock::text(text));
        }

        let mut seen = HashSet::new();
        let mut invocations = Vec::new();
        let mut dropped_duplicates = Vec::new();
        for call in calls {
            if !seen.insert(call.id.clone()) {
                tracing::warn!(tool_use_id = %call.id, tool = %call.name, "dropping duplicate tool_use id");
                dropped_duplicates.push(call.id.clone());
                continue;
            }
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
            invocations.push(call.clone());
        }

        AssistantContent {
            content,
            invocations,
            dropped_duplicates,
        }
    }

    /// Truncates everything after the first delegation tool use. Returns an
    /// error result for each tool use that was cut off.
    pub fn enforce_delegation_isolation(
        &self,
        content: &mut Vec<ContentBlock>,
        invocations: &mut Vec<FinalizedToolCall>,
    ) -> Vec<ContentBlock> {
        let Some(pos) = content.iter().position(|block| {
            matches!(block, ContentBlock::ToolUse { name, .. } if self.is_delegation_tool(name))
        }) else {
            return Vec::new();
        };

        let delegation_id = content[pos].tool_use_id().map(ToString::to_string);
        let truncated = content.split_off(pos + 1);
        if let Some(id) = delegation_id {
            if let Some(idx) = invocations.iter().position(|call| call.id == id) {
                invocations.truncate(idx + 1);
            }
        }

        truncated
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, .. } => Some(ContentBlock::tool_error(
                    id,
                    format!(
                        "Tool `{name}` was not executed because a delegation call closed this turn."
                    ),
                )),
                _ => None,
            })
            .collect()
    }

    /// Appends an assistant entry. Reasoning goes first: a signed thinking
    /// block for the Anthropic family, a reasoning block otherwise.
    pub fn append_assistant_entry(
        &mut self,
        mut content: Vec<ContentBlock>,
        reasoning: Option<ReasoningPayload>,
    ) -> &TranscriptEntry {
        if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
            let block = match (self.family, reasoning.signature) {
                (ProtocolFamily::Anthropic, Some(signature)) => ContentBlock::Thinking {
                    thinking: reasoning.text,
                    signature,
                },
                _ => ContentBlock::Reasoning {
                    text: reasoning.text,
                    encrypted_content: reasoning.encrypted_content,
                },
            };
            content.insert(0, block);
        }
        self.push(TranscriptEntry::new(Role::Assistant, content))
    }

    /// Appends a user entry, repairing tool results so that each one answers
    /// a tool use of the effective preceding assistant entry exactly once.
    ///
    /// Results for unknown ids take over unanswered ids in order; what cannot
    /// be matched is rewritten to text. Unanswered tool uses get a synthesized
    /// error result.
    pub fn append_user_entry(&mut self, content: Vec<ContentBlock>) -> UserEntryRepair {
        let (repaired, repair) = self.repair_user_content(content);
        if !repaired.is_empty() {
            self.push(TranscriptEntry::new(Role::User, repaired));
        }
        repair
    }

    /// The repair `append_user_entry` applies, without appending. Used to
    /// stage a well-formed user entry for snapshots.
    pub fn repair_user_content(
        &self,
        content: Vec<ContentBlock>,
    ) -> (Vec<ContentBlock>, UserEntryRepair) {
        let mut repair = UserEntryRepair::default();
        let follows_assistant =
            matches!(self.last_effective(), Some(entry) if entry.role == Role::Assistant);

        if !follows_assistant {
            let content: Vec<ContentBlock> = content
                .into_iter()
                .map(|block| match block {
                    ContentBlock::ToolResult { .. } => {
                        repair.rewritten += 1;
                        result_as_text(block)
                    }
                    other => other,
                })
                .collect();
            if repair.rewritten > 0 {
                tracing::warn!(
                    rewritten = repair.rewritten,
                    "tool results without a preceding assistant entry rewritten to text"
                );
            }
            return (content, repair);
        }

        let expected = self.open_tool_use_ids();
        let expected_set: HashSet<&str> = expected.iter().map(String::as_str).collect();
        let mut matched: HashMap<String, ContentBlock> = HashMap::new();
        let mut strays = Vec::new();
        let mut others = Vec::new();

        for block in content {
            let Some(id) = block.tool_result_id().map(ToString::to_string) else {
                others.push(block);
                continue;
            };
            if !expected_set.contains(id.as_str()) {
                strays.push(block);
            } else if matched.contains_key(&id) {
                tracing::warn!(tool_use_id = %id, "duplicate tool result rewritten to text");
                repair.rewritten += 1;
                others.push(result_as_text(block));
            } else {
                matched.insert(id, block);
            }
        }

        for block in strays {
            let free = expected.iter().find(|id| !matched.contains_key(*id)).cloned();
            match (free, block) {
                (
                    Some(free),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    },
                ) => {
                    tracing::warn!(from = %tool_use_id, to = %free, "reassigning tool result id");
                    repair.reassigned += 1;
                    matched.insert(
                        free.clone(),
                        ContentBlock::ToolResult {
                            tool_use_id: free,
                            content,
                            is_error,
                        },
                    );
                }
                (_, block) => {
                    tracing::warn!(
                        tool_use_id = block.tool_result_id().unwrap_or(""),
                        "unmatched tool result rewritten to text"
                    );
                    repair.rewritten += 1;
                    others.push(result_as_text(block));
                }
            }
        }

        let mut repaired = Vec::with_capacity(expected.len() + others.len());
        for id in &expected {
            match matched.remove(id) {
                Some(block) => repaired.push(block),
                None => {
                    repair.synthesized += 1;
                    repaired.push(ContentBlock::tool_error(id.clone(), MISSING_RESULT));
                }
            }
        }
        repaired.extend(others);
        (repaired, repair)
    }

    /// Appends a condensation summary. Summaries are transparent to result
    /// pairing.
    pub fn append_summary(&mut self, text: impl Into<String>) -> &TranscriptEntry {
        let mut entry = TranscriptEntry::new(Role::Assistant, vec![ContentBlock::text(text)]);
        entry.is_summary = true;
        self.push(entry)
    }

    fn push(&mut self, entry: TranscriptEntry) -> &TranscriptEntry {
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }
}

fn result_as_text(block: ContentBlock) -> ContentBlock {
    match block {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let marker = if is_error { " (error)" } else { "" };
            ContentBlock::text(format!("[Tool result for {tool_use_id}]{marker}: {content}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, name: &str) -> FinalizedToolCall {
        FinalizedToolCall {
            id: id.to_string(),
            name: name.to_string(),
            dispatch_name: name.to_string(),
            input: json!({}),
            raw_arguments: "{}".to_string(),
            parse_error: None,
            index: 0,
            synthetic_index: true,
        }
    }

    fn enforcer() -> HistoryIntegrityEnforcer {
        HistoryIntegrityEnforcer::new(ProtocolFamily::Anthropic, vec!["new_task".to_string()])
    }

    fn with_assistant_tools(ids: &[&str]) -> HistoryIntegrityEnforcer {
        let mut history = enforcer();
        history.append_user_entry(vec![ContentBlock::text("do it")]);
        let calls: Vec<_> = ids.iter().map(|id| call(id, "read_file")).collect();
        let built = history.build_assistant_content("", &calls);
        history.append_assistant_entry(built.content, None);
        history
    }

    #[test]
    fn duplicate_tool_use_ids_keep_first_occurrence() {
        let history = enforcer();
        let built = history.build_assistant_content(
            "checking",
            &[call("a", "read_file"), call("a", "read_file"), call("b", "list_files")],
        );
        assert_eq!(built.content.len(), 3);
        assert_eq!(built.invocations.len(), 2);
        assert_eq!(built.dropped_duplicates, vec!["a".to_string()]);
    }

    #[test]
    fn delegation_truncates_later_calls() {
        let history = enforcer();
        let mut built = history.build_assistant_content(
            "handing off",
            &[call("d", "new_task"), call("x", "read_file")],
        );
        let synthesized =
            history.enforce_delegation_isolation(&mut built.content, &mut built.invocations);

        assert_eq!(built.content.len(), 2);
        assert_eq!(built.content[1].tool_use_id(), Some("d"));
        assert_eq!(built.invocations.len(), 1);
        assert_eq!(synthesized.len(), 1);
        match &synthesized[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                content,
            } => {
                assert_eq!(tool_use_id, "x");
                assert!(is_error);
                assert!(content.contains("delegation"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn delegation_as_last_call_changes_nothing() {
        let history = enforcer();
        let mut built =
            history.build_assistant_content("", &[call("x", "read_file"), call("d", "new_task")]);
        let synthesized =
            history.enforce_delegation_isolation(&mut built.content, &mut built.invocations);
        assert!(synthesized.is_empty());
        assert_eq!(built.invocations.len(), 2);
    }

    #[test]
    fn results_without_assistant_are_rewritten_not_dropped() {
        let mut history = enforcer();
        let repair = history.append_user_entry(vec![
            ContentBlock::text("hello"),
            ContentBlock::tool_result("ghost", "output"),
        ]);
        assert_eq!(repair.rewritten, 1);
        let entry = &history.entries()[0];
        assert_eq!(entry.content.len(), 2);
        assert!(entry.content.iter().all(|b| b.tool_result_id().is_none()));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn results_after_summarized_user_entry_are_rewritten() {
        let mut history = enforcer();
        history.append_user_entry(vec![ContentBlock::text("first request")]);
        history.append_summary("Earlier work was condensed.");
        let repair = history.append_user_entry(vec![
            ContentBlock::tool_result("stale", "output"),
            ContentBlock::text("continue"),
        ]);
        assert_eq!(repair.rewritten, 1);
        assert_eq!(history.len(), 3);
        let entry = &history.entries()[2];
        assert_eq!(entry.role, Role::User);
        assert_eq!(entry.content.len(), 2);
        assert!(entry.content.iter().all(|b| b.tool_result_id().is_none()));
    }

    #[test]
    fn repair_user_content_leaves_history_untouched() {
        let history = with_assistant_tools(&["d"]);
        let (content, repair) =
            history.repair_user_content(vec![ContentBlock::tool_error("cut", "not executed")]);
        assert_eq!(history.len(), 2);
        assert_eq!(repair.reassigned, 1);
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].tool_result_id(), Some("d"));
    }

    #[test]
    fn unknown_result_takes_over_unanswered_id() {
        let mut history = with_assistant_tools(&["a", "b"]);
        let repair = history.append_user_entry(vec![
            ContentBlock::tool_result("a", "one"),
            ContentBlock::tool_result("zzz", "two"),
        ]);
        assert_eq!(repair.reassigned, 1);
        let ids: Vec<_> = history.entries()[2]
            .content
            .iter()
            .filter_map(ContentBlock::tool_result_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn surplus_results_become_text_and_missing_ones_are_synthesized() {
        let mut history = with_assistant_tools(&["a", "b"]);
        let repair = history.append_user_entry(vec![
            ContentBlock::tool_result("a", "one"),
            ContentBlock::tool_result("a", "again"),
        ]);
        assert_eq!(repair.rewritten, 1);
        assert_eq!(repair.synthesized, 1);

        let content = &history.entries()[2].content;
        assert_eq!(content.len(), 3);
        assert_eq!(content[0].tool_result_id(), Some("a"));
        assert_eq!(content[1].tool_result_id(), Some("b"));
        assert!(matches!(&content[2], ContentBlock::Text { text } if text.contains("again")));
    }

    #[test]
    fn summaries_are_skipped_when_pairing() {
        let mut history = with_assistant_tools(&["a"]);
        history.append_summary("Earlier work was condensed.");
        let repair = history.append_user_entry(vec![ContentBlock::tool_result("a", "done")]);
        assert!(repair.is_clean());
        assert_eq!(history.entries()[3].content[0].tool_result_id(), Some("a"));
    }

    #[test]
    fn anthropic_signature_becomes_thinking_block() {
        let mut history = enforcer();
        let entry = history.append_assistant_entry(
            vec![ContentBlock::text("answer")],
            Some(ReasoningPayload {
                text: "let me think".to_string(),
                signature: Some("sig".to_string()),
                encrypted_content: None,
            }),
        );
        assert!(matches!(entry.content[0], ContentBlock::Thinking { .. }));
    }

    #[test]
    fn openai_reasoning_keeps_encrypted_content() {
        let mut history =
            HistoryIntegrityEnforcer::new(ProtocolFamily::OpenaiCompatible, Vec::new());
        let entry = history.append_assistant_entry(
            vec![ContentBlock::text("answer")],
            Some(ReasoningPayload {
                text: String::new(),
                signature: Some("ignored".to_string()),
                encrypted_content: Some("opaque".to_string()),
            }),
        );
        match &entry.content[0] {
            ContentBlock::Reasoning {
                encrypted_content, ..
            } => assert_eq!(encrypted_content.as_deref(), Some("opaque")),
            other => panic!("unexpected block: {other:?}"),
        }
    }
}
