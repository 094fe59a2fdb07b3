use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tether_types::{AskReply, AskResponse, AskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Allow,
    Deny,
    Ask,
}

/// One policy rule. `ask_type` and `pattern` accept `*` wildcards; the
/// pattern is matched against the ask's subject (tool name, command head, or
/// the ask type itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    #[serde(default = "new_rule_id")]
    pub id: String,
    pub ask_type: String,
    #[serde(default = "wildcard")]
    pub pattern: String,
    pub action: ApprovalAction,
    /// For `ask` rules on follow-up questions: auto-answer with the first
    /// suggestion once this much time passes without a human reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn new_rule_id() -> String {
    Uuid::new_v4().to_string()
}

fn wildcard() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
    /// Leave the ask to the user, but answer with `fallback` after `after`.
    Timeout { after: Duration, fallback: AskReply },
    Ask,
}

#[derive(Debug, Clone, Copy)]
pub struct ApprovalContext<'a> {
    pub task_id: &'a str,
    /// Asks approved by policy since the user last answered one.
    pub consecutive_auto_approvals: u32,
}

/// Decides whether an ask can be answered without the user. Implementations
/// must be pure: no I/O, no waiting.
pub trait ApprovalPolicy: Send + Sync {
    fn decide(&self, ctx: &ApprovalContext<'_>, ask_type: AskType, text: Option<&str>)
        -> ApprovalDecision;
}

/// Always defers to the user.
#[derive(Debug, Default, Clone, Copy)]
pub struct AskEveryTime;

impl ApprovalPolicy for AskEveryTime {
    fn decide(&self, _: &ApprovalContext<'_>, _: AskType, _: Option<&str>) -> ApprovalDecision {
        ApprovalDecision::Ask
    }
}

/// Rule list evaluated last-match-wins.
#[derive(Debug, Default)]
pub struct RuleApprovalPolicy {
    rules: RwLock<Vec<ApprovalRule>>,
    max_consecutive: Option<u32>,
}

impl RuleApprovalPolicy {
    pub fn new(rules: Vec<ApprovalRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            max_consecutive: None,
        }
    }

    /// Approves every tool-approval ask. Questions still go to the user.
    pub fn allow_all_tools() -> Self {
        Self::new(vec![
            ApprovalRule {
                id: new_rule_id(),
                ask_type: "tool".to_string(),
                pattern: wildcard(),
                action: ApprovalAction::Allow,
                timeout_ms: None,
            },
            ApprovalRule {
                id: new_rule_id(),
                ask_type: "command".to_string(),
                pattern: wildcard(),
                action: ApprovalAction::Allow,
                timeout_ms: None,
            },
            ApprovalRule {
                id: new_rule_id(),
                ask_type: "use_mcp_server".to_string(),
                pattern: wildcard(),
                action: ApprovalAction::Allow,
                timeout_ms: None,
            },
            ApprovalRule {
                id: new_rule_id(),
                ask_type: "browser_action_launch".to_string(),
                pattern: wildcard(),
                action: ApprovalAction::Allow,
                timeout_ms: None,
            },
        ])
    }

    /// Caps how many asks in a row may be approved without the user.
    pub fn with_max_consecutive(mut self, max: u32) -> Self {
        self.max_consecutive = Some(max);
        self
    }

    pub fn add_rule(&self, rule: ApprovalRule) {
        if let Ok(mut rules) = self.rules.write() {
            rules.push(rule);
        }
    }

    pub fn list_rules(&self) -> Vec<ApprovalRule> {
        self.rules.read().map(|rules| rules.clone()).unwrap_or_default()
    }

    pub fn evaluate(&self, ask_type: AskType, subject: &str) -> Option<ApprovalRule> {
        let kind = normalize_alias(ask_type.as_str());
        let subject = normalize_alias(subject);
        let rules = self.rules.read().ok()?;
        rules
            .iter()
            .rev()
            .find(|rule| {
                wildcard_matches(&normalize_alias(&rule.ask_type), &kind)
                    && wildcard_matches(&normalize_alias(&rule.pattern), &subject)
            })
            .cloned()
    }
}

impl ApprovalPolicy for RuleApprovalPolicy {
    fn decide(
        &self,
        ctx: &ApprovalContext<'_>,
        ask_type: AskType,
        text: Option<&str>,
    ) -> ApprovalDecision {
        let subject = ask_subject(ask_type, text);
        let Some(rule) = self.evaluate(ask_type, &subject) else {
            return ApprovalDecision::Ask;
        };
        match rule.action {
            ApprovalAction::Allow => {
                if let Some(max) = self.max_consecutive {
                    if ctx.consecutive_auto_approvals >= max {
                        tracing::info!(
                            task_id = ctx.task_id,
                            max,
                            "auto-approval limit reached, deferring to user"
                        );
                        return ApprovalDecision::Ask;
                    }
                }
                ApprovalDecision::Approve
            }
            ApprovalAction::Deny => ApprovalDecision::Deny,
            ApprovalAction::Ask => match (rule.timeout_ms, first_suggestion(text)) {
                (Some(ms), Some(answer)) if ask_type == AskType::Followup => {
                    ApprovalDecision::Timeout {
                        after: Duration::from_millis(ms),
                        fallback: AskReply {
                            response: AskResponse::MessageResponse,
                            text: Some(answer),
                            images: Vec::new(),
                        },
                    }
                }
                _ => ApprovalDecision::Ask,
            },
        }
    }
}

/// What a rule pattern is matched against.
pub fn ask_subject(ask_type: AskType, text: Option<&str>) -> String {
    let text = text.unwrap_or_default();
    match ask_type {
        AskType::Tool | AskType::UseMcpServer => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| {
                value
                    .get("tool")
                    .or_else(|| value.get("name"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| ask_type.as_str().to_string()),
        AskType::Command => text
            .split_whitespace()
            .next()
            .map(ToString::to_string)
            .unwrap_or_default(),
        other => other.as_str().to_string(),
    }
}

fn first_suggestion(text: Option<&str>) -> Option<String> {
    let value: Value = serde_json::from_str(text?).ok()?;
    let first = value.get("suggest")?.as_array()?.first()?;
    first
        .get("answer")
        .and_then(Value::as_str)
        .or_else(|| first.as_str())
        .map(ToString::to_string)
}

fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let mut is_first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            continue;
        }
        if is_first {
            match remaining.strip_prefix(part) {
                Some(stripped) => remaining = stripped,
                None => return false,
            }
            is_first = false;
            continue;
        }
        match remaining.find(part) {
            Some(index) => remaining = &remaining[index + part.len()..],
            None => return false,
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}

fn normalize_alias(input: &str) -> String {
    input.trim().to_ascii_lowercase().replace('-', "_")
}
