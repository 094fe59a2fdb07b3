use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskType {
    Followup,
    Command,
    CommandOutput,
    CompletionResult,
    Tool,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
    MistakeLimitReached,
    BrowserActionLaunch,
    UseMcpServer,
    AutoApprovalMaxReqReached,
}

/// Transient task status a blocking ask is promoted to once the turn goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskStatus {
    Interactive,
    Resumable,
    Idle,
}

impl AskStatus {
    pub fn event_type(self) -> &'static str {
        match self {
            AskStatus::Interactive => "task.interactive",
            AskStatus::Resumable => "task.resumable",
            AskStatus::Idle => "task.idle",
        }
    }
}

impl AskType {
    pub fn as_str(self) -> &'static str {
        match self {
            AskType::Followup => "followup",
            AskType::Command => "command",
            AskType::CommandOutput => "command_output",
            AskType::CompletionResult => "completion_result",
            AskType::Tool => "tool",
            AskType::ApiReqFailed => "api_req_failed",
            AskType::ResumeTask => "resume_task",
            AskType::ResumeCompletedTask => "resume_completed_task",
            AskType::MistakeLimitReached => "mistake_limit_reached",
            AskType::BrowserActionLaunch => "browser_action_launch",
            AskType::UseMcpServer => "use_mcp_server",
            AskType::AutoApprovalMaxReqReached => "auto_approval_max_req_reached",
        }
    }

    /// Asks that gate a side effect and are answered with yes/no.
    pub fn is_tool_approval(self) -> bool {
        matches!(
            self,
            AskType::Tool | AskType::Command | AskType::BrowserActionLaunch | AskType::UseMcpServer
        )
    }

    pub fn status(self) -> Option<AskStatus> {
        match self {
            AskType::Followup
            | AskType::Command
            | AskType::Tool
            | AskType::BrowserActionLaunch
            | AskType::UseMcpServer => Some(AskStatus::Interactive),
            AskType::ResumeTask => Some(AskStatus::Resumable),
            AskType::CompletionResult
            | AskType::ApiReqFailed
            | AskType::ResumeCompletedTask
            | AskType::MistakeLimitReached
            | AskType::AutoApprovalMaxReqReached => Some(AskStatus::Idle),
            AskType::CommandOutput => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayType {
    Text,
    Reasoning,
    Error,
    ApiReqStarted,
    ApiReqFinished,
    UserFeedback,
    /// Live echo of a tool call while its arguments stream in.
    Tool,
    ToolResult,
    CommandOutput,
    CompletionResult,
    SubtaskResult,
    CondenseContext,
}

impl SayType {
    pub fn as_str(self) -> &'static str {
        match self {
            SayType::Text => "text",
            SayType::Reasoning => "reasoning",
            SayType::Error => "error",
            SayType::ApiReqStarted => "api_req_started",
            SayType::ApiReqFinished => "api_req_finished",
            SayType::UserFeedback => "user_feedback",
            SayType::Tool => "tool",
            SayType::ToolResult => "tool_result",
            SayType::CommandOutput => "command_output",
            SayType::CompletionResult => "completion_result",
            SayType::SubtaskResult => "subtask_result",
            SayType::CondenseContext => "condense_context",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "subtype", rename_all = "snake_case")]
pub enum MessageKind {
    Ask(AskType),
    Say(SayType),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Entry of the user-facing message log.
///
/// `ts` doubles as the entry's identity: it is assigned once when the entry is
/// first emitted (partial or complete) and never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub ts: i64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub is_answered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_status: Option<ProgressStatus>,
    #[serde(default)]
    pub is_protected: bool,
}

impl ConversationMessage {
    pub fn new(ts: i64, kind: MessageKind, text: Option<String>) -> Self {
        Self {
            ts,
            kind,
            text,
            images: Vec::new(),
            partial: false,
            is_answered: false,
            progress_status: None,
            is_protected: false,
        }
    }

    pub fn ask_type(&self) -> Option<AskType> {
        match self.kind {
            MessageKind::Ask(ask) => Some(ask),
            MessageKind::Say(_) => None,
        }
    }

    pub fn say_type(&self) -> Option<SayType> {
        match self.kind {
            MessageKind::Say(say) => Some(say),
            MessageKind::Ask(_) => None,
        }
    }
}

/// Answer given to an ask, either by the user or by the approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AskResponse {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
}

impl AskResponse {
    pub fn is_affirmative(self) -> bool {
        matches!(self, AskResponse::YesButtonClicked | AskResponse::MessageResponse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskReply {
    pub response: AskResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskReply {
    pub fn new(response: AskResponse) -> Self {
        Self {
            response,
            text: None,
            images: Vec::new(),
        }
    }
}

/// Follow-up message typed by the user while the task was busy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub text: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_serializes_with_subtype() {
        let msg = ConversationMessage::new(
            1,
            MessageKind::Ask(AskType::Followup),
            Some("which file?".to_string()),
        );
        let raw = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(raw["kind"]["type"], "ask");
        assert_eq!(raw["kind"]["subtype"], "followup");
        assert!(raw.get("images").is_none());
    }

    #[test]
    fn ask_types_map_to_status_classes() {
        assert_eq!(AskType::Tool.status(), Some(AskStatus::Interactive));
        assert_eq!(AskType::ResumeTask.status(), Some(AskStatus::Resumable));
        assert_eq!(AskType::CompletionResult.status(), Some(AskStatus::Idle));
        assert_eq!(AskType::CommandOutput.status(), None);
        assert!(AskType::UseMcpServer.is_tool_approval());
        assert!(!AskType::Followup.is_tool_approval());
    }
}
