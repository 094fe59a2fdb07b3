use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tether_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use tether_types::{
    AskResponse, AskType, ContentBlock, Role, SayType, StreamChunk, TranscriptEntry,
};

use crate::approval::ApprovalPolicy;
use crate::ask_say::{AskOptions, AskOutcome, AskSayController, AskTiming, SayOptions};
use crate::config::OrchestratorConfig;
use crate::delegation::ChildResult;
use crate::error::TaskError;
use crate::event_bus::EventBus;
use crate::history::{HistoryIntegrityEnforcer, ReasoningPayload, UserEntryRepair};
use crate::persistence::{save_with_retry, RetryPolicy, TaskPersistence};
use crate::repetition_guard::RepetitionDetection;
use crate::stream_assembler::{AssemblerStep, FinalizedToolCall, StreamAssembler};
use crate::token_cost::{Tokenizer, UsageReport};
use crate::tools::{ToolDispatch, ToolError};

const DELEGATION_PENDING: &str = "Delegated to a child task; its result is pending.";

/// Shared collaborators every task of a runtime uses.
#[derive(Clone)]
pub struct TaskDeps {
    pub config: Arc<OrchestratorConfig>,
    pub event_bus: EventBus,
    pub tokenizer: Arc<Tokenizer>,
    pub persistence: Arc<dyn TaskPersistence>,
    pub tools: Arc<dyn ToolDispatch>,
    pub policy: Arc<dyn ApprovalPolicy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub text: String,
    pub invocations: Vec<FinalizedToolCall>,
    pub usage: UsageReport,
    /// Set when the turn ended on a delegation call; the caller starts the
    /// child task.
    pub delegation: Option<FinalizedToolCall>,
    pub rejected: bool,
    pub finish_reason: Option<String>,
    pub pending_results: usize,
}

impl TurnOutcome {
    /// Tool results are waiting to be sent back to the model.
    pub fn needs_follow_up(&self) -> bool {
        self.delegation.is_none() && self.pending_results > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EchoKey {
    Text,
    Reasoning,
    Tool(String),
}

#[derive(Debug, Default)]
struct EchoState {
    key: Option<EchoKey>,
    start: usize,
}

/// One conversation: its message log, its transcript, and the turn loop that
/// feeds provider streams through both.
pub struct Task {
    id: String,
    parent_id: Option<String>,
    deps: TaskDeps,
    ask_say: AskSayController,
    history: HistoryIntegrityEnforcer,
    abort: CancellationToken,
    retry: RetryPolicy,
    pending_results: Vec<ContentBlock>,
    echo: EchoState,
    turns: u32,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("turns", &self.turns)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn new(id: impl Into<String>, parent_id: Option<String>, deps: TaskDeps) -> Self {
        let id = id.into();
        let abort = CancellationToken::new();
        let retry = RetryPolicy::new(deps.config.save_retry_backoff());
        let ask_say = AskSayController::new(
            id.clone(),
            deps.event_bus.clone(),
            deps.policy.clone(),
            deps.persistence.clone(),
            retry.clone(),
            AskTiming {
                status_delay: deps.config.status_promotion_delay(),
                poll_interval: deps.config.ask_poll_interval(),
            },
            abort.clone(),
        );
        let history = HistoryIntegrityEnforcer::new(
            deps.config.protocol_family,
            deps.config.delegation_tools.clone(),
        );
        Self {
            id,
            parent_id,
            deps,
            ask_say,
            history,
            abort,
            retry,
            pending_results: Vec::new(),
            echo: EchoState::default(),
            turns: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn ask_say(&self) -> &AskSayController {
        &self.ask_say
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.history.entries()
    }

    pub fn pending_results(&self) -> &[ContentBlock] {
        &self.pending_results
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Cancels in-flight waits and tool runs. The logs stay as they are.
    pub fn abort(&self) {
        if self.abort.is_cancelled() {
            return;
        }
        self.abort.cancel();
        self.deps
            .event_bus
            .publish_for_task(&self.id, "task.aborted", json!({}));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task.aborted",
                component: "task",
                task_id: Some(&self.id),
                status: Some("aborted"),
                ..ObservabilityEvent::default()
            },
        );
    }

    /// Loads both logs from persistence.
    pub async fn restore(&mut self) -> anyhow::Result<()> {
        let messages = self.deps.persistence.load_messages(&self.id).await?;
        let transcript = self.deps.persistence.load_transcript(&self.id).await?;
        self.ask_say.restore(messages).await;
        self.history = HistoryIntegrityEnforcer::from_entries(
            self.deps.config.protocol_family,
            self.deps.config.delegation_tools.clone(),
            transcript,
        );
        Ok(())
    }

    /// Appends a user entry made of any pending tool results followed by
    /// `content`.
    pub async fn submit_user_content(
        &mut self,
        content: Vec<ContentBlock>,
    ) -> Result<UserEntryRepair, TaskError> {
        let (repair, _) = self.append_user_content(content).await?;
        Ok(repair)
    }

    /// Like [`Task::submit_user_content`], but reports whether the transcript
    /// reached storage.
    pub(crate) async fn seed_user_content(
        &mut self,
        content: Vec<ContentBlock>,
    ) -> Result<bool, TaskError> {
        let (_, saved) = self.append_user_content(content).await?;
        Ok(saved)
    }

    async fn append_user_content(
        &mut self,
        content: Vec<ContentBlock>,
    ) -> Result<(UserEntryRepair, bool), TaskError> {
        self.ensure_active()?;
        let text = content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if !text.trim().is_empty() {
            let say_type = if self.history.is_empty() {
                SayType::Text
            } else {
                SayType::UserFeedback
            };
            let redacted = redact_text(&text);
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "task.user_input",
                    component: "task",
                    task_id: Some(&self.id),
                    detail: Some(&redacted),
                    ..ObservabilityEvent::default()
                },
            );
            self.ask_say.say(say_type, SayOptions::text(text)).await?;
        }

        let mut blocks = std::mem::take(&mut self.pending_results);
        blocks.extend(content);
        if blocks.is_empty() {
            return Ok((UserEntryRepair::default(), true));
        }
        let repair = self.history.append_user_entry(blocks);
        if !repair.is_clean() {
            let detail = format!(
                "reassigned={} rewritten={} synthesized={}",
                repair.reassigned, repair.rewritten, repair.synthesized
            );
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "transcript.repaired",
                    component: "history",
                    task_id: Some(&self.id),
                    detail: Some(&detail),
                    ..ObservabilityEvent::default()
                },
            );
        }
        let saved = self.save_transcript().await;
        Ok((repair, saved))
    }

    /// Drives one provider turn to completion: assembles the stream, records
    /// the assistant entry, then executes the resulting tool calls.
    pub async fn run_turn<S>(&mut self, stream: S) -> Result<TurnOutcome, TaskError>
    where
        S: Stream<Item = anyhow::Result<StreamChunk>>,
    {
        self.ensure_active()?;
        self.turns += 1;
        let turn_id = format!("{}.turn{}", self.id, self.turns);
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.start",
                component: "task",
                task_id: Some(&self.id),
                turn_id: Some(&turn_id),
                ..ObservabilityEvent::default()
            },
        );
        self.ask_say
            .say(
                SayType::ApiReqStarted,
                SayOptions::text(json!({ "turn": &turn_id }).to_string()).non_interactive(),
            )
            .await?;

        let mut assembler = StreamAssembler::new(
            self.deps.tokenizer.clone(),
            self.deps.config.repetition_guard,
        );
        self.echo = EchoState::default();
        tokio::pin!(stream);

        loop {
            let next = tokio::select! {
                _ = self.abort.cancelled() => return Err(TaskError::Aborted),
                item = stream.next() => item,
            };
            let Some(item) = next else { break };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let detail = err.to_string();
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "turn.stream.error",
                            component: "task",
                            task_id: Some(&self.id),
                            turn_id: Some(&turn_id),
                            status: Some("failed"),
                            error_code: Some("PROVIDER_STREAM_ERROR"),
                            detail: Some(&detail),
                            ..ObservabilityEvent::default()
                        },
                    );
                    self.ask_say.seal_partials().await;
                    self.ask_say
                        .say(SayType::Error, SayOptions::text(detail.clone()))
                        .await?;
                    return Err(TaskError::Stream(detail));
                }
            };

            let text_before = assembler.text().len();
            let reasoning_before = assembler.reasoning().len();
            match assembler.ingest(chunk) {
                AssemblerStep::Text => {
                    self.echo(EchoKey::Text, SayType::Text, assembler.text(), text_before)
                        .await?
                }
                AssemblerStep::Reasoning => {
                    self.echo(
                        EchoKey::Reasoning,
                        SayType::Reasoning,
                        assembler.reasoning(),
                        reasoning_before,
                    )
                    .await?
                }
                AssemblerStep::ToolCall(call) => {
                    let text = json!({
                        "tool": &call.name,
                        "id": &call.id,
                        "arguments": &call.arguments,
                    })
                    .to_string();
                    self.echo(EchoKey::Tool(call.id), SayType::Tool, &text, 0)
                        .await?
                }
                AssemblerStep::DeadLoop(detection) => {
                    return Err(self.fail_dead_loop(&turn_id, detection).await);
                }
                AssemblerStep::Done => break,
                AssemblerStep::Continue => {}
            }
        }
        self.ensure_active()?;
        self.ask_say.seal_partials().await;

        let turn = assembler.finish();
        let usage = turn.estimator.reconcile(
            self.history.entries(),
            self.deps.config.protocol_family,
            &self.deps.config.pricing,
        );
        self.ask_say
            .say(
                SayType::ApiReqFinished,
                SayOptions::text(serde_json::to_string(&usage).unwrap_or_default())
                    .non_interactive(),
            )
            .await?;

        let mut calls = turn.tool_calls;
        for call in &mut calls {
            call.dispatch_name = self.deps.tools.canonical_name(&call.name);
        }
        let mut built = self.history.build_assistant_content(&turn.text, &calls);
        let cut_off = self
            .history
            .enforce_delegation_isolation(&mut built.content, &mut built.invocations);

        let reasoning = ReasoningPayload {
            text: turn.reasoning,
            signature: turn.reasoning_signature,
            encrypted_content: turn.reasoning_encrypted,
        };
        if built.content.is_empty() && reasoning.text.trim().is_empty() {
            self.ask_say
                .say(
                    SayType::Error,
                    SayOptions::text("The model returned no assistant content."),
                )
                .await?;
            return Ok(TurnOutcome {
                turn_id,
                text: turn.text,
                invocations: Vec::new(),
                usage,
                delegation: None,
                rejected: false,
                finish_reason: turn.finish_reason,
                pending_results: self.pending_results.len(),
            });
        }
        self.history
            .append_assistant_entry(built.content, Some(reasoning));
        self.save_transcript().await;
        self.pending_results.extend(cut_off);

        let (delegation, rejected) = self.execute_invocations(&turn_id, &built.invocations).await?;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.finish",
                component: "task",
                task_id: Some(&self.id),
                turn_id: Some(&turn_id),
                status: Some(if delegation.is_some() { "delegated" } else { "completed" }),
                ..ObservabilityEvent::default()
            },
        );

        Ok(TurnOutcome {
            turn_id,
            text: turn.text,
            invocations: built.invocations,
            usage,
            delegation,
            rejected,
            finish_reason: turn.finish_reason,
            pending_results: self.pending_results.len(),
        })
    }

    async fn execute_invocations(
        &mut self,
        turn_id: &str,
        invocations: &[FinalizedToolCall],
    ) -> Result<(Option<FinalizedToolCall>, bool), TaskError> {
        let mut delegation = None;
        let mut rejected = false;

        for call in invocations {
            self.ensure_active()?;
            if self.history.is_delegation_tool(&call.name) {
                delegation = Some(call.clone());
                continue;
            }
            if rejected {
                self.pending_results.push(ContentBlock::tool_error(
                    &call.id,
                    format!(
                        "Tool `{}` was skipped because the user rejected a previous tool in this turn.",
                        call.name
                    ),
                ));
                continue;
            }
            if let Some(detail) = &call.parse_error {
                let err = ToolError::InvalidArguments {
                    tool: call.name.clone(),
                    detail: detail.clone(),
                };
                self.ask_say
                    .say(SayType::Error, SayOptions::text(err.to_string()))
                    .await?;
                self.pending_results
                    .push(ContentBlock::tool_error(&call.id, err.to_string()));
                continue;
            }

            let mut feedback = None;
            if self.deps.tools.requires_approval(&call.dispatch_name) {
                let text = json!({
                    "tool": &call.name,
                    "id": &call.id,
                    "input": &call.input,
                })
                .to_string();
                match self
                    .ask_say
                    .ask(AskType::Tool, Some(text), AskOptions::default())
                    .await?
                {
                    AskOutcome::Answered(reply) if reply.response == AskResponse::YesButtonClicked => {
                        feedback = reply.text;
                    }
                    AskOutcome::Answered(reply) => {
                        rejected = true;
                        let mut message = "The user denied this operation.".to_string();
                        if let Some(text) = reply.text.filter(|t| !t.trim().is_empty()) {
                            message.push_str(&format!(" The user said: {text}"));
                        }
                        self.pending_results
                            .push(ContentBlock::tool_error(&call.id, message));
                        continue;
                    }
                    AskOutcome::Superseded(_) => {
                        self.pending_results.push(ContentBlock::tool_error(
                            &call.id,
                            "The approval request was superseded before an answer arrived.",
                        ));
                        continue;
                    }
                }
            }

            match self
                .deps
                .tools
                .execute(call, self.abort.child_token())
                .await
            {
                Ok(output) => {
                    self.ask_say
                        .say(SayType::ToolResult, SayOptions::text(output.output.clone()))
                        .await?;
                    let mut content = output.output;
                    if let Some(text) = feedback {
                        content.push_str(&format!("\n\nThe user approved with feedback: {text}"));
                    }
                    self.pending_results
                        .push(ContentBlock::tool_result(&call.id, content));
                }
                Err(ToolError::Cancelled(_)) if self.abort.is_cancelled() => {
                    return Err(TaskError::Aborted);
                }
                Err(err) => {
                    let detail = err.to_string();
                    emit_event(
                        Level::WARN,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "tool.failed",
                            component: "task",
                            task_id: Some(&self.id),
                            turn_id: Some(turn_id),
                            tool_id: Some(&call.id),
                            detail: Some(&detail),
                            ..ObservabilityEvent::default()
                        },
                    );
                    self.pending_results
                        .push(ContentBlock::tool_error(&call.id, detail));
                }
            }
        }

        Ok((delegation, rejected))
    }

    /// Persists the transcript plus a provisional user entry holding pending
    /// tool results, without changing the in-memory transcript. Run before a
    /// child task starts. Open delegation calls get a placeholder result so
    /// the saved entry pairs cleanly.
    pub async fn flush_pending_for_delegation(&self) -> bool {
        let mut staged: Vec<ContentBlock> = self
            .open_delegation_ids()
            .into_iter()
            .filter(|id| {
                !self
                    .pending_results
                    .iter()
                    .any(|block| block.tool_result_id() == Some(id.as_str()))
            })
            .map(|id| ContentBlock::tool_result(id, DELEGATION_PENDING))
            .collect();
        staged.extend(self.pending_results.iter().cloned());

        let mut snapshot = self.history.entries().to_vec();
        if !staged.is_empty() {
            let (content, _) = self.history.repair_user_content(staged);
            if !content.is_empty() {
                snapshot.push(TranscriptEntry::new(Role::User, content));
            }
        }
        let messages_saved = self.ask_say.persist_messages().await;
        let transcript_saved = self.save_snapshot(&snapshot).await;
        messages_saved && transcript_saved
    }

    /// Takes a finished child's result as the answer to the delegation call.
    pub async fn absorb_child_result(&mut self, child: ChildResult) -> Result<(), TaskError> {
        let summary = match &child.result {
            ContentBlock::ToolResult { content, .. } => content.clone(),
            other => other.plain_text(),
        };
        self.pending_results.push(child.result);
        self.ask_say
            .say(SayType::SubtaskResult, SayOptions::text(summary))
            .await?;
        Ok(())
    }

    pub async fn save_transcript(&self) -> bool {
        self.save_snapshot(self.history.entries()).await
    }

    async fn save_snapshot(&self, transcript: &[TranscriptEntry]) -> bool {
        let persistence = self.deps.persistence.clone();
        let saved = save_with_retry(&self.retry, "api_conversation_history", || {
            let persistence = persistence.clone();
            async move { persistence.save_transcript(&self.id, transcript).await }
        })
        .await;
        if !saved {
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "transcript.save.failed",
                    component: "task",
                    task_id: Some(&self.id),
                    status: Some("failed"),
                    ..ObservabilityEvent::default()
                },
            );
        }
        saved
    }

    async fn echo(
        &mut self,
        key: EchoKey,
        say_type: SayType,
        full: &str,
        len_before: usize,
    ) -> Result<(), TaskError> {
        if self.echo.key.as_ref() != Some(&key) {
            if self.echo.key.is_some() {
                self.ask_say.seal_partials().await;
            }
            self.echo.key = Some(key);
            self.echo.start = len_before;
        }
        let segment = full.get(self.echo.start..).unwrap_or(full);
        self.ask_say
            .say(say_type, SayOptions::text(segment).partial(true))
            .await?;
        Ok(())
    }

    async fn fail_dead_loop(&mut self, turn_id: &str, detection: RepetitionDetection) -> TaskError {
        self.ask_say.seal_partials().await;
        let message = format!(
            "Stopped this turn: the model's reasoning is repeating itself ({}).",
            detection.kind
        );
        if let Err(err) = self.ask_say.say(SayType::Error, SayOptions::text(message)).await {
            tracing::debug!(error = %err, "could not record dead-loop notice");
        }
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.dead_loop",
                component: "task",
                task_id: Some(&self.id),
                turn_id: Some(turn_id),
                status: Some("failed"),
                error_code: Some("DEAD_LOOP_DETECTED"),
                detail: Some(&detection.details),
                ..ObservabilityEvent::default()
            },
        );
        TaskError::DeadLoopDetected {
            kind: detection.kind,
            details: detection.details,
        }
    }

    fn open_delegation_ids(&self) -> Vec<String> {
        match self.history.last_effective() {
            Some(entry) if entry.role == Role::Assistant => entry
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, .. } if self.history.is_delegation_tool(name) => {
                        Some(id.clone())
                    }
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn ensure_active(&self) -> Result<(), TaskError> {
        if self.abort.is_cancelled() {
            return Err(TaskError::Aborted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{AskEveryTime, RuleApprovalPolicy};
    use crate::persistence::MemoryPersistence;
    use crate::tools::DryRunTools;
    use tether_types::{AskReply, MessageKind};

    fn deps_with(
        policy: Arc<dyn ApprovalPolicy>,
        persistence: Arc<MemoryPersistence>,
    ) -> TaskDeps {
        TaskDeps {
            config: Arc::new(OrchestratorConfig::default()),
            event_bus: EventBus::new(),
            tokenizer: Arc::new(Tokenizer::new().expect("tokenizer")),
            persistence,
            tools: Arc::new(DryRunTools::new()),
            policy,
        }
    }

    fn chunks(items: Vec<StreamChunk>) -> impl Stream<Item = anyhow::Result<StreamChunk>> {
        futures::stream::iter(items.into_iter().map(Ok))
    }

    fn text(t: &str) -> StreamChunk {
        StreamChunk::TextDelta {
            text: t.to_string(),
        }
    }

    fn tool_end(id: &str, name: &str, args: &str) -> StreamChunk {
        StreamChunk::ToolCallEnd {
            id: id.to_string(),
            name: Some(name.to_string()),
            arguments: Some(args.to_string()),
        }
    }

    fn done() -> StreamChunk {
        StreamChunk::Done {
            finish_reason: Some("stop".to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn text_turn_appends_assistant_entry_and_persists() {
        let store = Arc::new(MemoryPersistence::new());
        let mut task = Task::new("task_t1", None, deps_with(Arc::new(AskEveryTime), store.clone()));
        task.submit_user_content(vec![ContentBlock::text("hello")])
            .await
            .expect("submit");

        let outcome = task
            .run_turn(chunks(vec![text("Hi "), text("there."), done()]))
            .await
            .expect("turn");

        assert_eq!(outcome.text, "Hi there.");
        assert!(!outcome.needs_follow_up());
        assert_eq!(task.transcript().len(), 2);
        assert_eq!(task.transcript()[1].role, Role::Assistant);
        assert_eq!(
            store.load_transcript("task_t1").await.expect("load").len(),
            2
        );

        let messages = task.ask_say().messages().await;
        assert!(messages.iter().all(|m| !m.partial));
        let text_entries: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == MessageKind::Say(SayType::Text))
            .collect();
        assert_eq!(text_entries.last().and_then(|m| m.text.as_deref()), Some("Hi there."));
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_tools_run_without_approval() {
        let store = Arc::new(MemoryPersistence::new());
        let mut task = Task::new("task_t2", None, deps_with(Arc::new(AskEveryTime), store));
        task.submit_user_content(vec![ContentBlock::text("list it")])
            .await
            .expect("submit");

        let outcome = task
            .run_turn(chunks(vec![
                tool_end("c1", "list_files", r#"{"path":"."}"#),
                done(),
            ]))
            .await
            .expect("turn");

        assert!(outcome.needs_follow_up());
        assert_eq!(task.pending_results().len(), 1);
        assert_eq!(task.pending_results()[0].tool_result_id(), Some("c1"));

        task.submit_user_content(Vec::new()).await.expect("follow-up");
        assert!(task.pending_results().is_empty());
        assert_eq!(task.transcript()[2].content[0].tool_result_id(), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_tool_skips_the_rest_of_the_turn() {
        let store = Arc::new(MemoryPersistence::new());
        let mut task = Task::new("task_t3", None, deps_with(Arc::new(AskEveryTime), store));
        task.submit_user_content(vec![ContentBlock::text("edit")])
            .await
            .expect("submit");
        let controller = task.ask_say().clone();

        let responder = tokio::spawn(async move {
            loop {
                if let Some(pending) = controller.pending_ask().await {
                    if pending.ask_type == AskType::Tool {
                        let mut reply = AskReply::new(AskResponse::NoButtonClicked);
                        reply.text = Some("not that file".to_string());
                        controller.respond(reply).await;
                        return;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        let outcome = task
            .run_turn(chunks(vec![
                tool_end("w1", "write_to_file", r#"{"path":"a.rs"}"#),
                tool_end("w2", "write_to_file", r#"{"path":"b.rs"}"#),
                done(),
            ]))
            .await
            .expect("turn");
        responder.await.expect("responder");

        assert!(outcome.rejected);
        let results = task.pending_results();
        assert_eq!(results.len(), 2);
        match &results[0] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert!(is_error);
                assert!(content.contains("not that file"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
        assert_eq!(results[1].tool_result_id(), Some("w2"));
    }

    #[tokio::test(start_paused = true)]
    async fn delegation_cuts_off_later_calls() {
        let store = Arc::new(MemoryPersistence::new());
        let policy = Arc::new(RuleApprovalPolicy::allow_all_tools());
        let mut task = Task::new("task_t4", None, deps_with(policy, store));
        task.submit_user_content(vec![ContentBlock::text("split it up")])
            .await
            .expect("submit");

        let outcome = task
            .run_turn(chunks(vec![
                tool_end("d1", "new_task", r#"{"message":"do part one"}"#),
                tool_end("x1", "read_file", r#"{"path":"a.rs"}"#),
                done(),
            ]))
            .await
            .expect("turn");

        assert_eq!(outcome.delegation.as_ref().map(|c| c.id.as_str()), Some("d1"));
        assert!(!outcome.needs_follow_up());
        let assistant = &task.transcript()[1];
        assert_eq!(assistant.tool_use_ids().collect::<Vec<_>>(), vec!["d1"]);
        assert_eq!(task.pending_results().len(), 1);
        assert_eq!(task.pending_results()[0].tool_result_id(), Some("x1"));
    }

    #[tokio::test(start_paused = true)]
    async fn delegation_flush_persists_only_paired_results() {
        let store = Arc::new(MemoryPersistence::new());
        let policy = Arc::new(RuleApprovalPolicy::allow_all_tools());
        let mut task = Task::new("task_t10", None, deps_with(policy, store.clone()));
        task.submit_user_content(vec![ContentBlock::text("split it up")])
            .await
            .expect("submit");
        task.run_turn(chunks(vec![
            tool_end("d1", "new_task", r#"{"message":"do part one"}"#),
            tool_end("x1", "read_file", r#"{"path":"a.rs"}"#),
            done(),
        ]))
        .await
        .expect("turn");

        assert!(task.flush_pending_for_delegation().await);
        assert_eq!(task.transcript().len(), 2);

        let persisted = store.load_transcript("task_t10").await.expect("load");
        assert_eq!(persisted.len(), 3);
        let assistant_ids: Vec<&str> = persisted[1].tool_use_ids().collect();
        let last = &persisted[2];
        assert_eq!(last.role, Role::User);
        let result_ids: Vec<&str> = last
            .content
            .iter()
            .filter_map(ContentBlock::tool_result_id)
            .collect();
        assert_eq!(result_ids, vec!["d1"]);
        assert!(result_ids.iter().all(|id| assistant_ids.contains(id)));
        assert!(last
            .content
            .iter()
            .any(|block| block.plain_text().contains("[Tool result for x1]")));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_arguments_are_reported_not_dispatched() {
        let store = Arc::new(MemoryPersistence::new());
        let policy = Arc::new(RuleApprovalPolicy::allow_all_tools());
        let mut task = Task::new("task_t5", None, deps_with(policy, store));
        task.submit_user_content(vec![ContentBlock::text("go")])
            .await
            .expect("submit");

        task.run_turn(chunks(vec![tool_end("b1", "read_file", r#"{"path": "#), done()]))
            .await
            .expect("turn");

        match &task.pending_results()[0] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert!(is_error);
                assert!(content.contains("invalid arguments"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dead_loop_fails_the_turn_without_assistant_entry() {
        let store = Arc::new(MemoryPersistence::new());
        let mut task = Task::new("task_t6", None, deps_with(Arc::new(AskEveryTime), store));
        task.submit_user_content(vec![ContentBlock::text("think")])
            .await
            .expect("submit");

        let mut items = vec![StreamChunk::ReasoningDelta {
            text: "x".repeat(1_900),
        }];
        for _ in 0..100 {
            items.push(StreamChunk::ReasoningDelta {
                text: "好的好的".to_string(),
            });
        }
        items.push(done());

        let err = task.run_turn(chunks(items)).await.expect_err("dead loop");
        assert!(matches!(err, TaskError::DeadLoopDetected { .. }));
        assert_eq!(task.transcript().len(), 1);
        let messages = task.ask_say().messages().await;
        assert_eq!(
            messages.last().map(|m| m.kind),
            Some(MessageKind::Say(SayType::Error))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_is_surfaced() {
        let store = Arc::new(MemoryPersistence::new());
        let mut task = Task::new("task_t7", None, deps_with(Arc::new(AskEveryTime), store));
        let stream = futures::stream::iter(vec![
            Ok(text("partial")),
            Err(anyhow::anyhow!("connection reset")),
        ]);
        let err = task.run_turn(stream).await.expect_err("stream error");
        assert!(matches!(err, TaskError::Stream(ref detail) if detail.contains("connection reset")));

        let messages = task.ask_say().messages().await;
        assert!(messages.iter().all(|m| !m.partial));
        assert!(messages
            .iter()
            .any(|m| m.kind == MessageKind::Say(SayType::Error)));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_task_refuses_new_turns() {
        let store = Arc::new(MemoryPersistence::new());
        let mut task = Task::new("task_t8", None, deps_with(Arc::new(AskEveryTime), store));
        task.abort();
        assert!(task.is_aborted());
        assert!(matches!(
            task.run_turn(chunks(vec![done()])).await,
            Err(TaskError::Aborted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn usage_falls_back_to_local_estimate() {
        let store = Arc::new(MemoryPersistence::new());
        let mut task = Task::new("task_t9", None, deps_with(Arc::new(AskEveryTime), store));
        task.submit_user_content(vec![ContentBlock::text("count me")])
            .await
            .expect("submit");
        let outcome = task
            .run_turn(chunks(vec![
                text("a reply with several tokens"),
                StreamChunk::Usage(Default::default()),
                done(),
            ]))
            .await
            .expect("turn");
        assert!(outcome.usage.estimated);
        assert!(outcome.usage.usage.output_tokens > 0);
        assert!(outcome.usage.usage.input_tokens > 0);
    }
}
