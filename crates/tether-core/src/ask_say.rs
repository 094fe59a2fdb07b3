//! The user-facing message log of one task and the blocking ask protocol.
//!
//! An ask appends (or finalizes) an entry and waits until the host answers,
//! the approval policy answers, a queued user message answers, or a newer
//! entry supersedes it. Waiting combines change notification with a short
//! poll so a lost wakeup only costs one poll interval.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_types::{
    AskReply, AskResponse, AskStatus, AskType, ConversationMessage, MessageKind, ProgressStatus,
    QueuedMessage, SayType,
};

use crate::approval::{ApprovalContext, ApprovalDecision, ApprovalPolicy};
use crate::clock::MessageClock;
use crate::error::TaskError;
use crate::event_bus::EventBus;
use crate::persistence::{save_with_retry, RetryPolicy, TaskPersistence};

#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// `Some(true)` streams a partial entry, `Some(false)` finalizes one.
    pub partial: Option<bool>,
    pub progress_status: Option<ProgressStatus>,
    pub is_protected: bool,
}

impl AskOptions {
    pub fn partial() -> Self {
        Self {
            partial: Some(true),
            ..Self::default()
        }
    }

    pub fn finalize() -> Self {
        Self {
            partial: Some(false),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SayOptions {
    pub text: Option<String>,
    pub images: Vec<String>,
    pub partial: Option<bool>,
    pub progress_status: Option<ProgressStatus>,
    /// Background notices. They never move the last-activity timestamp, so
    /// they cannot supersede a pending ask.
    pub non_interactive: bool,
}

impl SayOptions {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = Some(partial);
        self
    }

    pub fn non_interactive(mut self) -> Self {
        self.non_interactive = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Supersession {
    /// A partial ask updated the existing partial entry in place.
    ByUpdate,
    /// A partial ask created a new partial entry.
    ByNewPartial,
    /// A newer entry took over while this ask was waiting.
    ByLaterMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AskOutcome {
    Answered(AskReply),
    Superseded(Supersession),
}

impl AskOutcome {
    pub fn reply(&self) -> Option<&AskReply> {
        match self {
            AskOutcome::Answered(reply) => Some(reply),
            AskOutcome::Superseded(_) => None,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, AskOutcome::Answered(reply) if reply.response == AskResponse::YesButtonClicked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SayOutcome {
    Created(i64),
    Updated(i64),
}

impl SayOutcome {
    pub fn ts(self) -> i64 {
        match self {
            SayOutcome::Created(ts) | SayOutcome::Updated(ts) => ts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AskResolution {
    Unresolved,
    Resolved(AskReply),
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAsk {
    pub ask_type: AskType,
    pub text: Option<String>,
    pub ts: i64,
    pub resolution: AskResolution,
}

#[derive(Debug, Clone, Copy)]
pub struct AskTiming {
    pub status_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for AskTiming {
    fn default() -> Self {
        Self {
            status_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct AskState {
    messages: Vec<ConversationMessage>,
    pending: Option<PendingAsk>,
    reply: Option<AskReply>,
    last_message_ts: Option<i64>,
    queue: VecDeque<QueuedMessage>,
    status: Option<AskStatus>,
    auto_answer_timer: Option<AbortHandle>,
    consecutive_auto_approvals: u32,
}

impl AskState {
    /// Moves the last-activity marker; an unresolved ask on another entry is
    /// superseded by this.
    fn touch(&mut self, ts: i64) {
        self.last_message_ts = Some(ts);
        if let Some(pending) = self.pending.as_mut() {
            if pending.ts != ts && pending.resolution == AskResolution::Unresolved {
                pending.resolution = AskResolution::Superseded;
            }
        }
    }

    fn last_is_partial(&self, kind: MessageKind) -> bool {
        self.messages
            .last()
            .map(|m| m.partial && m.kind == kind)
            .unwrap_or(false)
    }

    fn take_auto_answer_timer(&mut self) {
        if let Some(timer) = self.auto_answer_timer.take() {
            timer.abort();
        }
    }
}

/// Aborts the timers armed for one ask when that ask returns, whichever way.
struct ArmedTimers(Vec<AbortHandle>);

impl Drop for ArmedTimers {
    fn drop(&mut self) {
        for timer in &self.0 {
            timer.abort();
        }
    }
}

struct Inner {
    task_id: String,
    state: Mutex<AskState>,
    revision: watch::Sender<u64>,
    clock: MessageClock,
    event_bus: EventBus,
    policy: Arc<dyn ApprovalPolicy>,
    persistence: Arc<dyn TaskPersistence>,
    retry: RetryPolicy,
    timing: AskTiming,
    abort: CancellationToken,
}

/// Owns the message log and the ask/say protocol of one task. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct AskSayController {
    inner: Arc<Inner>,
}

impl AskSayController {
    pub fn new(
        task_id: impl Into<String>,
        event_bus: EventBus,
        policy: Arc<dyn ApprovalPolicy>,
        persistence: Arc<dyn TaskPersistence>,
        retry: RetryPolicy,
        timing: AskTiming,
        abort: CancellationToken,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                task_id: task_id.into(),
                state: Mutex::new(AskState::default()),
                revision,
                clock: MessageClock::new(),
                event_bus,
                policy,
                persistence,
                retry,
                timing,
                abort,
            }),
        }
    }

    /// Restores a persisted log. Partial entries left by a crash are closed.
    pub async fn restore(&self, mut messages: Vec<ConversationMessage>) {
        for message in &mut messages {
            message.partial = false;
            self.inner.clock.observe(message.ts);
        }
        let mut state = self.inner.state.lock().await;
        state.last_message_ts = messages.last().map(|m| m.ts);
        state.messages = messages;
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub async fn messages(&self) -> Vec<ConversationMessage> {
        self.inner.state.lock().await.messages.clone()
    }

    pub async fn message_at(&self, ts: i64) -> Option<ConversationMessage> {
        let state = self.inner.state.lock().await;
        state.messages.iter().rev().find(|m| m.ts == ts).cloned()
    }

    pub async fn status(&self) -> Option<AskStatus> {
        self.inner.state.lock().await.status
    }

    pub async fn pending_ask(&self) -> Option<PendingAsk> {
        self.inner.state.lock().await.pending.clone()
    }

    pub async fn last_message_ts(&self) -> Option<i64> {
        self.inner.state.lock().await.last_message_ts
    }

    pub async fn queued_messages(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Emits an ask entry and, unless it is partial, waits for its answer.
    pub async fn ask(
        &self,
        ask_type: AskType,
        text: Option<String>,
        options: AskOptions,
    ) -> Result<AskOutcome, TaskError> {
        self.ensure_active()?;
        let kind = MessageKind::Ask(ask_type);

        let ask_ts = {
            let mut state = self.inner.state.lock().await;
            let updating = state.last_is_partial(kind);

            if options.partial == Some(true) {
                if updating {
                    if let Some(last) = state.messages.last_mut() {
                        last.text = text;
                        last.progress_status = options.progress_status;
                        last.is_protected = options.is_protected;
                        let snapshot = last.clone();
                        self.publish_message("message.updated", &snapshot);
                    }
                    return Ok(AskOutcome::Superseded(Supersession::ByUpdate));
                }
                let ts = self.inner.clock.next();
                let mut message = ConversationMessage::new(ts, kind, text);
                message.partial = true;
                message.progress_status = options.progress_status;
                message.is_protected = options.is_protected;
                state.touch(ts);
                self.publish_message("message.created", &message);
                state.messages.push(message);
                self.bump();
                return Ok(AskOutcome::Superseded(Supersession::ByNewPartial));
            }

            state.reply = None;
            let ts = match (options.partial, updating) {
                (Some(false), true) => {
                    let Some(last) = state.messages.last_mut() else {
                        return Err(TaskError::NoResponse);
                    };
                    last.text = text.clone();
                    last.partial = false;
                    last.progress_status = options.progress_status;
                    last.is_protected = options.is_protected;
                    let ts = last.ts;
                    let snapshot = last.clone();
                    self.publish_message("message.updated", &snapshot);
                    ts
                }
                _ => {
                    let ts = self.inner.clock.next();
                    let mut message = ConversationMessage::new(ts, kind, text.clone());
                    message.progress_status = options.progress_status;
                    message.is_protected = options.is_protected;
                    self.publish_message("message.created", &message);
                    state.messages.push(message);
                    ts
                }
            };
            state.touch(ts);
            state.pending = Some(PendingAsk {
                ask_type,
                text: text.clone(),
                ts,
                resolution: AskResolution::Unresolved,
            });
            ts
        };
        self.bump();
        self.persist_messages().await;

        let mut timers = ArmedTimers(Vec::new());
        let decision = {
            let consecutive = self.inner.state.lock().await.consecutive_auto_approvals;
            let ctx = ApprovalContext {
                task_id: &self.inner.task_id,
                consecutive_auto_approvals: consecutive,
            };
            self.inner.policy.decide(&ctx, ask_type, text.as_deref())
        };
        match &decision {
            ApprovalDecision::Approve => {
                self.inner.state.lock().await.consecutive_auto_approvals += 1;
                self.handle_response(AskReply::new(AskResponse::YesButtonClicked))
                    .await;
            }
            ApprovalDecision::Deny => {
                self.handle_response(AskReply::new(AskResponse::NoButtonClicked))
                    .await;
            }
            ApprovalDecision::Timeout { after, fallback } => {
                let handle = self.arm_auto_answer(*after, fallback.clone());
                self.inner.state.lock().await.auto_answer_timer = Some(handle.clone());
                timers.0.push(handle);
            }
            ApprovalDecision::Ask => {}
        }

        let (still_blocking, has_queued) = {
            let state = self.inner.state.lock().await;
            (
                state.reply.is_none() && state.last_message_ts == Some(ask_ts),
                !state.queue.is_empty(),
            )
        };
        if still_blocking && has_queued {
            self.drain_queue_into(ask_type).await;
        } else if still_blocking && matches!(decision, ApprovalDecision::Ask) {
            if let Some(status) = ask_type.status() {
                timers.0.push(self.arm_status_promotion(ask_ts, status));
            }
        }

        let outcome = self.wait_for_resolution(ask_type, ask_ts).await;
        drop(timers);
        let outcome = outcome?;

        let had_status = {
            let mut state = self.inner.state.lock().await;
            state.take_auto_answer_timer();
            let had_status = state.status.take().is_some();
            if let Some(pending) = state.pending.as_mut().filter(|p| p.ts == ask_ts) {
                pending.resolution = match &outcome {
                    AskOutcome::Answered(reply) => AskResolution::Resolved(reply.clone()),
                    AskOutcome::Superseded(_) => AskResolution::Superseded,
                };
            }
            had_status
        };
        if had_status {
            self.inner
                .event_bus
                .publish_for_task(&self.inner.task_id, "task.active", json!({ "ts": ask_ts }));
        }
        self.inner.event_bus.publish_for_task(
            &self.inner.task_id,
            "task.ask_resolved",
            json!({
                "ts": ask_ts,
                "askType": ask_type.as_str(),
                "superseded": matches!(outcome, AskOutcome::Superseded(_)),
            }),
        );
        Ok(outcome)
    }

    async fn wait_for_resolution(
        &self,
        ask_type: AskType,
        ask_ts: i64,
    ) -> Result<AskOutcome, TaskError> {
        let mut revision = self.inner.revision.subscribe();
        loop {
            {
                let mut state = self.inner.state.lock().await;
                if state.last_message_ts != Some(ask_ts) {
                    return Ok(AskOutcome::Superseded(Supersession::ByLaterMessage));
                }
                if let Some(reply) = state.reply.take() {
                    return Ok(AskOutcome::Answered(reply));
                }
            }
            if self.inner.abort.is_cancelled() {
                return Err(TaskError::Aborted);
            }
            if self.queued_messages().await > 0 {
                self.drain_queue_into(ask_type).await;
                continue;
            }
            tokio::select! {
                _ = self.inner.abort.cancelled() => return Err(TaskError::Aborted),
                changed = revision.changed() => {
                    if changed.is_err() {
                        return Err(TaskError::NoResponse);
                    }
                }
                _ = tokio::time::sleep(self.inner.timing.poll_interval) => {}
            }
        }
    }

    /// Records the answer to the pending ask. Affirmative answers mark the
    /// matching follow-up or tool entry as answered.
    pub async fn handle_response(&self, reply: AskReply) {
        let mut changed = false;
        {
            let mut state = self.inner.state.lock().await;
            state.take_auto_answer_timer();
            if reply.response.is_affirmative() {
                changed |= mark_answered(&mut state.messages, AskType::Followup);
            }
            if reply.response == AskResponse::YesButtonClicked {
                changed |= mark_answered(&mut state.messages, AskType::Tool);
            }
            state.reply = Some(reply);
        }
        self.bump();
        if changed {
            self.persist_messages().await;
        }
    }

    /// Answer coming from the host. Resets the auto-approval streak.
    pub async fn respond(&self, reply: AskReply) {
        self.inner.state.lock().await.consecutive_auto_approvals = 0;
        self.handle_response(reply).await;
    }

    /// Queues a user message typed while the task was busy. A blocking ask
    /// picks it up as its answer.
    pub async fn enqueue_message(&self, message: QueuedMessage) {
        self.inner.state.lock().await.queue.push_back(message);
        self.bump();
    }

    /// Removes and returns the oldest queued message, for hosts that start a
    /// new turn with it.
    pub async fn dequeue_message(&self) -> Option<QueuedMessage> {
        self.inner.state.lock().await.queue.pop_front()
    }

    /// Appends or updates a say entry. Never waits.
    pub async fn say(&self, say_type: SayType, options: SayOptions) -> Result<SayOutcome, TaskError> {
        self.ensure_active()?;
        let kind = MessageKind::Say(say_type);
        let mut persist = false;

        let outcome = {
            let mut state = self.inner.state.lock().await;
            let updating = state.last_is_partial(kind);
            match (options.partial, updating) {
                (Some(true), true) => {
                    let Some(last) = state.messages.last_mut() else {
                        return Err(TaskError::NoResponse);
                    };
                    last.text = options.text;
                    last.images = options.images;
                    last.progress_status = options.progress_status;
                    let snapshot = last.clone();
                    self.publish_message("message.updated", &snapshot);
                    SayOutcome::Updated(snapshot.ts)
                }
                (Some(false), true) => {
                    let Some(last) = state.messages.last_mut() else {
                        return Err(TaskError::NoResponse);
                    };
                    last.text = options.text;
                    last.images = options.images;
                    last.partial = false;
                    last.progress_status = options.progress_status;
                    let snapshot = last.clone();
                    if !options.non_interactive {
                        state.touch(snapshot.ts);
                    }
                    self.publish_message("message.updated", &snapshot);
                    persist = true;
                    SayOutcome::Updated(snapshot.ts)
                }
                (partial, _) => {
                    let ts = self.inner.clock.next();
                    let mut message = ConversationMessage::new(ts, kind, options.text);
                    message.images = options.images;
                    message.partial = partial == Some(true);
                    message.progress_status = options.progress_status;
                    if !options.non_interactive {
                        state.touch(ts);
                    }
                    persist = !message.partial;
                    self.publish_message("message.created", &message);
                    state.messages.push(message);
                    SayOutcome::Created(ts)
                }
            }
        };
        self.bump();
        if persist {
            self.persist_messages().await;
        }
        Ok(outcome)
    }

    /// Closes every partial entry in place. Timestamps do not move.
    pub async fn seal_partials(&self) {
        let sealed: Vec<ConversationMessage> = {
            let mut state = self.inner.state.lock().await;
            state
                .messages
                .iter_mut()
                .filter(|m| m.partial)
                .map(|m| {
                    m.partial = false;
                    m.clone()
                })
                .collect()
        };
        if sealed.is_empty() {
            return;
        }
        for message in &sealed {
            self.publish_message("message.updated", message);
        }
        self.persist_messages().await;
    }

    /// Drops every entry at or after `ts`.
    pub async fn rewind_to(&self, ts: i64) -> usize {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let before = state.messages.len();
            state.messages.retain(|m| m.ts < ts);
            let removed = before - state.messages.len();
            state.last_message_ts = state.messages.last().map(|m| m.ts);
            if state.pending.as_ref().map(|p| p.ts >= ts).unwrap_or(false) {
                state.pending = None;
            }
            removed
        };
        if removed > 0 {
            self.inner.event_bus.publish_for_task(
                &self.inner.task_id,
                "message.rewound",
                json!({ "ts": ts, "removed": removed }),
            );
            self.bump();
            self.persist_messages().await;
        }
        removed
    }

    pub async fn persist_messages(&self) -> bool {
        let snapshot = self.messages().await;
        let task_id = self.inner.task_id.clone();
        let persistence = self.inner.persistence.clone();
        let saved = save_with_retry(&self.inner.retry, "ui_messages", || {
            let persistence = persistence.clone();
            let task_id = task_id.clone();
            let snapshot = snapshot.clone();
            async move { persistence.save_messages(&task_id, &snapshot).await }
        })
        .await;
        if !saved {
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "messages.save.failed",
                    component: "ask_say",
                    task_id: Some(&self.inner.task_id),
                    status: Some("failed"),
                    ..ObservabilityEvent::default()
                },
            );
        }
        saved
    }

    async fn drain_queue_into(&self, ask_type: AskType) {
        let Some(message) = self.dequeue_message().await else {
            return;
        };
        let response = if ask_type.is_tool_approval() {
            AskResponse::YesButtonClicked
        } else {
            AskResponse::MessageResponse
        };
        tracing::debug!(task_id = %self.inner.task_id, ask_type = ask_type.as_str(), "answering ask from queued message");
        self.respond(AskReply {
            response,
            text: Some(message.text),
            images: message.images,
        })
        .await;
    }

    fn arm_status_promotion(&self, ask_ts: i64, status: AskStatus) -> AbortHandle {
        let controller = self.clone();
        let delay = self.inner.timing.status_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            controller.promote_status(ask_ts, status).await;
        })
        .abort_handle()
    }

    async fn promote_status(&self, ask_ts: i64, status: AskStatus) {
        {
            let mut state = self.inner.state.lock().await;
            let still_waiting = state.reply.is_none()
                && state.last_message_ts == Some(ask_ts)
                && state.messages.iter().any(|m| m.ts == ask_ts);
            if !still_waiting {
                return;
            }
            state.status = Some(status);
        }
        self.inner
            .event_bus
            .publish_for_task(&self.inner.task_id, status.event_type(), json!({ "ts": ask_ts }));
    }

    fn arm_auto_answer(&self, after: Duration, fallback: AskReply) -> AbortHandle {
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Clear the slot first: aborting this very task mid-answer would
            // lose the reply.
            controller.inner.state.lock().await.auto_answer_timer = None;
            controller.handle_response(fallback).await;
        })
        .abort_handle()
    }

    fn ensure_active(&self) -> Result<(), TaskError> {
        if self.inner.abort.is_cancelled() {
            return Err(TaskError::Aborted);
        }
        Ok(())
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn publish_message(&self, event_type: &str, message: &ConversationMessage) {
        self.inner.event_bus.publish_for_task(
            &self.inner.task_id,
            event_type,
            json!({ "message": message }),
        );
    }
}

fn mark_answered(messages: &mut [ConversationMessage], ask_type: AskType) -> bool {
    let target = messages
        .iter_mut()
        .rev()
        .find(|m| m.ask_type() == Some(ask_type) && !m.is_answered);
    match target {
        Some(message) => {
            message.is_answered = true;
            true
        }
        None => false,
    }
}
