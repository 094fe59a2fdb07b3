use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tether_types::{new_task_id, AskReply, ContentBlock, QueuedMessage, SayType};

use crate::approval::ApprovalPolicy;
use crate::ask_say::{AskSayController, SayOptions};
use crate::config::OrchestratorConfig;
use crate::delegation::DelegationCoordinator;
use crate::error::TaskError;
use crate::event_bus::EventBus;
use crate::persistence::TaskPersistence;
use crate::stream_assembler::FinalizedToolCall;
use crate::task::{Task, TaskDeps};
use crate::token_cost::Tokenizer;
use crate::tools::ToolDispatch;

/// What the host needs to reach a running task without owning it.
#[derive(Clone)]
pub struct TaskHandle {
    pub ask_say: AskSayController,
    pub abort: CancellationToken,
    pub parent_id: Option<String>,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, task_id: &str, handle: TaskHandle) {
        self.tasks.write().await.insert(task_id.to_string(), handle);
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskHandle> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn remove(&self, task_id: &str) -> Option<TaskHandle> {
        self.tasks.write().await.remove(task_id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    async fn drain(&self) -> Vec<(String, TaskHandle)> {
        self.tasks.write().await.drain().collect()
    }
}

/// Owns the shared collaborators, creates tasks, routes host input to them,
/// and sequences delegation hand-offs.
pub struct EngineRuntime {
    config: Arc<OrchestratorConfig>,
    event_bus: EventBus,
    tokenizer: std::sync::Mutex<Option<Arc<Tokenizer>>>,
    persistence: Arc<dyn TaskPersistence>,
    tools: Arc<dyn ToolDispatch>,
    policy: Arc<dyn ApprovalPolicy>,
    registry: TaskRegistry,
    delegation: DelegationCoordinator,
}

impl EngineRuntime {
    pub fn new(
        config: OrchestratorConfig,
        persistence: Arc<dyn TaskPersistence>,
        tools: Arc<dyn ToolDispatch>,
        policy: Arc<dyn ApprovalPolicy>,
    ) -> anyhow::Result<Self> {
        let tokenizer = Arc::new(Tokenizer::new()?);
        let event_bus = EventBus::new();
        Ok(Self {
            config: Arc::new(config),
            delegation: DelegationCoordinator::new(event_bus.clone()),
            event_bus,
            tokenizer: std::sync::Mutex::new(Some(tokenizer)),
            persistence,
            tools,
            policy,
            registry: TaskRegistry::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn delegation(&self) -> &DelegationCoordinator {
        &self.delegation
    }

    fn deps(&self) -> Result<TaskDeps, TaskError> {
        let tokenizer = self
            .tokenizer
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(TaskError::ShutDown)?;
        Ok(TaskDeps {
            config: self.config.clone(),
            event_bus: self.event_bus.clone(),
            tokenizer,
            persistence: self.persistence.clone(),
            tools: self.tools.clone(),
            policy: self.policy.clone(),
        })
    }

    /// Starts a root task. Only one root may execute at a time.
    pub async fn create_task(&self) -> Result<Task, TaskError> {
        let task = Task::new(new_task_id(), None, self.deps()?);
        self.delegation.activate_root(task.id()).await?;
        self.register(&task).await;
        self.event_bus
            .publish_for_task(task.id(), "task.created", json!({}));
        tracing::info!(task_id = task.id(), "task created");
        Ok(task)
    }

    /// Reloads a persisted task and makes it the executing root.
    pub async fn resume_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let mut task = Task::new(task_id, None, self.deps()?);
        task.restore().await.map_err(|err| {
            tracing::warn!(task_id, error = %err, "task restore failed");
            TaskError::NotFound(task_id.to_string())
        })?;
        self.delegation.activate_root(task.id()).await?;
        self.register(&task).await;
        self.event_bus
            .publish_for_task(task.id(), "task.resumed", json!({}));
        Ok(task)
    }

    pub async fn respond(&self, task_id: &str, reply: AskReply) -> Result<(), TaskError> {
        let handle = self.handle(task_id).await?;
        handle.ask_say.respond(reply).await;
        Ok(())
    }

    pub async fn enqueue_message(&self, task_id: &str, message: QueuedMessage) -> Result<(), TaskError> {
        let handle = self.handle(task_id).await?;
        handle.ask_say.enqueue_message(message).await;
        Ok(())
    }

    /// Cancels a task's waits and tool runs and gives up its execution slot.
    pub async fn abort_task(&self, task_id: &str) -> Result<(), TaskError> {
        let handle = self
            .registry
            .remove(task_id)
            .await
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if !handle.abort.is_cancelled() {
            handle.abort.cancel();
            self.event_bus
                .publish_for_task(task_id, "task.aborted", json!({}));
        }
        self.delegation.release(task_id).await;
        Ok(())
    }

    /// Forgets a finished task without cancelling anything.
    pub async fn dispose_task(&self, task_id: &str) {
        self.registry.remove(task_id).await;
        self.delegation.release(task_id).await;
    }

    /// Hands execution from `parent` to a new child seeded with the
    /// delegation call's message. The child's first entry and the parent's
    /// pending results are saved before the parent becomes `Delegated`.
    pub async fn spawn_child(
        &self,
        parent: &Task,
        call: &FinalizedToolCall,
    ) -> Result<Task, TaskError> {
        if !self.config.is_delegation_tool(&call.name) {
            return Err(TaskError::Delegation(format!(
                "`{}` is not a delegation tool",
                call.name
            )));
        }
        let mut child = Task::new(new_task_id(), Some(parent.id().to_string()), self.deps()?);
        let seeded = child
            .seed_user_content(vec![ContentBlock::text(delegation_message(&call.input))])
            .await?;
        if !seeded {
            if !self.config.delegation_best_effort {
                child.abort();
                return Err(TaskError::Delegation(format!(
                    "first entry of child {} could not be saved",
                    child.id()
                )));
            }
            tracing::warn!(child_id = child.id(), "child seed not saved, delegating anyway");
        }

        self.delegation
            .begin(
                parent.id(),
                child.id(),
                &call.id,
                || parent.flush_pending_for_delegation(),
                self.config.delegation_best_effort,
            )
            .await?;
        self.register(&child).await;
        tracing::info!(parent_id = parent.id(), child_id = child.id(), "child task started");
        Ok(child)
    }

    /// Completes `child`, hands its summary to `parent` as the delegation
    /// call's result, then lets the parent execute again.
    pub async fn finish_child(
        &self,
        parent: &mut Task,
        child: Task,
        summary: &str,
    ) -> Result<(), TaskError> {
        let link = self
            .delegation
            .link(child.id())
            .await
            .ok_or_else(|| TaskError::NotFound(child.id().to_string()))?;
        if link.parent_id != parent.id() {
            return Err(TaskError::Delegation(format!(
                "task {} is not the parent of {}",
                parent.id(),
                child.id()
            )));
        }

        child
            .ask_say()
            .say(SayType::CompletionResult, SayOptions::text(summary))
            .await?;
        let result = self.delegation.complete(child.id(), summary).await?;
        parent.absorb_child_result(result).await?;
        self.delegation.resume_parent(parent.id()).await?;
        self.registry.remove(child.id()).await;
        Ok(())
    }

    /// Aborts every task and releases the tokenizer. Later task creation
    /// fails with `TaskError::ShutDown`.
    pub async fn shutdown(&self) -> usize {
        let handles = self.registry.drain().await;
        for (task_id, handle) in &handles {
            handle.abort.cancel();
            self.delegation.release(task_id).await;
        }
        if let Ok(mut slot) = self.tokenizer.lock() {
            slot.take();
        }
        tracing::info!(aborted = handles.len(), "runtime shut down");
        handles.len()
    }

    async fn handle(&self, task_id: &str) -> Result<TaskHandle, TaskError> {
        self.registry
            .get(task_id)
            .await
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn register(&self, task: &Task) {
        self.registry
            .insert(
                task.id(),
                TaskHandle {
                    ask_say: task.ask_say().clone(),
                    abort: task.abort_token(),
                    parent_id: task.parent_id().map(str::to_string),
                },
            )
            .await;
    }
}

fn delegation_message(input: &Value) -> String {
    input
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| input.to_string())
}
