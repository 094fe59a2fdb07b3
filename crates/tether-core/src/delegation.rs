use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use tether_types::ContentBlock;

use crate::error::TaskError;
use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Active,
    Delegated,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationLink {
    pub parent_id: String,
    pub child_id: String,
    /// Tool use in the parent that the child's result will answer.
    pub parent_tool_use_id: String,
}

/// A finished child's answer, addressed to the parent's delegation call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildResult {
    pub parent_id: String,
    pub child_id: String,
    pub result: ContentBlock,
}

#[derive(Default)]
struct DelegationState {
    active: Option<String>,
    statuses: HashMap<String, DelegationStatus>,
    links: HashMap<String, DelegationLink>,
}

/// Enforces that exactly one task in a delegation tree executes at a time
/// and sequences the parent/child hand-offs.
#[derive(Clone)]
pub struct DelegationCoordinator {
    state: Arc<Mutex<DelegationState>>,
    event_bus: EventBus,
}

impl DelegationCoordinator {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(DelegationState::default())),
            event_bus,
        }
    }

    pub async fn active(&self) -> Option<String> {
        self.state.lock().await.active.clone()
    }

    pub async fn status(&self, task_id: &str) -> Option<DelegationStatus> {
        self.state.lock().await.statuses.get(task_id).copied()
    }

    pub async fn link(&self, child_id: &str) -> Option<DelegationLink> {
        self.state.lock().await.links.get(child_id).cloned()
    }

    /// Registers a root task as the executing one.
    pub async fn activate_root(&self, task_id: &str) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.as_ref().filter(|active| *active != task_id) {
            return Err(TaskError::Delegation(format!(
                "task {active} is already executing"
            )));
        }
        state.active = Some(task_id.to_string());
        state
            .statuses
            .insert(task_id.to_string(), DelegationStatus::Active);
        Ok(())
    }

    /// Hands execution from `parent_id` to a new child. `flush` must persist
    /// the parent's pending tool results; if it reports failure the hand-off
    /// is refused unless `best_effort` is set. The parent only becomes
    /// `Delegated` once the child is registered.
    pub async fn begin<F, Fut>(
        &self,
        parent_id: &str,
        child_id: &str,
        parent_tool_use_id: &str,
        flush: F,
        best_effort: bool,
    ) -> Result<DelegationLink, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        {
            let state = self.state.lock().await;
            if state.active.as_deref() != Some(parent_id) {
                return Err(TaskError::Delegation(format!(
                    "task {parent_id} is not the executing task"
                )));
            }
        }

        if !flush().await {
            if !best_effort {
                return Err(TaskError::Delegation(format!(
                    "pending tool results of {parent_id} could not be saved"
                )));
            }
            tracing::warn!(parent_id, child_id, "flush failed, delegating anyway");
        }

        let link = DelegationLink {
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            parent_tool_use_id: parent_tool_use_id.to_string(),
        };
        {
            let mut state = self.state.lock().await;
            if state.active.as_deref() != Some(parent_id) {
                return Err(TaskError::Delegation(format!(
                    "task {parent_id} lost execution during hand-off"
                )));
            }
            state
                .statuses
                .insert(child_id.to_string(), DelegationStatus::Active);
            state.links.insert(child_id.to_string(), link.clone());
            state
                .statuses
                .insert(parent_id.to_string(), DelegationStatus::Delegated);
            state.active = Some(child_id.to_string());
        }

        self.event_bus.publish_for_task(
            parent_id,
            "task.delegated",
            json!({ "childID": child_id, "toolUseID": parent_tool_use_id }),
        );
        Ok(link)
    }

    /// Marks the child completed and produces the tool result for the
    /// parent. Nothing executes until the parent resumes.
    pub async fn complete(&self, child_id: &str, summary: &str) -> Result<ChildResult, TaskError> {
        let link = {
            let mut state = self.state.lock().await;
            if state.active.as_deref() != Some(child_id) {
                return Err(TaskError::Delegation(format!(
                    "task {child_id} is not the executing task"
                )));
            }
            let Some(link) = state.links.get(child_id).cloned() else {
                return Err(TaskError::NotFound(child_id.to_string()));
            };
            state
                .statuses
                .insert(child_id.to_string(), DelegationStatus::Completed);
            state.active = None;
            link
        };

        self.event_bus.publish_for_task(
            child_id,
            "task.completed",
            json!({ "parentID": link.parent_id }),
        );
        Ok(ChildResult {
            parent_id: link.parent_id,
            child_id: link.child_id,
            result: ContentBlock::tool_result(link.parent_tool_use_id, summary),
        })
    }

    /// Returns execution to a parent after it absorbed its child's result.
    pub async fn resume_parent(&self, parent_id: &str) -> Result<(), TaskError> {
        {
            let mut state = self.state.lock().await;
            if state.statuses.get(parent_id) != Some(&DelegationStatus::Delegated) {
                return Err(TaskError::Delegation(format!(
                    "task {parent_id} is not waiting on a child"
                )));
            }
            if let Some(active) = state.active.as_ref() {
                return Err(TaskError::Delegation(format!(
                    "task {active} is still executing"
                )));
            }
            state
                .statuses
                .insert(parent_id.to_string(), DelegationStatus::Active);
            state.active = Some(parent_id.to_string());
        }
        self.event_bus
            .publish_for_task(parent_id, "task.resumed", json!({}));
        Ok(())
    }

    /// Forgets a task, releasing execution if it held it.
    pub async fn release(&self, task_id: &str) {
        let mut state = self.state.lock().await;
        if state.active.as_deref() == Some(task_id) {
            state.active = None;
        }
        state.statuses.remove(task_id);
        state.links.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_root_may_execute() {
        let coordinator = DelegationCoordinator::new(EventBus::new());
        coordinator.activate_root("task_a").await.expect("first root");
        assert!(coordinator.activate_root("task_b").await.is_err());
        coordinator.release("task_a").await;
        coordinator.activate_root("task_b").await.expect("after release");
    }

    #[tokio::test]
    async fn full_hand_off_round_trip() {
        let coordinator = DelegationCoordinator::new(EventBus::new());
        coordinator.activate_root("parent").await.expect("root");

        let link = coordinator
            .begin("parent", "child", "call_9", || async { true }, false)
            .await
            .expect("begin");
        assert_eq!(link.parent_tool_use_id, "call_9");
        assert_eq!(coordinator.active().await.as_deref(), Some("child"));
        assert_eq!(
            coordinator.status("parent").await,
            Some(DelegationStatus::Delegated)
        );

        // The parent cannot resume while the child still runs.
        assert!(coordinator.resume_parent("parent").await.is_err());

        let result = coordinator.complete("child", "done: 3 files").await.expect("complete");
        assert_eq!(result.parent_id, "parent");
        assert_eq!(result.result.tool_result_id(), Some("call_9"));
        assert_eq!(coordinator.active().await, None);

        coordinator.resume_parent("parent").await.expect("resume");
        assert_eq!(coordinator.active().await.as_deref(), Some("parent"));
        assert_eq!(
            coordinator.status("child").await,
            Some(DelegationStatus::Completed)
        );
    }

    #[tokio::test]
    async fn failed_flush_blocks_delegation_unless_best_effort() {
        let coordinator = DelegationCoordinator::new(EventBus::new());
        coordinator.activate_root("parent").await.expect("root");

        let err = coordinator
            .begin("parent", "child", "call_1", || async { false }, false)
            .await
            .expect_err("flush failure");
        assert!(matches!(err, TaskError::Delegation(_)));
        assert_eq!(coordinator.active().await.as_deref(), Some("parent"));
        assert_eq!(
            coordinator.status("parent").await,
            Some(DelegationStatus::Active)
        );
        assert_eq!(coordinator.status("child").await, None);

        coordinator
            .begin("parent", "child", "call_1", || async { false }, true)
            .await
            .expect("best effort");
        assert_eq!(coordinator.active().await.as_deref(), Some("child"));
    }

    #[tokio::test]
    async fn non_executing_task_cannot_delegate() {
        let coordinator = DelegationCoordinator::new(EventBus::new());
        coordinator.activate_root("parent").await.expect("root");
        assert!(coordinator
            .begin("other", "child", "call_1", || async { true }, false)
            .await
            .is_err());
    }
}
