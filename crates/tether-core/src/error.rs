use thiserror::Error;

use crate::repetition_guard::RepetitionKind;

/// Failures that end the current turn.
///
/// Supersession of an ask and "new partial created" are not errors; they are
/// reported through [`crate::AskOutcome`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task aborted")]
    Aborted,

    #[error("dead loop detected in reasoning ({kind}): {details}")]
    DeadLoopDetected {
        kind: RepetitionKind,
        details: String,
    },

    #[error("ask finished waiting without a response")]
    NoResponse,

    #[error("provider stream error: {0}")]
    Stream(String),

    #[error("delegation rejected: {0}")]
    Delegation(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("runtime has been shut down")]
    ShutDown,
}

impl TaskError {
    /// Fatal errors are reported to the user and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaskError::Aborted | TaskError::DeadLoopDetected { .. } | TaskError::Stream(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            TaskError::Aborted => "TASK_ABORTED",
            TaskError::DeadLoopDetected { .. } => "DEAD_LOOP_DETECTED",
            TaskError::NoResponse => "ASK_NO_RESPONSE",
            TaskError::Stream(_) => "PROVIDER_STREAM_ERROR",
            TaskError::Delegation(_) => "DELEGATION_REJECTED",
            TaskError::NotFound(_) => "TASK_NOT_FOUND",
            TaskError::ShutDown => "RUNTIME_SHUT_DOWN",
        }
    }
}
