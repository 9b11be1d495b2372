//! Runtime error types.

use keel_step::{ErrorKind, StepError};

/// Errors that can occur while running a task.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  /// The task was cancelled before it finished.
  #[error("task '{task_id}' cancelled")]
  Cancelled { task_id: String },

  /// A step failed and the task was rolled back.
  #[error("task '{task_id}' failed at step '{step}': {source}")]
  Step {
    task_id: String,
    step: String,
    #[source]
    source: StepError,
  },

  /// The workflow could not be dispatched.
  #[error("workflow dispatch failed: {0}")]
  Workflow(#[from] keel_workflow::WorkflowError),

  /// Reading or writing a task record failed.
  #[error("task repository error: {0}")]
  Store(#[from] keel_store::StoreError),

  /// Opening the task journal failed.
  #[error("journal error: {0}")]
  Journal(#[from] keel_journal::Error),
}

impl RuntimeError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      RuntimeError::Cancelled { .. } => ErrorKind::Cancelled,
      RuntimeError::Step { source, .. } => source.kind(),
      RuntimeError::Workflow(_) | RuntimeError::Store(_) | RuntimeError::Journal(_) => {
        ErrorKind::Fatal
      }
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, RuntimeError::Cancelled { .. })
  }
}
