use chrono::{DateTime, Utc};
use keel_config::Config;
use keel_step::{ErrorKind, StepError};
use keel_workflow::WorkflowName;
use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Queued,
  Running,
  Finished,
  Error,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Finished | TaskStatus::Error)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Queued => "queued",
      TaskStatus::Running => "running",
      TaskStatus::Finished => "finished",
      TaskStatus::Error => "error",
    }
  }
}

impl std::fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
  pub kind: ErrorKind,
  pub message: String,
  /// Step that failed, if the failure came from a step.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step: Option<String>,
}

impl TaskFailure {
  pub fn from_step(step: &str, err: &StepError) -> Self {
    Self {
      kind: err.kind(),
      message: err.to_string(),
      step: Some(step.to_string()),
    }
  }
}

/// A persisted workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub workflow: WorkflowName,
  pub cluster_id: String,
  /// Number of steps completed so far; index of the next step to run.
  pub step_index: usize,
  pub status: TaskStatus,
  /// Failed attempts of the current step.
  pub attempts: u32,
  #[serde(default)]
  pub error: Option<TaskFailure>,
  pub config: Config,
  pub journal_uri: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Task {
  pub fn new(
    id: impl Into<String>,
    workflow: WorkflowName,
    config: Config,
    journal_uri: impl Into<String>,
  ) -> Self {
    let now = Utc::now();
    Self {
      id: id.into(),
      workflow,
      cluster_id: config.cluster_id.clone(),
      step_index: 0,
      status: TaskStatus::Queued,
      attempts: 0,
      error: None,
      config,
      journal_uri: journal_uri.into(),
      created_at: now,
      updated_at: now,
    }
  }

  /// Id of the node this task works on, if any.
  pub fn node_id(&self) -> Option<&str> {
    self.config.node.as_ref().map(|n| n.id.as_str())
  }

  pub fn touch(&mut self) {
    self.updated_at = Utc::now();
  }
}
