use std::time::Duration;

use keel_step::StepRegistry;

use crate::{WorkflowError, WorkflowName};

/// How often the runtime retries a failing step of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts per step, including the first. `1` disables retries.
  pub max_attempts: u32,
  /// Pause before the next attempt.
  pub delay: Duration,
}

impl RetryPolicy {
  pub const NONE: RetryPolicy = RetryPolicy {
    max_attempts: 1,
    delay: Duration::ZERO,
  };

  pub fn new(max_attempts: u32, delay: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      delay,
    }
  }

  /// Whether a step that has failed `attempts` times may run again.
  pub fn allows_another(&self, attempts: u32) -> bool {
    attempts < self.max_attempts
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::NONE
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
  pub name: WorkflowName,
  pub steps: Vec<String>,
  pub retry: RetryPolicy,
}

impl Workflow {
  pub fn new(name: WorkflowName, steps: &[&str]) -> Self {
    Self {
      name,
      steps: steps.iter().map(|s| s.to_string()).collect(),
      retry: RetryPolicy::NONE,
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }
}

/// Check that every step of `workflow` is registered and that each step's
/// declared dependencies run before it.
pub fn validate_workflow(workflow: &Workflow, registry: &StepRegistry) -> Result<(), WorkflowError> {
  for (index, name) in workflow.steps.iter().enumerate() {
    let step = registry
      .get(name)
      .ok_or_else(|| WorkflowError::UnknownStep {
        workflow: workflow.name,
        step: name.clone(),
      })?;

    let earlier = &workflow.steps[..index];
    for depends in step.depends() {
      if !earlier.iter().any(|s| s == depends) {
        return Err(WorkflowError::UnmetDependency {
          workflow: workflow.name,
          step: name.clone(),
          depends: depends.to_string(),
        });
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use async_trait::async_trait;
  use keel_config::Config;
  use keel_journal::JournalWriter;
  use keel_step::{Step, StepError};
  use tokio_util::sync::CancellationToken;

  use super::*;

  struct Fake {
    name: &'static str,
    depends: &'static [&'static str],
  }

  #[async_trait]
  impl Step for Fake {
    fn name(&self) -> &str {
      self.name
    }

    fn description(&self) -> &str {
      "fake"
    }

    fn depends(&self) -> &[&'static str] {
      self.depends
    }

    async fn run(
      &self,
      _cancel: &CancellationToken,
      _out: &JournalWriter,
      _cfg: &mut Config,
    ) -> Result<(), StepError> {
      Ok(())
    }

    async fn rollback(
      &self,
      _cancel: &CancellationToken,
      _out: &JournalWriter,
      _cfg: &mut Config,
    ) -> Result<(), StepError> {
      Ok(())
    }
  }

  fn registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register("a", Arc::new(Fake { name: "a", depends: &[] }));
    registry.register("b", Arc::new(Fake { name: "b", depends: &["a"] }));
    registry
  }

  #[test]
  fn test_valid_workflow() {
    let wf = Workflow::new(WorkflowName::DeleteNode, &["a", "b"]);
    validate_workflow(&wf, &registry()).unwrap();
  }

  #[test]
  fn test_unknown_step() {
    let wf = Workflow::new(WorkflowName::DeleteNode, &["a", "nope"]);
    assert_eq!(
      validate_workflow(&wf, &registry()),
      Err(WorkflowError::UnknownStep {
        workflow: WorkflowName::DeleteNode,
        step: "nope".to_string(),
      })
    );
  }

  #[test]
  fn test_dependency_must_run_first() {
    let wf = Workflow::new(WorkflowName::DeleteNode, &["b", "a"]);
    assert!(matches!(
      validate_workflow(&wf, &registry()),
      Err(WorkflowError::UnmetDependency { .. })
    ));
  }

  #[test]
  fn test_retry_policy() {
    let retry = RetryPolicy::new(3, Duration::from_millis(10));
    assert!(retry.allows_another(1));
    assert!(retry.allows_another(2));
    assert!(!retry.allows_another(3));
    assert!(!RetryPolicy::NONE.allows_another(1));
    assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
  }
}
