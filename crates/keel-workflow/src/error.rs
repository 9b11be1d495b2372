use keel_config::Provider;
use thiserror::Error;

use crate::WorkflowName;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
  #[error("unknown workflow '{0}'")]
  UnknownWorkflow(String),

  #[error("workflow '{workflow}' is not defined for provider '{provider}'")]
  NotDefined {
    workflow: WorkflowName,
    provider: Provider,
  },

  #[error("workflow '{workflow}' references unregistered step '{step}'")]
  UnknownStep { workflow: WorkflowName, step: String },

  #[error("step '{step}' in workflow '{workflow}' depends on '{depends}', which does not run before it")]
  UnmetDependency {
    workflow: WorkflowName,
    step: String,
    depends: String,
  },
}
