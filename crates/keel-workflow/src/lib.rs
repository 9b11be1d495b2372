//! Keel Workflow
//!
//! A workflow is an immutable, ordered list of step names plus the retry
//! policy the runtime applies to its steps. Six workflows exist (see
//! [`WorkflowName`]); their step lists differ per provider only for the
//! cluster fabric (pre-provision and delete-cluster).

mod catalog;
mod error;
mod name;
pub mod steps;
mod workflow;

pub use catalog::{WorkflowCatalog, WorkflowSet};
pub use error::WorkflowError;
pub use name::WorkflowName;
pub use workflow::{RetryPolicy, Workflow, validate_workflow};
