//! Keel Runtime
//!
//! The [`TaskRuntime`] executes one workflow against one config, linearly:
//! look up each step, run it, checkpoint the task record (step cursor plus
//! serialized config), continue. Failures are retried per the workflow's
//! [`keel_workflow::RetryPolicy`] and otherwise rolled back in reverse step
//! order, starting with the step that failed. Cancellation is not a failure
//! and skips rollback.
//!
//! Tasks left `running` or `queued` by a previous process are picked up by
//! [`TaskRuntime::resume_all`].

mod error;
mod resume;
mod runtime;

pub use error::RuntimeError;
pub use resume::{ResumeOutcome, provisioned_clusters};
pub use runtime::{RuntimeConfig, TaskRuntime};
