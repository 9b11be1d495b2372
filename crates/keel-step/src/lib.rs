//! Keel Step
//!
//! A step is a named, idempotent unit of work with a `run` and a `rollback`.
//! Steps own no state: the only output a step produces is a mutation of the
//! [`Config`] it is handed. Re-running a step whose output is already
//! recorded in the config must be a no-op.
//!
//! Steps are collected in a [`StepRegistry`] at startup; workflows refer to
//! them by name.

mod error;
mod poll;
mod registry;

pub use error::{ErrorKind, StepError};
pub use poll::{PollPolicy, poll_until};
pub use registry::StepRegistry;

use async_trait::async_trait;
use keel_config::Config;
use keel_journal::JournalWriter;
use tokio_util::sync::CancellationToken;

/// The capability set every step provides.
#[async_trait]
pub trait Step: Send + Sync {
  /// Stable name used in workflow definitions.
  fn name(&self) -> &str;

  /// Human readable summary.
  fn description(&self) -> &str;

  /// Steps expected to have run earlier in the same workflow. Only used for
  /// validation.
  fn depends(&self) -> &[&'static str] {
    &[]
  }

  /// Perform the work and record its outputs in `cfg`.
  ///
  /// If `cfg` already records the output, return `Ok(())` without touching
  /// anything external.
  async fn run(
    &self,
    cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError>;

  /// Undo what `run` produced. Must tolerate `run` never having happened,
  /// and must itself be idempotent.
  async fn rollback(
    &self,
    cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError>;
}
