//! Keel Runner
//!
//! The contract steps use to execute rendered scripts on a host. The core
//! never speaks SSH itself: a [`Runner`] implementation does (an SSH client,
//! the in-process [`LocalRunner`], or the [`ScriptedRunner`] test fake).
//!
//! [`run_template`] is the helper most steps call: render a template against
//! the step's data, run it, and race the result against cancellation.

mod error;
mod local;
mod scripted;
mod template;

pub use error::{Category, RunnerError};
pub use local::LocalRunner;
pub use scripted::{Executed, ScriptedRunner};
pub use template::{Template, render, run_template};

use async_trait::async_trait;
use keel_journal::JournalWriter;
use tokio_util::sync::CancellationToken;

/// A script to execute, with the sinks its output goes to.
#[derive(Debug, Clone)]
pub struct Command {
  /// Cancelling aborts in-flight I/O.
  pub cancel: CancellationToken,
  /// Target address. Runners bound to a single host may ignore it.
  pub host: Option<String>,
  /// Fully rendered script.
  pub script: String,
  pub stdout: JournalWriter,
  pub stderr: JournalWriter,
}

/// Executes a rendered script.
#[async_trait]
pub trait Runner: Send + Sync {
  /// Run the command to completion.
  ///
  /// Non-zero exits are reported as [`RunnerError::Exit`] with the exit code
  /// and the tail of stderr; cancellation as [`RunnerError::Cancelled`].
  async fn run(&self, command: Command) -> Result<(), RunnerError>;
}
