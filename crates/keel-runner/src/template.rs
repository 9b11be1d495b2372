//! Template rendering and the run-and-race helper.

use keel_journal::JournalWriter;
use minijinja::Environment;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Command, Runner, RunnerError};

/// A named script template, rendered with minijinja.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
  pub name: &'static str,
  pub source: &'static str,
}

impl Template {
  pub const fn new(name: &'static str, source: &'static str) -> Self {
    Self { name, source }
  }
}

/// Render a template against `data`.
///
/// Undefined variables are errors, so a missing config field surfaces at
/// render time rather than as an empty string in a shell script.
pub fn render(template: &Template, data: &impl Serialize) -> Result<String, RunnerError> {
  let mut env = Environment::new();
  env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
  env
    .render_named_str(template.name, template.source, data)
    .map_err(|source| RunnerError::Render {
      name: template.name.to_string(),
      source,
    })
}

/// Render `template`, run it through `runner`, and race it against `cancel`.
///
/// If `cancel` fires while the script runs the result is
/// [`RunnerError::Cancelled`]; otherwise it is whatever the runner returned.
/// Rendering errors are returned unchanged and nothing is executed.
pub async fn run_template(
  cancel: &CancellationToken,
  template: &Template,
  runner: &dyn Runner,
  host: Option<&str>,
  out: &JournalWriter,
  data: &impl Serialize,
) -> Result<(), RunnerError> {
  let script = render(template, data)?;

  debug!(template = template.name, host = ?host, "running script");

  let command = Command {
    cancel: cancel.clone(),
    host: host.map(str::to_string),
    script,
    stdout: out.clone(),
    stderr: out.clone(),
  };

  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(RunnerError::Cancelled),
    result = runner.run(command) => result,
  }
}
