//! Scripted runner for tests and dry runs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::{Command, Runner, RunnerError};

/// A script the [`ScriptedRunner`] was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
  pub host: Option<String>,
  pub script: String,
}

#[derive(Debug, Clone)]
struct Failure {
  pattern: String,
  exit_code: i32,
  stderr: String,
  /// Remaining failures; `None` fails forever.
  remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
  executed: Vec<Executed>,
  failures: Vec<Failure>,
  delay: Option<Duration>,
}

/// Records every script and succeeds, unless told otherwise.
///
/// Clones share state, so a test can keep one handle and give another to
/// the config.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
  state: Arc<Mutex<State>>,
}

impl ScriptedRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sleep this long before "running" each script.
  pub fn with_delay(self, delay: Duration) -> Self {
    self.lock().delay = Some(delay);
    self
  }

  /// Fail any script containing `pattern`.
  pub fn fail_when(&self, pattern: impl Into<String>, exit_code: i32, stderr: impl Into<String>) {
    self.lock().failures.push(Failure {
      pattern: pattern.into(),
      exit_code,
      stderr: stderr.into(),
      remaining: None,
    });
  }

  /// Fail the next `times` scripts containing `pattern`, then succeed.
  pub fn fail_times(
    &self,
    pattern: impl Into<String>,
    times: usize,
    exit_code: i32,
    stderr: impl Into<String>,
  ) {
    self.lock().failures.push(Failure {
      pattern: pattern.into(),
      exit_code,
      stderr: stderr.into(),
      remaining: Some(times),
    });
  }

  /// Every script received so far, in order.
  pub fn executed(&self) -> Vec<Executed> {
    self.lock().executed.clone()
  }

  /// Number of received scripts containing `pattern`.
  pub fn count_matching(&self, pattern: &str) -> usize {
    self
      .lock()
      .executed
      .iter()
      .filter(|e| e.script.contains(pattern))
      .count()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[async_trait]
impl Runner for ScriptedRunner {
  async fn run(&self, command: Command) -> Result<(), RunnerError> {
    let (delay, failure) = {
      let mut state = self.lock();
      state.executed.push(Executed {
        host: command.host.clone(),
        script: command.script.clone(),
      });
      let failure = state
        .failures
        .iter_mut()
        .find(|f| command.script.contains(&f.pattern) && f.remaining != Some(0))
        .map(|f| {
          if let Some(remaining) = f.remaining.as_mut() {
            *remaining -= 1;
          }
          f.clone()
        });
      (state.delay, failure)
    };

    if let Some(delay) = delay {
      tokio::select! {
        _ = command.cancel.cancelled() => return Err(RunnerError::Cancelled),
        _ = tokio::time::sleep(delay) => {}
      }
    }

    match failure {
      Some(failure) => {
        command.stderr.line(&failure.stderr).await?;
        Err(RunnerError::Exit {
          exit_code: failure.exit_code,
          stderr_tail: failure.stderr,
          category: None,
        })
      }
      None => {
        command
          .stdout
          .line(&format!("+ ran {} byte script", command.script.len()))
          .await?;
        Ok(())
      }
    }
  }
}
