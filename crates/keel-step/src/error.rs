//! Step errors and the error kinds the runtime acts on.

use std::fmt;
use std::time::Duration;

use keel_config::ConfigError;
use keel_runner::{Category, RunnerError};
use serde::{Deserialize, Serialize};

/// Classification the runtime uses to decide between retry, rollback and
/// giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
  Authorization,
  NotFound,
  AlreadyExists,
  DeadlineExceeded,
  Cancelled,
  RemoteExec,
  Fatal,
  Provider,
}

impl ErrorKind {
  /// Whether another attempt of the same step could succeed.
  pub fn is_retryable(self) -> bool {
    !matches!(
      self,
      ErrorKind::Authorization | ErrorKind::Fatal | ErrorKind::Cancelled
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ErrorKind::Authorization => "authorization",
      ErrorKind::NotFound => "not-found",
      ErrorKind::AlreadyExists => "already-exists",
      ErrorKind::DeadlineExceeded => "deadline-exceeded",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::RemoteExec => "remote-exec",
      ErrorKind::Fatal => "fatal",
      ErrorKind::Provider => "provider",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Errors returned by [`crate::Step::run`] and [`crate::Step::rollback`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
  /// Credentials invalid or missing.
  #[error("authorization failed: {message}")]
  Authorization { message: String },

  /// An expected resource is absent.
  #[error("{resource} not found")]
  NotFound { resource: String },

  /// A create found the resource already present.
  #[error("{resource} already exists")]
  AlreadyExists { resource: String },

  /// A bounded poll did not reach its target state.
  #[error("{operation} did not complete within {after:?}")]
  DeadlineExceeded { operation: String, after: Duration },

  /// The caller cancelled the operation.
  #[error("cancelled")]
  Cancelled,

  /// A remote script exited non-zero.
  #[error("remote script exited with code {exit_code}: {stderr_tail}")]
  RemoteExec { exit_code: i32, stderr_tail: String },

  /// Programming error or corrupted state.
  #[error("{message}")]
  Fatal { message: String },

  /// Unclassified provider SDK failure.
  #[error("provider error: {message}")]
  Provider { message: String },
}

impl StepError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      StepError::Authorization { .. } => ErrorKind::Authorization,
      StepError::NotFound { .. } => ErrorKind::NotFound,
      StepError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
      StepError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
      StepError::Cancelled => ErrorKind::Cancelled,
      StepError::RemoteExec { .. } => ErrorKind::RemoteExec,
      StepError::Fatal { .. } => ErrorKind::Fatal,
      StepError::Provider { .. } => ErrorKind::Provider,
    }
  }

  pub fn fatal(message: impl Into<String>) -> Self {
    StepError::Fatal {
      message: message.into(),
    }
  }

  pub fn provider(message: impl Into<String>) -> Self {
    StepError::Provider {
      message: message.into(),
    }
  }

  pub fn not_found(resource: impl Into<String>) -> Self {
    StepError::NotFound {
      resource: resource.into(),
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, StepError::NotFound { .. })
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, StepError::Cancelled)
  }
}

impl From<RunnerError> for StepError {
  fn from(err: RunnerError) -> Self {
    match err {
      RunnerError::Cancelled => StepError::Cancelled,
      RunnerError::Exit {
        exit_code,
        stderr_tail,
        ..
      } => StepError::RemoteExec {
        exit_code,
        stderr_tail,
      },
      RunnerError::Render { .. } => StepError::fatal(err.to_string()),
      RunnerError::Transport {
        category: Category::Auth,
        message,
      } => StepError::Authorization { message },
      RunnerError::Transport {
        category: Category::Timeout,
        message,
      } => StepError::DeadlineExceeded {
        operation: message,
        after: Duration::ZERO,
      },
      other => StepError::provider(other.to_string()),
    }
  }
}

impl From<ConfigError> for StepError {
  fn from(err: ConfigError) -> Self {
    match err {
      ConfigError::Cancelled => StepError::Cancelled,
      other => StepError::fatal(other.to_string()),
    }
  }
}
