//! Runner errors.

use std::fmt;

/// Coarse classification of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
  Network,
  Timeout,
  Auth,
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Category::Network => f.write_str("network"),
      Category::Timeout => f.write_str("timeout"),
      Category::Auth => f.write_str("auth"),
    }
  }
}

/// Errors that can occur while running a script.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
  /// The script ran and exited non-zero.
  #[error("script exited with code {exit_code}: {stderr_tail}")]
  Exit {
    exit_code: i32,
    stderr_tail: String,
    category: Option<Category>,
  },

  /// The command's cancellation token fired.
  #[error("script cancelled")]
  Cancelled,

  /// The script never reached the host.
  #[error("{category} error: {message}")]
  Transport { category: Category, message: String },

  /// The template could not be rendered.
  #[error("failed to render template '{name}': {source}")]
  Render {
    name: String,
    #[source]
    source: minijinja::Error,
  },

  /// Writing captured output failed.
  #[error("journal error: {0}")]
  Journal(#[from] keel_journal::Error),

  /// Spawning or waiting on a process failed.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl RunnerError {
  /// The category attached to this error, if any.
  pub fn category(&self) -> Option<Category> {
    match self {
      RunnerError::Exit { category, .. } => *category,
      RunnerError::Transport { category, .. } => Some(*category),
      _ => None,
    }
  }
}

/// Last `max_lines` non-empty lines of captured stderr.
pub(crate) fn tail(bytes: &[u8], max_lines: usize) -> String {
  let text = String::from_utf8_lossy(bytes);
  let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
  let start = lines.len().saturating_sub(max_lines);
  lines[start..].join("\n")
}
