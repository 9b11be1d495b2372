//! Config errors.

/// Errors raised by config operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
  /// Provider tag outside the supported set.
  #[error("unknown provider '{0}'")]
  UnknownProvider(String),

  /// The operation needs a current node and the config has none.
  #[error("config has no current node")]
  NoCurrentNode,

  /// A node id is already present in the other role's map.
  #[error("node '{id}' is already registered as a {existing}")]
  DuplicateNode { id: String, existing: String },

  /// No runner is attached to the config.
  #[error("config has no runner attached")]
  NoRunner,

  /// Publishing a node event was cancelled.
  #[error("node event publish cancelled")]
  Cancelled,
}
