use keel_runtime::RuntimeError;
use keel_step::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
  /// The cluster spec is unusable as given.
  #[error("invalid cluster spec: {0}")]
  InvalidSpec(String),

  /// A workflow the operation needs cannot be dispatched.
  #[error("dispatch failed: {0}")]
  Dispatch(#[source] RuntimeError),

  /// The pre-provision workflow failed; no node was created.
  #[error("provider fabric for cluster '{cluster_id}' failed: {source}")]
  Fabric {
    cluster_id: String,
    #[source]
    source: RuntimeError,
  },

  /// The bootstrap master could not be brought up.
  #[error("bootstrap master '{node}' of cluster '{cluster_id}' failed: {source}")]
  Bootstrap {
    cluster_id: String,
    node: String,
    #[source]
    source: RuntimeError,
  },

  /// Some delete-node tasks failed; the fabric was left in place.
  #[error("{failed} node(s) of cluster '{cluster_id}' could not be deleted")]
  NodeDeletion { cluster_id: String, failed: usize },

  /// The delete-cluster workflow failed.
  #[error("fabric cleanup for cluster '{cluster_id}' failed: {source}")]
  Cleanup {
    cluster_id: String,
    #[source]
    source: RuntimeError,
  },

  #[error("cluster '{cluster_id}' operation cancelled")]
  Cancelled { cluster_id: String },
}

impl ProvisionError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ProvisionError::InvalidSpec(_) => ErrorKind::Fatal,
      ProvisionError::Dispatch(e) => e.kind(),
      ProvisionError::Fabric { source, .. }
      | ProvisionError::Bootstrap { source, .. }
      | ProvisionError::Cleanup { source, .. } => source.kind(),
      ProvisionError::NodeDeletion { .. } => ErrorKind::Provider,
      ProvisionError::Cancelled { .. } => ErrorKind::Cancelled,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, ProvisionError::Cancelled { .. })
  }
}
