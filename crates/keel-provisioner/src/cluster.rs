use std::collections::BTreeMap;
use std::fmt;

use keel_config::{Config, Node, Provider};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
  Provisioning,
  /// Every node is active.
  Operational,
  /// Some node failed; peers that succeeded are kept.
  Unhealthy,
  Deleting,
  Deleted,
}

impl fmt::Display for ClusterState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ClusterState::Provisioning => "provisioning",
      ClusterState::Operational => "operational",
      ClusterState::Unhealthy => "unhealthy",
      ClusterState::Deleting => "deleting",
      ClusterState::Deleted => "deleted",
    };
    f.write_str(s)
  }
}

/// The provisioner's view of a cluster, fed by node events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
  pub id: String,
  pub name: String,
  pub provider: Provider,
  pub state: ClusterState,
  pub api_endpoint: Option<String>,
  /// Keyed by node id.
  pub nodes: BTreeMap<String, Node>,
}

impl Cluster {
  pub(crate) fn from_config(cfg: &Config, state: ClusterState) -> Self {
    Self {
      id: cfg.cluster_id.clone(),
      name: cfg.cluster_name.clone(),
      provider: cfg.provider,
      state,
      api_endpoint: cfg.kube.api_endpoint(),
      nodes: cfg
        .all_nodes()
        .into_iter()
        .map(|n| (n.id.clone(), n))
        .collect(),
    }
  }

  pub fn node_named(&self, name: &str) -> Option<&Node> {
    self.nodes.values().find(|n| n.name == name)
  }
}
