use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Provider;

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
  Master,
  Node,
}

impl fmt::Display for NodeRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NodeRole::Master => f.write_str("master"),
      NodeRole::Node => f.write_str("node"),
    }
  }
}

/// Lifecycle state of a node.
///
/// `Planned` is the state a node is created in, before any step touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  Planned,
  Building,
  Provisioning,
  Active,
  Error,
}

impl fmt::Display for NodeState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      NodeState::Planned => "planned",
      NodeState::Building => "building",
      NodeState::Provisioning => "provisioning",
      NodeState::Active => "active",
      NodeState::Error => "error",
    };
    f.write_str(s)
  }
}

/// A machine in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
  /// Stable id assigned at planning time; key of the node maps.
  pub id: String,
  pub name: String,
  pub role: NodeRole,
  pub cluster_id: String,
  pub provider: Provider,
  #[serde(default)]
  pub region: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub zone: Option<String>,
  #[serde(default)]
  pub size: String,
  pub state: NodeState,
  /// Cloud-side instance id, once created.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub instance_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub private_ip: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub public_ip: Option<String>,
  /// Scripts that already ran to completion on this node.
  #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
  pub applied_scripts: BTreeSet<String>,
}

impl Node {
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    role: NodeRole,
    cluster_id: impl Into<String>,
    provider: Provider,
  ) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      role,
      cluster_id: cluster_id.into(),
      provider,
      region: String::new(),
      zone: None,
      size: String::new(),
      state: NodeState::Planned,
      instance_id: None,
      private_ip: None,
      public_ip: None,
      applied_scripts: BTreeSet::new(),
    }
  }

  pub fn is_master(&self) -> bool {
    self.role == NodeRole::Master
  }
}
