use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowName {
  /// Provider fabric: network, security, IAM, load balancer.
  PreProvision,
  /// First master: instance, runtime, kubelet, `kubeadm init`.
  MasterBootstrap,
  MasterJoin,
  WorkerJoin,
  DeleteNode,
  /// Provider fabric teardown, in reverse dependency order.
  DeleteCluster,
}

impl WorkflowName {
  pub const ALL: [WorkflowName; 6] = [
    WorkflowName::PreProvision,
    WorkflowName::MasterBootstrap,
    WorkflowName::MasterJoin,
    WorkflowName::WorkerJoin,
    WorkflowName::DeleteNode,
    WorkflowName::DeleteCluster,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      WorkflowName::PreProvision => "pre-provision",
      WorkflowName::MasterBootstrap => "master-bootstrap",
      WorkflowName::MasterJoin => "master-join",
      WorkflowName::WorkerJoin => "worker-join",
      WorkflowName::DeleteNode => "delete-node",
      WorkflowName::DeleteCluster => "delete-cluster",
    }
  }
}

impl fmt::Display for WorkflowName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for WorkflowName {
  type Err = WorkflowError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    WorkflowName::ALL
      .into_iter()
      .find(|name| name.as_str() == s)
      .ok_or_else(|| WorkflowError::UnknownWorkflow(s.to_string()))
  }
}
