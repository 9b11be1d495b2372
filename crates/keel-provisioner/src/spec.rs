use std::collections::BTreeSet;

use keel_config::{
  AwsConfig, AzureConfig, CloudAccount, Config, DigitalOceanConfig, GceConfig, KubeConfig, Node,
  NodeRole, OpenStackConfig, PacketConfig, Provider, SshConfig,
};
use serde::{Deserialize, Serialize};

use crate::ProvisionError;

/// One node to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
  pub name: String,
  pub size: String,
  pub region: String,
  pub zone: Option<String>,
}

impl NodeSpec {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Self::default()
    }
  }
}

/// What the operator asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
  pub name: String,
  pub provider: Provider,
  /// Assigned on provision when absent.
  #[serde(default)]
  pub cluster_id: Option<String>,
  #[serde(default)]
  pub cloud_account: CloudAccount,

  #[serde(default)]
  pub aws: AwsConfig,
  #[serde(default)]
  pub digitalocean: DigitalOceanConfig,
  #[serde(default)]
  pub gce: GceConfig,
  #[serde(default)]
  pub azure: AzureConfig,
  #[serde(default)]
  pub openstack: OpenStackConfig,
  #[serde(default)]
  pub packet: PacketConfig,
  #[serde(default)]
  pub ssh: SshConfig,
  #[serde(default)]
  pub kube: KubeConfig,

  /// The first master bootstraps the control plane.
  pub masters: Vec<NodeSpec>,
  #[serde(default)]
  pub workers: Vec<NodeSpec>,
}

impl ClusterSpec {
  pub fn new(name: impl Into<String>, provider: Provider) -> Self {
    Self {
      name: name.into(),
      provider,
      cluster_id: None,
      cloud_account: CloudAccount::default(),
      aws: AwsConfig::default(),
      digitalocean: DigitalOceanConfig::default(),
      gce: GceConfig::default(),
      azure: AzureConfig::default(),
      openstack: OpenStackConfig::default(),
      packet: PacketConfig::default(),
      ssh: SshConfig::default(),
      kube: KubeConfig::default(),
      masters: Vec::new(),
      workers: Vec::new(),
    }
  }

  pub fn node_count(&self) -> usize {
    self.masters.len() + self.workers.len()
  }

  pub fn validate(&self) -> Result<(), ProvisionError> {
    if self.name.is_empty() {
      return Err(ProvisionError::InvalidSpec("cluster name is empty".to_string()));
    }
    if self.masters.is_empty() {
      return Err(ProvisionError::InvalidSpec(
        "at least one master is required".to_string(),
      ));
    }
    let mut seen = BTreeSet::new();
    for node in self.masters.iter().chain(&self.workers) {
      if node.name.is_empty() {
        return Err(ProvisionError::InvalidSpec("node name is empty".to_string()));
      }
      if !seen.insert(node.name.as_str()) {
        return Err(ProvisionError::InvalidSpec(format!(
          "node name '{}' is used twice",
          node.name
        )));
      }
    }
    Ok(())
  }

  /// Build the cluster config with every node planned. Returns the config
  /// and the planned masters and workers in spec order.
  pub(crate) fn plan(
    &self,
    cluster_id: &str,
  ) -> Result<(Config, Vec<Node>, Vec<Node>), ProvisionError> {
    self.validate()?;

    let mut cfg = Config::new(self.provider, cluster_id, &self.name);
    cfg.cloud_account = self.cloud_account.clone();
    cfg.aws = self.aws.clone();
    cfg.digitalocean = self.digitalocean.clone();
    cfg.gce = self.gce.clone();
    cfg.azure = self.azure.clone();
    cfg.openstack = self.openstack.clone();
    cfg.packet = self.packet.clone();
    cfg.ssh = self.ssh.clone();
    cfg.kube = self.kube.clone();

    let plan = |specs: &[NodeSpec], role: NodeRole| -> Result<Vec<Node>, ProvisionError> {
      specs
        .iter()
        .map(|spec| {
          let mut node = Node::new(
            uuid::Uuid::new_v4().to_string(),
            &spec.name,
            role,
            cluster_id,
            self.provider,
          );
          node.size = spec.size.clone();
          node.region = spec.region.clone();
          node.zone = spec.zone.clone();
          cfg
            .add_node(node.clone())
            .map_err(|e| ProvisionError::InvalidSpec(e.to_string()))?;
          Ok(node)
        })
        .collect()
    };
    let masters = plan(&self.masters, NodeRole::Master)?;
    let workers = plan(&self.workers, NodeRole::Node)?;

    Ok((cfg, masters, workers))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spec() -> ClusterSpec {
    let mut spec = ClusterSpec::new("demo", Provider::Gce);
    spec.masters = vec![NodeSpec::named("master-0"), NodeSpec::named("master-1")];
    spec.workers = vec![NodeSpec::named("worker-0")];
    spec
  }

  #[test]
  fn test_plan_registers_every_node() {
    let (cfg, masters, workers) = spec().plan("c-1").unwrap();
    assert_eq!(cfg.cluster_id, "c-1");
    assert_eq!(cfg.masters.len(), 2);
    assert_eq!(cfg.nodes.len(), 1);
    assert_eq!(masters[0].name, "master-0");
    assert_eq!(workers[0].role, NodeRole::Node);
    assert!(cfg.all_nodes().iter().all(|n| n.cluster_id == "c-1"));
  }

  #[test]
  fn test_spec_without_masters_is_rejected() {
    let mut spec = spec();
    spec.masters.clear();
    assert!(matches!(spec.validate(), Err(ProvisionError::InvalidSpec(_))));
  }

  #[test]
  fn test_duplicate_node_names_are_rejected() {
    let mut spec = spec();
    spec.workers.push(NodeSpec::named("master-1"));
    let err = spec.validate().unwrap_err();
    assert!(err.to_string().contains("master-1"));
  }

  #[test]
  fn test_spec_from_json() {
    let spec: ClusterSpec = serde_json::from_str(
      r#"{
        "name": "demo",
        "provider": "aws",
        "aws": { "region": "us-east-1" },
        "masters": [{ "name": "master-0", "size": "m5.large" }],
        "workers": [{ "name": "worker-0" }]
      }"#,
    )
    .unwrap();
    assert_eq!(spec.provider, Provider::Aws);
    assert_eq!(spec.aws.region, "us-east-1");
    assert_eq!(spec.aws.vpc_cidr, "10.0.0.0/16");
    assert_eq!(spec.masters[0].size, "m5.large");
    assert_eq!(spec.node_count(), 2);
  }
}
