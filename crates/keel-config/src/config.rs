use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use keel_runner::Runner;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
  AwsConfig, AzureConfig, CloudAccount, ConfigError, DigitalOceanConfig, GceConfig, KubeConfig,
  Node, NodeEvents, NodeMap, NodeRole, NodeState, OpenStackConfig, PacketConfig, Provider,
  SshConfig,
};

/// Tag key every cloud resource carries with the owning cluster's id.
pub const CLUSTER_TAG: &str = "ClusterID";

pub type Tags = BTreeMap<String, String>;

/// Remote runner attached to a config. Not serialized; the runtime attaches
/// one after loading a checkpoint.
#[derive(Clone, Default)]
pub struct RunnerHandle(Option<Arc<dyn Runner>>);

impl RunnerHandle {
  pub fn new(runner: Arc<dyn Runner>) -> Self {
    Self(Some(runner))
  }

  pub fn get(&self) -> Result<&dyn Runner, ConfigError> {
    self.0.as_deref().ok_or(ConfigError::NoRunner)
  }

  pub fn is_attached(&self) -> bool {
    self.0.is_some()
  }
}

impl fmt::Debug for RunnerHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("RunnerHandle")
      .field(&self.0.as_ref().map(|_| "attached"))
      .finish()
  }
}

/// The envelope threaded through every step of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
  pub provider: Provider,
  #[serde(default)]
  pub cloud_account: CloudAccount,
  pub cluster_id: String,
  pub cluster_name: String,

  /// Node under construction by the current task, if any.
  #[serde(default)]
  pub node: Option<Node>,

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

  #[serde(default)]
  pub masters: NodeMap,
  #[serde(default)]
  pub nodes: NodeMap,

  #[serde(skip)]
  pub runner: RunnerHandle,
  #[serde(skip)]
  events: NodeEvents,
}

impl Config {
  pub fn new(
    provider: Provider,
    cluster_id: impl Into<String>,
    cluster_name: impl Into<String>,
  ) -> Self {
    Self {
      provider,
      cloud_account: CloudAccount::default(),
      cluster_id: cluster_id.into(),
      cluster_name: cluster_name.into(),
      node: None,
      aws: AwsConfig::default(),
      digitalocean: DigitalOceanConfig::default(),
      gce: GceConfig::default(),
      azure: AzureConfig::default(),
      openstack: OpenStackConfig::default(),
      packet: PacketConfig::default(),
      ssh: SshConfig::default(),
      kube: KubeConfig::default(),
      masters: NodeMap::new(),
      nodes: NodeMap::new(),
      runner: RunnerHandle::default(),
      events: NodeEvents::default(),
    }
  }

  /// A copy of this config with `node` as the current node.
  ///
  /// The copy shares the node maps and the event sink; every other field is
  /// owned by the copy.
  pub fn with_node(&self, node: Node) -> Self {
    let mut cfg = self.clone();
    cfg.node = Some(node);
    cfg
  }

  /// Take over the cluster-wide outputs of `base`: provider sub-configs,
  /// SSH and Kubernetes sections, and the shared node maps. The current node
  /// is kept and re-registered in the adopted maps.
  pub fn adopt_cluster_outputs(&mut self, base: &Config) -> Result<(), ConfigError> {
    self.cloud_account = base.cloud_account.clone();
    self.aws = base.aws.clone();
    self.digitalocean = base.digitalocean.clone();
    self.gce = base.gce.clone();
    self.azure = base.azure.clone();
    self.openstack = base.openstack.clone();
    self.packet = base.packet.clone();
    self.ssh = base.ssh.clone();
    self.kube = base.kube.clone();
    self.masters = base.masters.clone();
    self.nodes = base.nodes.clone();
    if self.node.is_some() {
      self.sync_node()?;
    }
    Ok(())
  }

  pub fn node(&self) -> Result<&Node, ConfigError> {
    self.node.as_ref().ok_or(ConfigError::NoCurrentNode)
  }

  pub fn node_mut(&mut self) -> Result<&mut Node, ConfigError> {
    self.node.as_mut().ok_or(ConfigError::NoCurrentNode)
  }

  pub fn attach_runner(&mut self, runner: Arc<dyn Runner>) {
    self.runner = RunnerHandle::new(runner);
  }

  pub fn set_events(&mut self, events: NodeEvents) {
    self.events = events;
  }

  pub fn events(&self) -> &NodeEvents {
    &self.events
  }

  /// Insert or replace `node` in the map for its role.
  ///
  /// Fails if the id is already registered under the other role. Both maps
  /// stay locked for the check and the insert, masters before nodes.
  pub fn add_node(&self, node: Node) -> Result<(), ConfigError> {
    let mut masters = self.masters.lock();
    let mut nodes = self.nodes.lock();
    let (own, other, other_role) = match node.role {
      NodeRole::Master => (&mut *masters, &*nodes, NodeRole::Node),
      NodeRole::Node => (&mut *nodes, &*masters, NodeRole::Master),
    };
    if other.contains_key(&node.id) {
      return Err(ConfigError::DuplicateNode {
        id: node.id,
        existing: other_role.to_string(),
      });
    }
    own.insert(node.id.clone(), node);
    Ok(())
  }

  pub fn remove_node(&self, id: &str) -> Option<Node> {
    self.masters.remove(id).or_else(|| self.nodes.remove(id))
  }

  pub fn find_node(&self, id: &str) -> Option<Node> {
    self.masters.get(id).or_else(|| self.nodes.get(id))
  }

  /// Masters followed by workers, each ordered by id.
  pub fn all_nodes(&self) -> Vec<Node> {
    let mut all = self.masters.snapshot();
    all.extend(self.nodes.snapshot());
    all
  }

  /// The first active master, or the master with the lowest id if none is
  /// active yet.
  pub fn get_master(&self) -> Option<Node> {
    let masters = self.masters.snapshot();
    masters
      .iter()
      .find(|n| n.state == NodeState::Active)
      .or_else(|| masters.first())
      .cloned()
  }

  /// Copy the current node into its role's map.
  pub fn sync_node(&self) -> Result<(), ConfigError> {
    let node = self.node()?.clone();
    self.add_node(node)
  }

  /// Transition the current node to `state`.
  ///
  /// The map is updated before the event is published, and no lock is held
  /// while publishing. Returns `false` when the node already was in `state`;
  /// no event is emitted in that case.
  pub async fn set_node_state(
    &mut self,
    state: NodeState,
    cancel: &CancellationToken,
  ) -> Result<bool, ConfigError> {
    let node = self.node_mut()?;
    if node.state == state {
      return Ok(false);
    }
    node.state = state;
    let snapshot = node.clone();

    self.add_node(snapshot.clone())?;
    self.events.publish(snapshot, cancel).await?;
    Ok(true)
  }

  /// Tags every resource created for this cluster carries.
  pub fn cluster_tags(&self) -> Tags {
    let mut tags = Tags::new();
    tags.insert(CLUSTER_TAG.to_string(), self.cluster_id.clone());
    tags.insert("KubernetesCluster".to_string(), self.cluster_name.clone());
    tags
  }

  /// Cluster tags plus a `Name` tag.
  pub fn tags_named(&self, name: &str) -> Tags {
    let mut tags = self.cluster_tags();
    tags.insert("Name".to_string(), name.to_string());
    tags
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node_events;

  fn master(id: &str) -> Node {
    Node::new(id, id, NodeRole::Master, "c-1", Provider::Aws)
  }

  fn worker(id: &str) -> Node {
    Node::new(id, id, NodeRole::Node, "c-1", Provider::Aws)
  }

  fn config() -> Config {
    Config::new(Provider::Aws, "c-1", "demo")
  }

  #[test]
  fn test_add_node_enforces_disjointness() {
    let cfg = config();
    cfg.add_node(master("n-1")).unwrap();

    let err = cfg.add_node(worker("n-1")).unwrap_err();
    assert_eq!(
      err,
      ConfigError::DuplicateNode {
        id: "n-1".to_string(),
        existing: "master".to_string(),
      }
    );
    assert!(cfg.nodes.is_empty());

    // Replacing within the same role is fine.
    cfg.add_node(master("n-1")).unwrap();
    assert_eq!(cfg.masters.len(), 1);
  }

  #[test]
  fn test_concurrent_add_node_keeps_roles_disjoint() {
    for round in 0..50 {
      let cfg = config();
      let id = format!("n-{round}");
      let handles: Vec<_> = (0..8)
        .map(|i| {
          let cfg = cfg.clone();
          let node = if i % 2 == 0 { master(&id) } else { worker(&id) };
          std::thread::spawn(move || cfg.add_node(node).is_ok())
        })
        .collect();
      for handle in handles {
        handle.join().unwrap();
      }

      assert_eq!(cfg.masters.len() + cfg.nodes.len(), 1, "round {round}");
    }
  }

  #[test]
  fn test_with_node_shares_maps() {
    let base = config();
    let child = base.with_node(worker("w-1"));
    child.sync_node().unwrap();

    assert!(base.nodes.contains("w-1"));
    assert!(base.node.is_none());
  }

  #[test]
  fn test_get_master_prefers_active() {
    let cfg = config();
    cfg.add_node(master("m-0")).unwrap();
    let mut active = master("m-1");
    active.state = NodeState::Active;
    cfg.add_node(active).unwrap();

    assert_eq!(cfg.get_master().unwrap().id, "m-1");
  }

  #[test]
  fn test_get_master_falls_back_to_lowest_id() {
    let cfg = config();
    cfg.add_node(master("m-1")).unwrap();
    cfg.add_node(master("m-0")).unwrap();

    assert_eq!(cfg.get_master().unwrap().id, "m-0");
    assert!(config().get_master().is_none());
  }

  #[tokio::test]
  async fn test_set_node_state_publishes_once_per_transition() {
    let (events, mut rx) = node_events(4);
    let mut cfg = config().with_node(master("m-0"));
    cfg.set_events(events);
    let cancel = CancellationToken::new();

    assert!(cfg.set_node_state(NodeState::Building, &cancel).await.unwrap());
    assert!(!cfg.set_node_state(NodeState::Building, &cancel).await.unwrap());
    assert!(cfg.set_node_state(NodeState::Active, &cancel).await.unwrap());

    assert_eq!(rx.recv().await.unwrap().state, NodeState::Building);
    assert_eq!(rx.recv().await.unwrap().state, NodeState::Active);
    assert!(rx.try_recv().is_err());
    assert_eq!(cfg.masters.get("m-0").unwrap().state, NodeState::Active);
  }

  #[tokio::test]
  async fn test_set_node_state_without_node() {
    let mut cfg = config();
    let err = cfg
      .set_node_state(NodeState::Active, &CancellationToken::new())
      .await
      .unwrap_err();
    assert_eq!(err, ConfigError::NoCurrentNode);
  }

  #[test]
  fn test_round_trip_preserves_maps_and_sub_configs() {
    let mut cfg = config();
    cfg.aws.region = "us-east-1".into();
    cfg.aws.vpc_id = Some("vpc-1".into());
    cfg.aws.subnets.insert("us-east-1a".into(), "subnet-1".into());
    cfg.kube.external_dns_name = Some("lb.example.com".into());
    cfg.add_node(master("m-0")).unwrap();
    cfg.add_node(worker("w-0")).unwrap();
    cfg.node = Some(worker("w-0"));

    let json = serde_json::to_string(&cfg).unwrap();
    let back: Config = serde_json::from_str(&json).unwrap();

    assert_eq!(back.aws, cfg.aws);
    assert_eq!(back.kube, cfg.kube);
    assert_eq!(back.ssh, cfg.ssh);
    assert_eq!(back.node, cfg.node);
    assert_eq!(back.masters.snapshot(), cfg.masters.snapshot());
    assert_eq!(back.nodes.snapshot(), cfg.nodes.snapshot());
    assert!(!back.runner.is_attached());
    assert!(!back.events().is_connected());
  }

  #[test]
  fn test_adopt_cluster_outputs_keeps_node() {
    let base = config();
    base.add_node(master("m-0")).unwrap();
    let mut published = base.clone();
    published.aws.vpc_id = Some("vpc-1".into());
    published.kube.bootstrap_token = Some("abcdef.0123456789abcdef".into());

    // A config restored from a checkpoint has maps of its own.
    let mut joiner: Config =
      serde_json::from_str(&serde_json::to_string(&base.with_node(worker("w-0"))).unwrap())
        .unwrap();
    assert!(!joiner.masters.shares_with(&base.masters));

    joiner.adopt_cluster_outputs(&published).unwrap();
    assert_eq!(joiner.aws.vpc_id.as_deref(), Some("vpc-1"));
    assert!(joiner.kube.bootstrap_token.is_some());
    assert_eq!(joiner.node().unwrap().id, "w-0");
    assert!(joiner.masters.shares_with(&base.masters));
    assert!(base.nodes.contains("w-0"));
  }

  #[test]
  fn test_cluster_tags() {
    let tags = config().tags_named("vpc");
    assert_eq!(tags.get(CLUSTER_TAG).map(String::as_str), Some("c-1"));
    assert_eq!(tags.get("Name").map(String::as_str), Some("vpc"));
  }
}
