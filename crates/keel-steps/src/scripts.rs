//! Steps that run a rendered shell script on the current node.
//!
//! Every script step records its name in the node's `applied_scripts` once
//! the script exits cleanly, and skips the runner entirely when the marker
//! is present. Scripts are additionally written to be safe to re-run on the
//! host, since a crash between the script finishing and the checkpoint
//! landing replays the step.

use async_trait::async_trait;
use keel_config::{Config, KubeConfig, Node, NodeState, Provider};
use keel_journal::JournalWriter;
use keel_runner::{Template, run_template};
use keel_step::{Step, StepError};
use keel_workflow::steps;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const CONTAINER_RUNTIME: Template = Template::new(
  "container_runtime.sh",
  include_str!("../templates/container_runtime.sh.j2"),
);
const KUBELET_CONFIG: Template = Template::new(
  "kubelet_config.sh",
  include_str!("../templates/kubelet_config.sh.j2"),
);
const INSTALL_KUBELET: Template = Template::new(
  "install_kubelet.sh",
  include_str!("../templates/install_kubelet.sh.j2"),
);
const KUBEADM_INIT: Template = Template::new(
  "kubeadm_init.sh",
  include_str!("../templates/kubeadm_init.sh.j2"),
);
const POST_START: Template = Template::new("post_start.sh", include_str!("../templates/post_start.sh.j2"));
const KUBEADM_JOIN: Template = Template::new(
  "kubeadm_join.sh",
  include_str!("../templates/kubeadm_join.sh.j2"),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
  ContainerRuntime,
  KubeletConfig,
  InstallKubelet,
  KubeadmInit,
  PostStart,
  KubeadmJoin,
}

impl Script {
  pub const ALL: [Script; 6] = [
    Script::ContainerRuntime,
    Script::KubeletConfig,
    Script::InstallKubelet,
    Script::KubeadmInit,
    Script::PostStart,
    Script::KubeadmJoin,
  ];

  pub fn step_name(self) -> &'static str {
    match self {
      Script::ContainerRuntime => steps::INSTALL_CONTAINER_RUNTIME,
      Script::KubeletConfig => steps::KUBELET_CONFIG,
      Script::InstallKubelet => steps::INSTALL_KUBELET,
      Script::KubeadmInit => steps::KUBEADM_INIT,
      Script::PostStart => steps::POST_START,
      Script::KubeadmJoin => steps::KUBEADM_JOIN,
    }
  }

  fn description(self) -> &'static str {
    match self {
      Script::ContainerRuntime => "Install and configure containerd",
      Script::KubeletConfig => "Write kubelet node configuration",
      Script::InstallKubelet => "Install kubelet, kubeadm and kubectl",
      Script::KubeadmInit => "Initialize the control plane with kubeadm",
      Script::PostStart => "Wait for the API server and install the pod network",
      Script::KubeadmJoin => "Join the node to the cluster",
    }
  }

  fn template(self) -> &'static Template {
    match self {
      Script::ContainerRuntime => &CONTAINER_RUNTIME,
      Script::KubeletConfig => &KUBELET_CONFIG,
      Script::InstallKubelet => &INSTALL_KUBELET,
      Script::KubeadmInit => &KUBEADM_INIT,
      Script::PostStart => &POST_START,
      Script::KubeadmJoin => &KUBEADM_JOIN,
    }
  }

  fn depends(self) -> &'static [&'static str] {
    match self {
      Script::ContainerRuntime | Script::KubeletConfig => &[steps::CREATE_INSTANCE],
      Script::InstallKubelet => &[steps::INSTALL_CONTAINER_RUNTIME],
      Script::KubeadmInit | Script::KubeadmJoin => &[steps::INSTALL_KUBELET],
      Script::PostStart => &[steps::KUBEADM_INIT],
    }
  }
}

#[derive(Serialize)]
struct ScriptData<'a> {
  cluster_id: &'a str,
  cluster_name: &'a str,
  node: &'a Node,
  kube: &'a KubeConfig,
  kube_minor: String,
  endpoint: Option<String>,
  token: Option<&'a str>,
}

pub struct ScriptStep {
  script: Script,
}

impl ScriptStep {
  pub fn new(script: Script) -> Self {
    Self { script }
  }

  /// Fill in config the script needs before it runs. Anything recorded here
  /// survives a retry, so a re-run renders the same script.
  fn prepare(&self, cfg: &mut Config, node: &Node) -> Result<Option<String>, StepError> {
    match self.script {
      Script::KubeadmInit => {
        if cfg.kube.bootstrap_token.is_none() {
          cfg.kube.bootstrap_token = Some(bootstrap_token());
        }
        cfg.kube.internal_dns_name = node.private_ip.clone();
        control_plane_host(cfg, node).map(Some)
      }
      Script::KubeadmJoin => {
        if cfg.kube.bootstrap_token.is_none() {
          return Err(StepError::fatal("cluster has no bootstrap token"));
        }
        cfg
          .kube
          .api_endpoint()
          .map(Some)
          .ok_or_else(|| StepError::fatal("cluster has no API endpoint"))
      }
      _ => Ok(None),
    }
  }

  /// Record what the finished script produced.
  async fn finish(
    &self,
    cancel: &CancellationToken,
    cfg: &mut Config,
    endpoint: Option<String>,
  ) -> Result<(), StepError> {
    match self.script {
      Script::PostStart => {
        let node = cfg.node()?.clone();
        let host = control_plane_host(cfg, &node)?;
        info!(cluster_id = %cfg.cluster_id, endpoint = %host, "api_endpoint_published");
        cfg.kube.external_dns_name = Some(host);
        cfg.set_node_state(NodeState::Active, cancel).await?;
      }
      Script::KubeadmJoin => {
        info!(
          cluster_id = %cfg.cluster_id,
          endpoint = endpoint.as_deref().unwrap_or_default(),
          "node_joined"
        );
        cfg.set_node_state(NodeState::Active, cancel).await?;
      }
      _ => {}
    }
    Ok(())
  }
}

#[async_trait]
impl Step for ScriptStep {
  fn name(&self) -> &str {
    self.script.step_name()
  }

  fn description(&self) -> &str {
    self.script.description()
  }

  fn depends(&self) -> &[&'static str] {
    self.script.depends()
  }

  async fn run(
    &self,
    cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    let marker = self.script.step_name();
    let node = cfg.node()?.clone();
    if node.applied_scripts.contains(marker) {
      return Ok(());
    }
    let host = node
      .public_ip
      .clone()
      .ok_or_else(|| StepError::fatal(format!("node {} has no public address", node.name)))?;

    let endpoint = self.prepare(cfg, &node)?;
    let data = ScriptData {
      cluster_id: &cfg.cluster_id,
      cluster_name: &cfg.cluster_name,
      node: &node,
      kube: &cfg.kube,
      kube_minor: kube_minor(&cfg.kube.version),
      endpoint: endpoint.clone(),
      token: cfg.kube.bootstrap_token.as_deref(),
    };
    run_template(
      cancel,
      self.script.template(),
      cfg.runner.get()?,
      Some(&host),
      out,
      &data,
    )
    .await?;

    self.finish(cancel, cfg, endpoint).await?;

    cfg.node_mut()?.applied_scripts.insert(marker.to_string());
    cfg.sync_node()?;
    Ok(())
  }

  async fn rollback(
    &self,
    _cancel: &CancellationToken,
    _out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    match self.script {
      Script::KubeadmInit => {
        cfg.kube.bootstrap_token = None;
        cfg.kube.internal_dns_name = None;
      }
      Script::PostStart => cfg.kube.external_dns_name = None,
      _ => {}
    }
    if cfg.node_mut()?.applied_scripts.remove(self.script.step_name()) {
      cfg.sync_node()?;
    }
    Ok(())
  }
}

/// Where nodes reach the API server: the AWS load balancer when there is
/// one, else the bootstrap master's public address.
fn control_plane_host(cfg: &Config, node: &Node) -> Result<String, StepError> {
  if let Some(host) = &cfg.kube.external_dns_name {
    return Ok(host.clone());
  }
  if cfg.provider == Provider::Aws {
    if let Some(dns) = &cfg.aws.external_load_balancer_dns {
      return Ok(dns.clone());
    }
  }
  node
    .public_ip
    .clone()
    .ok_or_else(|| StepError::fatal(format!("node {} has no public address", node.name)))
}

/// kubeadm token, `[a-z0-9]{6}.[a-z0-9]{16}`.
fn bootstrap_token() -> String {
  let hex = Uuid::new_v4().simple().to_string();
  format!("{}.{}", &hex[..6], &hex[6..22])
}

/// `1.29.0` becomes `1.29`.
fn kube_minor(version: &str) -> String {
  version
    .trim_start_matches('v')
    .splitn(3, '.')
    .take(2)
    .collect::<Vec<_>>()
    .join(".")
}
