//! Instance lifecycle steps shared by every provider.

use async_trait::async_trait;
use keel_config::{Config, Node, NodeState, Provider};
use keel_journal::JournalWriter;
use keel_step::{Step, StepError, poll_until};
use keel_workflow::steps;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{ComputeApi, InstanceRequest, InstanceState, InstanceStatus, ignore_not_found};
use crate::{Clouds, journal};

/// Boot the current node's instance and wait until it has addresses.
///
/// Moves the node to `building` before the create call and to
/// `provisioning` once both addresses are known. A node that already has an
/// instance id and a public address is left alone; a node with only an
/// instance id (interrupted mid-boot) resumes polling without creating a
/// second instance. An instance that never comes up stays recorded on the
/// node, so rollback deletes it.
pub struct CreateInstance {
  clouds: Clouds,
}

impl CreateInstance {
  pub fn new(clouds: Clouds) -> Self {
    Self { clouds }
  }
}

#[async_trait]
impl Step for CreateInstance {
  fn name(&self) -> &str {
    steps::CREATE_INSTANCE
  }

  fn description(&self) -> &str {
    "Create the node's instance and wait for its addresses"
  }

  async fn run(
    &self,
    cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    let node = cfg.node()?.clone();
    if node.instance_id.is_some() && node.public_ip.is_some() {
      return Ok(());
    }
    let api = self.clouds.compute(cfg.provider)?;

    cfg.set_node_state(NodeState::Building, cancel).await?;

    let instance_id = match node.instance_id.clone() {
      Some(id) => id,
      None => {
        let request = instance_request(cfg, &node)?;
        let id = api.create_instance(&request).await?;
        info!(node_id = %node.id, instance_id = %id, "instance_created");
        journal(out, &format!("created instance {id} for {}", node.name)).await;
        cfg.node_mut()?.instance_id = Some(id.clone());
        cfg.sync_node()?;
        id
      }
    };

    let status = wait_for_addresses(api, &instance_id, &self.clouds, cancel).await?;
    journal(
      out,
      &format!(
        "instance {instance_id} up: public {}, private {}",
        status.public_ip.as_deref().unwrap_or("-"),
        status.private_ip.as_deref().unwrap_or("-"),
      ),
    )
    .await;

    let current = cfg.node_mut()?;
    current.private_ip = status.private_ip;
    current.public_ip = status.public_ip;
    cfg.sync_node()?;

    cfg.set_node_state(NodeState::Provisioning, cancel).await?;
    Ok(())
  }

  async fn rollback(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    let Some(instance_id) = cfg.node()?.instance_id.clone() else {
      return Ok(());
    };
    let api = self.clouds.compute(cfg.provider)?;
    ignore_not_found(api.delete_instance(&instance_id).await)?;
    journal(out, &format!("deleted instance {instance_id}")).await;

    let node = cfg.node_mut()?;
    node.instance_id = None;
    node.private_ip = None;
    node.public_ip = None;
    cfg.sync_node()?;
    Ok(())
  }
}

/// Delete the current node's instance and drop the node from the cluster.
pub struct DeleteInstance {
  clouds: Clouds,
}

impl DeleteInstance {
  pub fn new(clouds: Clouds) -> Self {
    Self { clouds }
  }
}

#[async_trait]
impl Step for DeleteInstance {
  fn name(&self) -> &str {
    steps::DELETE_INSTANCE
  }

  fn description(&self) -> &str {
    "Delete the node's instance"
  }

  async fn run(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    let node = cfg.node()?.clone();
    if let Some(instance_id) = &node.instance_id {
      let api = self.clouds.compute(cfg.provider)?;
      ignore_not_found(api.delete_instance(instance_id).await)?;
      info!(node_id = %node.id, instance_id = %instance_id, "instance_deleted");
      journal(out, &format!("deleted instance {instance_id} ({})", node.name)).await;
      cfg.node_mut()?.instance_id = None;
    }
    cfg.remove_node(&node.id);
    Ok(())
  }

  async fn rollback(
    &self,
    _cancel: &CancellationToken,
    _out: &JournalWriter,
    _cfg: &mut Config,
  ) -> Result<(), StepError> {
    Ok(())
  }
}

async fn wait_for_addresses(
  api: &dyn ComputeApi,
  instance_id: &str,
  clouds: &Clouds,
  cancel: &CancellationToken,
) -> Result<InstanceStatus, StepError> {
  poll_until("wait-for-addresses", &clouds.poll, cancel, move || async move {
    let status = api.describe_instance(instance_id).await?;
    match status.state {
      InstanceState::Terminated => Err(StepError::provider(format!(
        "instance {instance_id} terminated while booting"
      ))),
      InstanceState::Running if status.public_ip.is_some() && status.private_ip.is_some() => {
        Ok(Some(status))
      }
      _ => Ok(None),
    }
  })
  .await
}

fn instance_request(cfg: &Config, node: &Node) -> Result<InstanceRequest, StepError> {
  let mut tags = cfg.tags_named(&node.name);
  tags.insert("Role".to_string(), node.role.to_string());

  let mut request = InstanceRequest {
    name: node.name.clone(),
    region: node.region.clone(),
    zone: node.zone.clone(),
    size: node.size.clone(),
    key_name: cfg.ssh.imported_key_id.clone(),
    tags,
    ..InstanceRequest::default()
  };

  let (region, image) = match cfg.provider {
    Provider::Aws => {
      let aws = &cfg.aws;
      let zone = node
        .zone
        .clone()
        .or_else(|| aws.subnets.keys().next().cloned())
        .ok_or_else(|| StepError::fatal("cluster has no subnets"))?;
      let subnet = aws
        .subnets
        .get(&zone)
        .cloned()
        .ok_or_else(|| StepError::fatal(format!("no subnet in zone {zone}")))?;
      let (group, profile) = if node.is_master() {
        (&aws.masters_security_group_id, &aws.masters_instance_profile)
      } else {
        (&aws.nodes_security_group_id, &aws.nodes_instance_profile)
      };

      request.zone = Some(zone);
      request.subnet_id = Some(subnet);
      request.security_group_id = group.clone();
      request.instance_profile = profile.clone();
      request.key_name = aws.key_pair_name.clone();
      (aws.region.as_str(), aws.image_id.as_deref().unwrap_or_default())
    }
    Provider::DigitalOcean => (cfg.digitalocean.region.as_str(), cfg.digitalocean.image.as_str()),
    Provider::Gce => (cfg.gce.zone.as_str(), cfg.gce.image.as_str()),
    Provider::Azure => (cfg.azure.location.as_str(), cfg.azure.image.as_str()),
    Provider::OpenStack => {
      request.subnet_id = cfg.openstack.network_id.clone();
      (cfg.openstack.region.as_str(), cfg.openstack.image.as_str())
    }
    Provider::Packet => (cfg.packet.facility.as_str(), cfg.packet.operating_system.as_str()),
  };

  if request.region.is_empty() {
    request.region = region.to_string();
  }
  if !image.is_empty() {
    request.image = Some(image.to_string());
  }
  Ok(request)
}
