use std::net::Ipv4Addr;

use keel_config::Config;
use keel_journal::JournalWriter;
use keel_step::StepError;
use keel_workflow::steps;

use crate::api::{AwsApi, ignore_not_found};
use crate::journal;

const IMAGE_FILTER: &str = "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*";

/// AWS load balancer names are capped at 32 characters.
const MAX_LB_NAME: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fabric {
  Image,
  Vpc,
  SecurityGroups,
  InstanceProfiles,
  KeyPair,
  InternetGateway,
  Subnets,
  RouteTable,
  RouteTableAssociations,
  LoadBalancer,
}

impl Fabric {
  pub const ALL: [Fabric; 10] = [
    Fabric::Image,
    Fabric::Vpc,
    Fabric::SecurityGroups,
    Fabric::InstanceProfiles,
    Fabric::KeyPair,
    Fabric::InternetGateway,
    Fabric::Subnets,
    Fabric::RouteTable,
    Fabric::RouteTableAssociations,
    Fabric::LoadBalancer,
  ];

  pub fn create_step(self) -> &'static str {
    match self {
      Fabric::Image => steps::FIND_AMI,
      Fabric::Vpc => steps::CREATE_VPC,
      Fabric::SecurityGroups => steps::CREATE_SECURITY_GROUPS,
      Fabric::InstanceProfiles => steps::CREATE_INSTANCE_PROFILES,
      Fabric::KeyPair => steps::IMPORT_KEY_PAIR,
      Fabric::InternetGateway => steps::CREATE_INTERNET_GATEWAY,
      Fabric::Subnets => steps::CREATE_SUBNETS,
      Fabric::RouteTable => steps::CREATE_ROUTE_TABLE,
      Fabric::RouteTableAssociations => steps::ASSOCIATE_ROUTE_TABLE,
      Fabric::LoadBalancer => steps::CREATE_LOAD_BALANCER,
    }
  }

  pub fn delete_step(self) -> Option<&'static str> {
    let name = match self {
      Fabric::Image => return None,
      Fabric::Vpc => steps::DELETE_VPC,
      Fabric::SecurityGroups => steps::DELETE_SECURITY_GROUPS,
      Fabric::InstanceProfiles => steps::DELETE_INSTANCE_PROFILES,
      Fabric::KeyPair => steps::DELETE_KEY_PAIR,
      Fabric::InternetGateway => steps::DELETE_INTERNET_GATEWAY,
      Fabric::Subnets => steps::DELETE_SUBNETS,
      Fabric::RouteTable => steps::DELETE_ROUTE_TABLE,
      Fabric::RouteTableAssociations => steps::DISASSOCIATE_ROUTE_TABLE,
      Fabric::LoadBalancer => steps::DELETE_LOAD_BALANCER,
    };
    Some(name)
  }

  pub(crate) fn create_description(self) -> &'static str {
    match self {
      Fabric::Image => "Find the machine image for cluster nodes",
      Fabric::Vpc => "Create the cluster VPC",
      Fabric::SecurityGroups => "Create master and node security groups",
      Fabric::InstanceProfiles => "Create master and node instance profiles",
      Fabric::KeyPair => "Import the bootstrap SSH key pair",
      Fabric::InternetGateway => "Create and attach the internet gateway",
      Fabric::Subnets => "Create one subnet per availability zone",
      Fabric::RouteTable => "Create the public route table",
      Fabric::RouteTableAssociations => "Associate subnets with the route table",
      Fabric::LoadBalancer => "Create the API server load balancer",
    }
  }

  pub(crate) fn delete_description(self) -> &'static str {
    match self {
      Fabric::Image => "",
      Fabric::Vpc => "Delete the cluster VPC",
      Fabric::SecurityGroups => "Delete master and node security groups",
      Fabric::InstanceProfiles => "Delete master and node instance profiles",
      Fabric::KeyPair => "Delete the bootstrap SSH key pair",
      Fabric::InternetGateway => "Detach and delete the internet gateway",
      Fabric::Subnets => "Delete cluster subnets",
      Fabric::RouteTable => "Delete the public route table",
      Fabric::RouteTableAssociations => "Disassociate subnets from the route table",
      Fabric::LoadBalancer => "Delete the API server load balancer",
    }
  }

  pub(crate) fn depends(self) -> &'static [&'static str] {
    match self {
      Fabric::Image | Fabric::Vpc | Fabric::InstanceProfiles | Fabric::KeyPair => &[],
      Fabric::SecurityGroups | Fabric::InternetGateway | Fabric::Subnets => &[steps::CREATE_VPC],
      Fabric::RouteTable => &[steps::CREATE_INTERNET_GATEWAY],
      Fabric::RouteTableAssociations => &[steps::CREATE_ROUTE_TABLE, steps::CREATE_SUBNETS],
      Fabric::LoadBalancer => &[steps::CREATE_SUBNETS, steps::CREATE_SECURITY_GROUPS],
    }
  }

  /// Create the resource unless the config already records it.
  pub async fn ensure(
    self,
    api: &dyn AwsApi,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    match self {
      Fabric::Image => {
        if cfg.aws.image_id.is_some() {
          return Ok(());
        }
        if cfg.aws.region.is_empty() {
          return Err(StepError::fatal("aws.region is not set"));
        }
        let image = api.find_image(&cfg.aws.region, IMAGE_FILTER).await?;
        journal(out, &format!("using image {image}")).await;
        cfg.aws.image_id = Some(image);
      }

      Fabric::Vpc => {
        if cfg.aws.vpc_id.is_some() {
          return Ok(());
        }
        let tags = cfg.tags_named(&format!("{}-vpc", cfg.cluster_name));
        let id = api.create_vpc(&cfg.aws.vpc_cidr, &tags).await?;
        journal(out, &format!("created vpc {id}")).await;
        cfg.aws.vpc_id = Some(id);
      }

      Fabric::SecurityGroups => {
        let vpc = required(&cfg.aws.vpc_id, "aws.vpc_id")?;
        if cfg.aws.masters_security_group_id.is_none() {
          let name = format!("{}-masters", cfg.cluster_name);
          let id = api
            .create_security_group(&vpc, &name, &cfg.tags_named(&name))
            .await?;
          journal(out, &format!("created security group {id} ({name})")).await;
          cfg.aws.masters_security_group_id = Some(id);
        }
        if cfg.aws.nodes_security_group_id.is_none() {
          let name = format!("{}-nodes", cfg.cluster_name);
          let id = api
            .create_security_group(&vpc, &name, &cfg.tags_named(&name))
            .await?;
          journal(out, &format!("created security group {id} ({name})")).await;
          cfg.aws.nodes_security_group_id = Some(id);
        }
      }

      Fabric::InstanceProfiles => {
        if cfg.aws.masters_instance_profile.is_none() {
          let name = format!("keel-{}-master", cfg.cluster_id);
          accept_existing(api.create_instance_profile(&name, &cfg.tags_named(&name)).await)?;
          journal(out, &format!("instance profile {name} ready")).await;
          cfg.aws.masters_instance_profile = Some(name);
        }
        if cfg.aws.nodes_instance_profile.is_none() {
          let name = format!("keel-{}-node", cfg.cluster_id);
          accept_existing(api.create_instance_profile(&name, &cfg.tags_named(&name)).await)?;
          journal(out, &format!("instance profile {name} ready")).await;
          cfg.aws.nodes_instance_profile = Some(name);
        }
      }

      Fabric::KeyPair => {
        if cfg.aws.key_pair_name.is_some() {
          return Ok(());
        }
        let key = bootstrap_key(cfg)?;
        let name = format!("keel-{}", cfg.cluster_id);
        accept_existing(api.import_key_pair(&name, &key, &cfg.tags_named(&name)).await)?;
        journal(out, &format!("key pair {name} ready")).await;
        cfg.aws.key_pair_name = Some(name);
      }

      Fabric::InternetGateway => {
        if cfg.aws.internet_gateway_id.is_some() {
          return Ok(());
        }
        let vpc = required(&cfg.aws.vpc_id, "aws.vpc_id")?;
        let tags = cfg.tags_named(&format!("{}-igw", cfg.cluster_name));
        let id = api.create_internet_gateway(&vpc, &tags).await?;
        journal(out, &format!("created internet gateway {id}")).await;
        cfg.aws.internet_gateway_id = Some(id);
      }

      Fabric::Subnets => {
        let vpc = required(&cfg.aws.vpc_id, "aws.vpc_id")?;
        for (index, zone) in cfg.aws.zones().into_iter().enumerate() {
          if cfg.aws.subnets.contains_key(&zone) {
            continue;
          }
          let cidr = subnet_cidr(&cfg.aws.vpc_cidr, index)?;
          let tags = cfg.tags_named(&format!("{}-{zone}", cfg.cluster_name));
          let id = api.create_subnet(&vpc, &zone, &cidr, &tags).await?;
          journal(out, &format!("created subnet {id} ({zone}, {cidr})")).await;
          cfg.aws.subnets.insert(zone, id);
        }
      }

      Fabric::RouteTable => {
        if cfg.aws.route_table_id.is_some() {
          return Ok(());
        }
        let vpc = required(&cfg.aws.vpc_id, "aws.vpc_id")?;
        let gateway = required(&cfg.aws.internet_gateway_id, "aws.internet_gateway_id")?;
        let tags = cfg.tags_named(&format!("{}-public", cfg.cluster_name));
        let id = api.create_route_table(&vpc, &gateway, &tags).await?;
        journal(out, &format!("created route table {id}")).await;
        cfg.aws.route_table_id = Some(id);
      }

      Fabric::RouteTableAssociations => {
        let table = required(&cfg.aws.route_table_id, "aws.route_table_id")?;
        let subnets: Vec<String> = cfg.aws.subnets.values().cloned().collect();
        if subnets.is_empty() {
          return Err(StepError::fatal("no subnets to associate"));
        }
        for subnet in subnets {
          if cfg.aws.route_table_associations.contains_key(&subnet) {
            continue;
          }
          let association = api.associate_route_table(&table, &subnet).await?;
          journal(out, &format!("associated {subnet} with {table}")).await;
          cfg.aws.route_table_associations.insert(subnet, association);
        }
      }

      Fabric::LoadBalancer => {
        if cfg.aws.external_load_balancer_name.is_some() {
          return Ok(());
        }
        let subnets: Vec<String> = cfg.aws.subnets.values().cloned().collect();
        if subnets.is_empty() {
          return Err(StepError::fatal("no subnets for the load balancer"));
        }
        let group = required(
          &cfg.aws.masters_security_group_id,
          "aws.masters_security_group_id",
        )?;
        let name = load_balancer_name(&cfg.cluster_id);
        let dns = match api
          .create_load_balancer(&name, &subnets, &group, &cfg.tags_named(&name))
          .await
        {
          Err(StepError::AlreadyExists { .. }) => api.describe_load_balancer(&name).await?,
          other => other?,
        };
        journal(out, &format!("load balancer {name} at {dns}")).await;
        cfg.aws.external_load_balancer_name = Some(name);
        cfg.aws.external_load_balancer_dns = Some(dns);
      }
    }
    Ok(())
  }

  /// Delete whatever the config records for this resource. Absent
  /// resources count as deleted.
  pub async fn remove(
    self,
    api: &dyn AwsApi,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    match self {
      // Nothing was created.
      Fabric::Image => {}

      Fabric::Vpc => {
        if let Some(id) = cfg.aws.vpc_id.clone() {
          ignore_not_found(api.delete_vpc(&id).await)?;
          journal(out, &format!("deleted vpc {id}")).await;
          cfg.aws.vpc_id = None;
        }
      }

      Fabric::SecurityGroups => {
        if let Some(id) = cfg.aws.nodes_security_group_id.clone() {
          ignore_not_found(api.delete_security_group(&id).await)?;
          journal(out, &format!("deleted security group {id}")).await;
          cfg.aws.nodes_security_group_id = None;
        }
        if let Some(id) = cfg.aws.masters_security_group_id.clone() {
          ignore_not_found(api.delete_security_group(&id).await)?;
          journal(out, &format!("deleted security group {id}")).await;
          cfg.aws.masters_security_group_id = None;
        }
      }

      Fabric::InstanceProfiles => {
        if let Some(name) = cfg.aws.nodes_instance_profile.clone() {
          ignore_not_found(api.delete_instance_profile(&name).await)?;
          journal(out, &format!("deleted instance profile {name}")).await;
          cfg.aws.nodes_instance_profile = None;
        }
        if let Some(name) = cfg.aws.masters_instance_profile.clone() {
          ignore_not_found(api.delete_instance_profile(&name).await)?;
          journal(out, &format!("deleted instance profile {name}")).await;
          cfg.aws.masters_instance_profile = None;
        }
      }

      Fabric::KeyPair => {
        if let Some(name) = cfg.aws.key_pair_name.clone() {
          ignore_not_found(api.delete_key_pair(&name).await)?;
          journal(out, &format!("deleted key pair {name}")).await;
          cfg.aws.key_pair_name = None;
        }
      }

      Fabric::InternetGateway => {
        if let Some(id) = cfg.aws.internet_gateway_id.clone() {
          ignore_not_found(api.delete_internet_gateway(&id).await)?;
          journal(out, &format!("deleted internet gateway {id}")).await;
          cfg.aws.internet_gateway_id = None;
        }
      }

      Fabric::Subnets => {
        for (zone, id) in cfg.aws.subnets.clone() {
          ignore_not_found(api.delete_subnet(&id).await)?;
          journal(out, &format!("deleted subnet {id} ({zone})")).await;
          cfg.aws.subnets.remove(&zone);
        }
      }

      Fabric::RouteTable => {
        if let Some(id) = cfg.aws.route_table_id.clone() {
          ignore_not_found(api.delete_route_table(&id).await)?;
          journal(out, &format!("deleted route table {id}")).await;
          cfg.aws.route_table_id = None;
        }
      }

      Fabric::RouteTableAssociations => {
        for (subnet, association) in cfg.aws.route_table_associations.clone() {
          ignore_not_found(api.disassociate_route_table(&association).await)?;
          journal(out, &format!("disassociated {subnet}")).await;
          cfg.aws.route_table_associations.remove(&subnet);
        }
      }

      Fabric::LoadBalancer => {
        if let Some(name) = cfg.aws.external_load_balancer_name.clone() {
          ignore_not_found(api.delete_load_balancer(&name).await)?;
          journal(out, &format!("deleted load balancer {name}")).await;
          cfg.aws.external_load_balancer_name = None;
          cfg.aws.external_load_balancer_dns = None;
        }
      }
    }
    Ok(())
  }
}

fn required(value: &Option<String>, field: &str) -> Result<String, StepError> {
  value
    .clone()
    .ok_or_else(|| StepError::fatal(format!("{field} is not set")))
}

/// Named resources left over from an interrupted run are reused.
fn accept_existing<T>(result: Result<T, StepError>) -> Result<(), StepError> {
  match result {
    Ok(_) | Err(StepError::AlreadyExists { .. }) => Ok(()),
    Err(e) => Err(e),
  }
}

fn bootstrap_key(cfg: &Config) -> Result<String, StepError> {
  [&cfg.ssh.bootstrap_public_key, &cfg.ssh.public_key]
    .into_iter()
    .find(|k| !k.is_empty())
    .cloned()
    .ok_or_else(|| StepError::fatal("no SSH public key configured"))
}

fn load_balancer_name(cluster_id: &str) -> String {
  let mut name = format!("keel-{cluster_id}-api");
  name.truncate(MAX_LB_NAME);
  name
}

/// The `index`-th /24 inside the VPC range.
fn subnet_cidr(vpc_cidr: &str, index: usize) -> Result<String, StepError> {
  let base = vpc_cidr.split('/').next().unwrap_or_default();
  let addr: Ipv4Addr = base
    .parse()
    .map_err(|_| StepError::fatal(format!("invalid vpc cidr '{vpc_cidr}'")))?;
  let third = u8::try_from(index)
    .map_err(|_| StepError::fatal(format!("too many subnets for '{vpc_cidr}'")))?;
  let [a, b, _, _] = addr.octets();
  Ok(format!("{a}.{b}.{third}.0/24"))
}
