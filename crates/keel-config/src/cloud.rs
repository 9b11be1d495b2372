//! Provider sub-configs and the SSH / Kubernetes sections of [`crate::Config`].
//!
//! Fields left as `Option` are step outputs: a step checks them before doing
//! any work and fills them in once the resource exists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reference to the cloud account credentials; the secret itself lives
/// outside the config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudAccount {
  pub name: String,
  pub credentials_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
  pub region: String,
  pub availability_zones: Vec<String>,
  pub vpc_cidr: String,

  pub image_id: Option<String>,
  pub vpc_id: Option<String>,
  pub masters_security_group_id: Option<String>,
  pub nodes_security_group_id: Option<String>,
  pub masters_instance_profile: Option<String>,
  pub nodes_instance_profile: Option<String>,
  pub key_pair_name: Option<String>,
  pub internet_gateway_id: Option<String>,
  /// Availability zone → subnet id.
  pub subnets: BTreeMap<String, String>,
  pub route_table_id: Option<String>,
  /// Subnet id → route table association id.
  pub route_table_associations: BTreeMap<String, String>,
  pub external_load_balancer_name: Option<String>,
  pub external_load_balancer_dns: Option<String>,
}

impl Default for AwsConfig {
  fn default() -> Self {
    Self {
      region: String::new(),
      availability_zones: Vec::new(),
      vpc_cidr: "10.0.0.0/16".to_string(),
      image_id: None,
      vpc_id: None,
      masters_security_group_id: None,
      nodes_security_group_id: None,
      masters_instance_profile: None,
      nodes_instance_profile: None,
      key_pair_name: None,
      internet_gateway_id: None,
      subnets: BTreeMap::new(),
      route_table_id: None,
      route_table_associations: BTreeMap::new(),
      external_load_balancer_name: None,
      external_load_balancer_dns: None,
    }
  }
}

impl AwsConfig {
  /// Zones to spread subnets over; falls back to `<region>a`.
  pub fn zones(&self) -> Vec<String> {
    if self.availability_zones.is_empty() {
      vec![format!("{}a", self.region)]
    } else {
      self.availability_zones.clone()
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOceanConfig {
  pub region: String,
  pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GceConfig {
  pub project_id: String,
  pub zone: String,
  pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
  pub location: String,
  pub resource_group: String,
  pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenStackConfig {
  pub auth_url: String,
  pub region: String,
  pub image: String,
  pub network_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
  pub project_id: String,
  pub facility: String,
  pub operating_system: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
  pub user: String,
  pub port: u16,
  /// Keypair used by the runner to reach freshly created hosts.
  pub bootstrap_public_key: String,
  pub bootstrap_private_key: String,
  /// Key supplied by the user, installed alongside the bootstrap key.
  pub public_key: String,
  /// Provider-side id of the imported key, once imported.
  pub imported_key_id: Option<String>,
  pub timeout_secs: u64,
}

impl Default for SshConfig {
  fn default() -> Self {
    Self {
      user: "ubuntu".to_string(),
      port: 22,
      bootstrap_public_key: String::new(),
      bootstrap_private_key: String::new(),
      public_key: String::new(),
      imported_key_id: None,
      timeout_secs: 30,
    }
  }
}

/// PEM material for the cluster CA and admin client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateMaterial {
  pub ca_cert: String,
  pub ca_key: String,
  pub admin_cert: String,
  pub admin_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
  pub version: String,
  pub external_dns_name: Option<String>,
  pub internal_dns_name: Option<String>,
  pub bootstrap_token: Option<String>,
  pub certificates: CertificateMaterial,
  pub api_server_port: u16,
  pub service_cidr: String,
  pub pod_cidr: String,
}

impl Default for KubeConfig {
  fn default() -> Self {
    Self {
      version: "1.29.0".to_string(),
      external_dns_name: None,
      internal_dns_name: None,
      bootstrap_token: None,
      certificates: CertificateMaterial::default(),
      api_server_port: 443,
      service_cidr: "10.96.0.0/12".to_string(),
      pod_cidr: "10.244.0.0/16".to_string(),
    }
  }
}

impl KubeConfig {
  /// `host:port` of the API server, once the external name is known.
  pub fn api_endpoint(&self) -> Option<String> {
    self
      .external_dns_name
      .as_ref()
      .map(|host| format!("{host}:{}", self.api_server_port))
  }
}
