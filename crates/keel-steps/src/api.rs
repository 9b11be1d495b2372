//! The SDK seams steps are written against.
//!
//! Implementations wrap a real cloud SDK; [`crate::SimulatedCloud`] implements
//! both traits in memory. Every method maps SDK failures onto a
//! [`StepError`] kind: missing resources are `NotFound`, duplicate names are
//! `AlreadyExists`, credential problems are `Authorization`.

use async_trait::async_trait;
use keel_config::Tags;
use keel_step::StepError;

/// Network, security and IAM fabric on AWS.
#[async_trait]
pub trait AwsApi: Send + Sync {
  /// Id of the newest image matching `name_filter` in `region`.
  async fn find_image(&self, region: &str, name_filter: &str) -> Result<String, StepError>;

  async fn create_vpc(&self, cidr: &str, tags: &Tags) -> Result<String, StepError>;
  async fn delete_vpc(&self, vpc_id: &str) -> Result<(), StepError>;

  async fn create_security_group(
    &self,
    vpc_id: &str,
    name: &str,
    tags: &Tags,
  ) -> Result<String, StepError>;
  async fn delete_security_group(&self, group_id: &str) -> Result<(), StepError>;

  /// Instance profiles are addressed by name.
  async fn create_instance_profile(&self, name: &str, tags: &Tags) -> Result<String, StepError>;
  async fn delete_instance_profile(&self, name: &str) -> Result<(), StepError>;

  /// Key pairs are addressed by name.
  async fn import_key_pair(
    &self,
    name: &str,
    public_key: &str,
    tags: &Tags,
  ) -> Result<String, StepError>;
  async fn delete_key_pair(&self, name: &str) -> Result<(), StepError>;

  /// Create a gateway and attach it to `vpc_id`.
  async fn create_internet_gateway(&self, vpc_id: &str, tags: &Tags) -> Result<String, StepError>;
  /// Detach and delete.
  async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<(), StepError>;

  async fn create_subnet(
    &self,
    vpc_id: &str,
    zone: &str,
    cidr: &str,
    tags: &Tags,
  ) -> Result<String, StepError>;
  async fn delete_subnet(&self, subnet_id: &str) -> Result<(), StepError>;

  /// Create a route table with a default route through `gateway_id`.
  async fn create_route_table(
    &self,
    vpc_id: &str,
    gateway_id: &str,
    tags: &Tags,
  ) -> Result<String, StepError>;
  async fn delete_route_table(&self, route_table_id: &str) -> Result<(), StepError>;

  /// Returns the association id.
  async fn associate_route_table(
    &self,
    route_table_id: &str,
    subnet_id: &str,
  ) -> Result<String, StepError>;
  async fn disassociate_route_table(&self, association_id: &str) -> Result<(), StepError>;

  /// Load balancers are addressed by name. Returns the DNS name.
  async fn create_load_balancer(
    &self,
    name: &str,
    subnet_ids: &[String],
    security_group_id: &str,
    tags: &Tags,
  ) -> Result<String, StepError>;
  /// DNS name of an existing load balancer.
  async fn describe_load_balancer(&self, name: &str) -> Result<String, StepError>;
  async fn delete_load_balancer(&self, name: &str) -> Result<(), StepError>;
}

/// What to boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceRequest {
  pub name: String,
  pub region: String,
  pub zone: Option<String>,
  pub size: String,
  pub image: Option<String>,
  pub subnet_id: Option<String>,
  pub security_group_id: Option<String>,
  pub instance_profile: Option<String>,
  pub key_name: Option<String>,
  pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
  Pending,
  Running,
  Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
  pub state: InstanceState,
  pub private_ip: Option<String>,
  pub public_ip: Option<String>,
}

/// Instances and SSH keys, the part every provider has.
#[async_trait]
pub trait ComputeApi: Send + Sync {
  async fn create_instance(&self, request: &InstanceRequest) -> Result<String, StepError>;
  async fn describe_instance(&self, instance_id: &str) -> Result<InstanceStatus, StepError>;
  async fn delete_instance(&self, instance_id: &str) -> Result<(), StepError>;

  /// Returns the provider-side key id.
  async fn import_key(&self, name: &str, public_key: &str, tags: &Tags)
  -> Result<String, StepError>;
  async fn delete_key(&self, key_id: &str) -> Result<(), StepError>;
}

/// Treat a missing resource as already deleted.
pub(crate) fn ignore_not_found(result: Result<(), StepError>) -> Result<(), StepError> {
  match result {
    Err(e) if e.is_not_found() => Ok(()),
    other => other,
  }
}
