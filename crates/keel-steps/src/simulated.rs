//! In-memory cloud with a resource ledger.
//!
//! Implements [`AwsApi`] and [`ComputeApi`] for every provider. The ledger
//! records each live resource with its tags and the resources it depends
//! on; deleting a resource that still has dependents fails the way a real
//! cloud's dependency check does, so teardown order is enforced.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use keel_config::Tags;
use keel_step::StepError;

use crate::api::{AwsApi, ComputeApi, InstanceRequest, InstanceState, InstanceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
  Vpc,
  SecurityGroup,
  InstanceProfile,
  KeyPair,
  InternetGateway,
  Subnet,
  RouteTable,
  RouteTableAssociation,
  LoadBalancer,
  Instance,
  SshKey,
}

/// A live resource in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
  pub id: String,
  pub kind: ResourceKind,
  pub tags: Tags,
  pub depends_on: Vec<String>,
}

#[derive(Debug)]
struct Boot {
  ordinal: usize,
  describes: usize,
  private_ip: String,
  public_ip: String,
}

#[derive(Debug)]
struct Ledger {
  resources: BTreeMap<String, Resource>,
  boots: HashMap<String, Boot>,
  next_id: u64,
  calls: BTreeMap<String, usize>,
  failures: HashMap<String, VecDeque<StepError>>,
  delayed_failures: HashMap<String, (usize, StepError)>,
  ip_after_polls: usize,
  booted: usize,
  address_limit: usize,
}

impl Default for Ledger {
  fn default() -> Self {
    Self {
      resources: BTreeMap::new(),
      boots: HashMap::new(),
      next_id: 0,
      calls: BTreeMap::new(),
      failures: HashMap::new(),
      delayed_failures: HashMap::new(),
      ip_after_polls: 2,
      booted: 0,
      address_limit: usize::MAX,
    }
  }
}

impl Ledger {
  fn next_id(&mut self, prefix: &str) -> String {
    self.next_id += 1;
    format!("{prefix}-{:08x}", self.next_id)
  }

  fn require(&self, id: &str, kind: ResourceKind) -> Result<&Resource, StepError> {
    self
      .resources
      .get(id)
      .filter(|r| r.kind == kind)
      .ok_or_else(|| StepError::not_found(format!("{kind:?} {id}")))
  }

  fn insert(&mut self, id: String, kind: ResourceKind, tags: &Tags, depends_on: Vec<String>) -> String {
    self.resources.insert(
      id.clone(),
      Resource {
        id: id.clone(),
        kind,
        tags: tags.clone(),
        depends_on,
      },
    );
    id
  }

  fn insert_named(
    &mut self,
    name: &str,
    kind: ResourceKind,
    tags: &Tags,
    depends_on: Vec<String>,
  ) -> Result<String, StepError> {
    if self.resources.contains_key(name) {
      return Err(StepError::AlreadyExists {
        resource: format!("{kind:?} {name}"),
      });
    }
    Ok(self.insert(name.to_string(), kind, tags, depends_on))
  }

  fn remove(&mut self, id: &str, kind: ResourceKind) -> Result<(), StepError> {
    self.require(id, kind)?;
    if let Some(dependent) = self
      .resources
      .values()
      .find(|r| r.depends_on.iter().any(|d| d == id))
    {
      return Err(StepError::provider(format!(
        "DependencyViolation: {kind:?} {id} is still used by {:?} {}",
        dependent.kind, dependent.id
      )));
    }
    self.resources.remove(id);
    Ok(())
  }
}

/// In-memory cloud. Clones share one ledger.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCloud {
  ledger: Arc<Mutex<Ledger>>,
}

impl SimulatedCloud {
  pub fn new() -> Self {
    Self::default()
  }

  /// Instances report their addresses on the `polls`-th describe call.
  pub fn with_ip_after_polls(self, polls: usize) -> Self {
    self.lock().ip_after_polls = polls;
    self
  }

  /// Instances never report addresses.
  pub fn withhold_addresses(self) -> Self {
    self.with_ip_after_polls(usize::MAX)
  }

  /// Only the first `instances` instances ever booted report addresses.
  pub fn with_address_limit(self, instances: usize) -> Self {
    self.lock().address_limit = instances;
    self
  }

  /// Make the next call of `operation` fail with `err`. Queued failures are
  /// consumed in order.
  pub fn fail_next(&self, operation: &str, err: StepError) {
    self
      .lock()
      .failures
      .entry(operation.to_string())
      .or_default()
      .push_back(err);
  }

  /// Let `successes` calls of `operation` through, then fail the next one
  /// with `err`.
  pub fn fail_after(&self, operation: &str, successes: usize, err: StepError) {
    self
      .lock()
      .delayed_failures
      .insert(operation.to_string(), (successes, err));
  }

  /// How often `operation` was called.
  pub fn calls(&self, operation: &str) -> usize {
    self.lock().calls.get(operation).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.lock().calls.values().sum()
  }

  pub fn resources(&self) -> Vec<Resource> {
    self.lock().resources.values().cloned().collect()
  }

  /// Live resources carrying `key=value`.
  pub fn resources_tagged(&self, key: &str, value: &str) -> Vec<Resource> {
    self
      .lock()
      .resources
      .values()
      .filter(|r| r.tags.get(key).is_some_and(|v| v == value))
      .cloned()
      .collect()
  }

  pub fn count(&self, kind: ResourceKind) -> usize {
    self
      .lock()
      .resources
      .values()
      .filter(|r| r.kind == kind)
      .count()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.lock().resources.contains_key(id)
  }

  fn lock(&self) -> MutexGuard<'_, Ledger> {
    self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Count the call and pop an injected failure, if any.
  fn call(&self, operation: &str) -> Result<MutexGuard<'_, Ledger>, StepError> {
    let mut ledger = self.lock();
    *ledger.calls.entry(operation.to_string()).or_default() += 1;
    if let Some(err) = ledger
      .failures
      .get_mut(operation)
      .and_then(VecDeque::pop_front)
    {
      return Err(err);
    }
    let due = match ledger.delayed_failures.get_mut(operation) {
      Some((0, _)) => true,
      Some((remaining, _)) => {
        *remaining -= 1;
        false
      }
      None => false,
    };
    if due {
      if let Some((_, err)) = ledger.delayed_failures.remove(operation) {
        return Err(err);
      }
    }
    Ok(ledger)
  }
}

#[async_trait]
impl AwsApi for SimulatedCloud {
  async fn find_image(&self, region: &str, _name_filter: &str) -> Result<String, StepError> {
    let _ledger = self.call("find_image")?;
    if region.is_empty() {
      return Err(StepError::provider("region is required"));
    }
    Ok("ami-0123456789abcdef0".to_string())
  }

  async fn create_vpc(&self, _cidr: &str, tags: &Tags) -> Result<String, StepError> {
    let mut ledger = self.call("create_vpc")?;
    let id = ledger.next_id("vpc");
    Ok(ledger.insert(id, ResourceKind::Vpc, tags, Vec::new()))
  }

  async fn delete_vpc(&self, vpc_id: &str) -> Result<(), StepError> {
    self.call("delete_vpc")?.remove(vpc_id, ResourceKind::Vpc)
  }

  async fn create_security_group(
    &self,
    vpc_id: &str,
    _name: &str,
    tags: &Tags,
  ) -> Result<String, StepError> {
    let mut ledger = self.call("create_security_group")?;
    ledger.require(vpc_id, ResourceKind::Vpc)?;
    let id = ledger.next_id("sg");
    Ok(ledger.insert(id, ResourceKind::SecurityGroup, tags, vec![vpc_id.to_string()]))
  }

  async fn delete_security_group(&self, group_id: &str) -> Result<(), StepError> {
    self
      .call("delete_security_group")?
      .remove(group_id, ResourceKind::SecurityGroup)
  }

  async fn create_instance_profile(&self, name: &str, tags: &Tags) -> Result<String, StepError> {
    self
      .call("create_instance_profile")?
      .insert_named(name, ResourceKind::InstanceProfile, tags, Vec::new())
  }

  async fn delete_instance_profile(&self, name: &str) -> Result<(), StepError> {
    self
      .call("delete_instance_profile")?
      .remove(name, ResourceKind::InstanceProfile)
  }

  async fn import_key_pair(
    &self,
    name: &str,
    public_key: &str,
    tags: &Tags,
  ) -> Result<String, StepError> {
    let mut ledger = self.call("import_key_pair")?;
    if public_key.is_empty() {
      return Err(StepError::provider("public key material is empty"));
    }
    ledger.insert_named(name, ResourceKind::KeyPair, tags, Vec::new())
  }

  async fn delete_key_pair(&self, name: &str) -> Result<(), StepError> {
    self
      .call("delete_key_pair")?
      .remove(name, ResourceKind::KeyPair)
  }

  async fn create_internet_gateway(&self, vpc_id: &str, tags: &Tags) -> Result<String, StepError> {
    let mut ledger = self.call("create_internet_gateway")?;
    ledger.require(vpc_id, ResourceKind::Vpc)?;
    let id = ledger.next_id("igw");
    Ok(ledger.insert(id, ResourceKind::InternetGateway, tags, vec![vpc_id.to_string()]))
  }

  async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<(), StepError> {
    self
      .call("delete_internet_gateway")?
      .remove(gateway_id, ResourceKind::InternetGateway)
  }

  async fn create_subnet(
    &self,
    vpc_id: &str,
    _zone: &str,
    _cidr: &str,
    tags: &Tags,
  ) -> Result<String, StepError> {
    let mut ledger = self.call("create_subnet")?;
    ledger.require(vpc_id, ResourceKind::Vpc)?;
    let id = ledger.next_id("subnet");
    Ok(ledger.insert(id, ResourceKind::Subnet, tags, vec![vpc_id.to_string()]))
  }

  async fn delete_subnet(&self, subnet_id: &str) -> Result<(), StepError> {
    self
      .call("delete_subnet")?
      .remove(subnet_id, ResourceKind::Subnet)
  }

  async fn create_route_table(
    &self,
    vpc_id: &str,
    gateway_id: &str,
    tags: &Tags,
  ) -> Result<String, StepError> {
    let mut ledger = self.call("create_route_table")?;
    ledger.require(vpc_id, ResourceKind::Vpc)?;
    ledger.require(gateway_id, ResourceKind::InternetGateway)?;
    let id = ledger.next_id("rtb");
    Ok(ledger.insert(
      id,
      ResourceKind::RouteTable,
      tags,
      vec![vpc_id.to_string(), gateway_id.to_string()],
    ))
  }

  async fn delete_route_table(&self, route_table_id: &str) -> Result<(), StepError> {
    self
      .call("delete_route_table")?
      .remove(route_table_id, ResourceKind::RouteTable)
  }

  async fn associate_route_table(
    &self,
    route_table_id: &str,
    subnet_id: &str,
  ) -> Result<String, StepError> {
    let mut ledger = self.call("associate_route_table")?;
    ledger.require(route_table_id, ResourceKind::RouteTable)?;
    let tags = ledger.require(subnet_id, ResourceKind::Subnet)?.tags.clone();
    let id = ledger.next_id("rtbassoc");
    Ok(ledger.insert(
      id,
      ResourceKind::RouteTableAssociation,
      &tags,
      vec![route_table_id.to_string(), subnet_id.to_string()],
    ))
  }

  async fn disassociate_route_table(&self, association_id: &str) -> Result<(), StepError> {
    self
      .call("disassociate_route_table")?
      .remove(association_id, ResourceKind::RouteTableAssociation)
  }

  async fn create_load_balancer(
    &self,
    name: &str,
    subnet_ids: &[String],
    security_group_id: &str,
    tags: &Tags,
  ) -> Result<String, StepError> {
    let mut ledger = self.call("create_load_balancer")?;
    for subnet in subnet_ids {
      ledger.require(subnet, ResourceKind::Subnet)?;
    }
    ledger.require(security_group_id, ResourceKind::SecurityGroup)?;
    let mut depends_on = subnet_ids.to_vec();
    depends_on.push(security_group_id.to_string());
    ledger.insert_named(name, ResourceKind::LoadBalancer, tags, depends_on)?;
    Ok(format!("{name}.elb.simulated.internal"))
  }

  async fn describe_load_balancer(&self, name: &str) -> Result<String, StepError> {
    self
      .call("describe_load_balancer")?
      .require(name, ResourceKind::LoadBalancer)?;
    Ok(format!("{name}.elb.simulated.internal"))
  }

  async fn delete_load_balancer(&self, name: &str) -> Result<(), StepError> {
    self
      .call("delete_load_balancer")?
      .remove(name, ResourceKind::LoadBalancer)
  }
}

#[async_trait]
impl ComputeApi for SimulatedCloud {
  async fn create_instance(&self, request: &InstanceRequest) -> Result<String, StepError> {
    let mut ledger = self.call("create_instance")?;

    let mut depends_on = Vec::new();
    if let Some(subnet) = &request.subnet_id {
      ledger.require(subnet, ResourceKind::Subnet)?;
      depends_on.push(subnet.clone());
    }
    if let Some(group) = &request.security_group_id {
      ledger.require(group, ResourceKind::SecurityGroup)?;
      depends_on.push(group.clone());
    }
    if let Some(profile) = &request.instance_profile {
      ledger.require(profile, ResourceKind::InstanceProfile)?;
      depends_on.push(profile.clone());
    }
    if let Some(key) = &request.key_name {
      if !ledger.resources.contains_key(key) {
        return Err(StepError::not_found(format!("key {key}")));
      }
      depends_on.push(key.clone());
    }

    let id = ledger.next_id("i");
    let n = ledger.next_id;
    let ordinal = ledger.booted;
    ledger.booted += 1;
    ledger.boots.insert(
      id.clone(),
      Boot {
        ordinal,
        describes: 0,
        private_ip: format!("10.0.{}.{}", (n / 250) % 250, n % 250 + 2),
        public_ip: format!("203.0.113.{}", n % 250 + 2),
      },
    );
    Ok(ledger.insert(id, ResourceKind::Instance, &request.tags, depends_on))
  }

  async fn describe_instance(&self, instance_id: &str) -> Result<InstanceStatus, StepError> {
    let mut ledger = self.call("describe_instance")?;
    if ledger.require(instance_id, ResourceKind::Instance).is_err() {
      return Ok(InstanceStatus {
        state: InstanceState::Terminated,
        private_ip: None,
        public_ip: None,
      });
    }

    let threshold = ledger.ip_after_polls;
    let limit = ledger.address_limit;
    let boot = ledger
      .boots
      .get_mut(instance_id)
      .ok_or_else(|| StepError::not_found(format!("instance {instance_id}")))?;
    boot.describes += 1;

    if boot.ordinal < limit && boot.describes >= threshold {
      Ok(InstanceStatus {
        state: InstanceState::Running,
        private_ip: Some(boot.private_ip.clone()),
        public_ip: Some(boot.public_ip.clone()),
      })
    } else {
      Ok(InstanceStatus {
        state: InstanceState::Pending,
        private_ip: None,
        public_ip: None,
      })
    }
  }

  async fn delete_instance(&self, instance_id: &str) -> Result<(), StepError> {
    let mut ledger = self.call("delete_instance")?;
    ledger.remove(instance_id, ResourceKind::Instance)?;
    ledger.boots.remove(instance_id);
    Ok(())
  }

  async fn import_key(
    &self,
    name: &str,
    public_key: &str,
    tags: &Tags,
  ) -> Result<String, StepError> {
    let mut ledger = self.call("import_key")?;
    if public_key.is_empty() {
      return Err(StepError::provider("public key material is empty"));
    }
    if ledger
      .resources
      .values()
      .any(|r| r.kind == ResourceKind::SshKey && r.tags.get("Name").is_some_and(|n| n == name))
    {
      return Err(StepError::AlreadyExists {
        resource: format!("ssh key {name}"),
      });
    }
    let id = ledger.next_id("key");
    let mut tags = tags.clone();
    tags.insert("Name".to_string(), name.to_string());
    Ok(ledger.insert(id, ResourceKind::SshKey, &tags, Vec::new()))
  }

  async fn delete_key(&self, key_id: &str) -> Result<(), StepError> {
    self.call("delete_key")?.remove(key_id, ResourceKind::SshKey)
  }
}
