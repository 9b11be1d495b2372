//! Cluster fabric workflows against the simulated cloud.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_config::{CLUSTER_TAG, Config, Provider};
use keel_journal::{JournalWriter, MemoryJournalStore};
use keel_runtime::{RuntimeConfig, TaskRuntime};
use keel_step::{ErrorKind, PollPolicy, Step, StepError, StepRegistry};
use keel_steps::{Clouds, ResourceKind, SimulatedCloud, register_all};
use keel_store::{MemoryKvStore, TaskRepository};
use keel_workflow::{Workflow, WorkflowCatalog, WorkflowName, steps};
use tokio_util::sync::CancellationToken;

const AWS_PRE_PROVISION: [&str; 10] = [
  steps::FIND_AMI,
  steps::CREATE_VPC,
  steps::CREATE_SECURITY_GROUPS,
  steps::CREATE_INSTANCE_PROFILES,
  steps::IMPORT_KEY_PAIR,
  steps::CREATE_INTERNET_GATEWAY,
  steps::CREATE_SUBNETS,
  steps::CREATE_ROUTE_TABLE,
  steps::ASSOCIATE_ROUTE_TABLE,
  steps::CREATE_LOAD_BALANCER,
];

/// Always fails with an authorization error.
struct Deny;

#[async_trait]
impl Step for Deny {
  fn name(&self) -> &str {
    "deny"
  }

  fn description(&self) -> &str {
    "fails with an authorization error"
  }

  async fn run(
    &self,
    _cancel: &CancellationToken,
    _out: &JournalWriter,
    _cfg: &mut Config,
  ) -> Result<(), StepError> {
    Err(StepError::Authorization {
      message: "credentials revoked".to_string(),
    })
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

struct Harness {
  runtime: TaskRuntime,
  cloud: SimulatedCloud,
  journals: MemoryJournalStore,
}

fn harness(workflows: Vec<Workflow>) -> Harness {
  let cloud = SimulatedCloud::new().with_ip_after_polls(1);
  let clouds = Clouds::simulated(&cloud).with_poll_policy(PollPolicy::fixed(
    Duration::from_millis(1),
    Duration::from_secs(5),
  ));

  let mut registry = StepRegistry::new();
  register_all(&mut registry, &clouds);
  registry.register_step(Deny);

  let mut catalog = WorkflowCatalog::standard();
  for workflow in workflows {
    catalog = catalog.with_override(Provider::Aws, workflow);
  }

  let journals = MemoryJournalStore::new();
  let runtime = TaskRuntime::new(
    Arc::new(registry),
    Arc::new(catalog),
    TaskRepository::new(Arc::new(MemoryKvStore::new()), "keel"),
    Arc::new(journals.clone()),
  )
  .with_config(RuntimeConfig {
    retry_delay: Some(Duration::from_millis(1)),
  });

  Harness {
    runtime,
    cloud,
    journals,
  }
}

fn aws_config() -> Config {
  let mut cfg = Config::new(Provider::Aws, "c-1", "demo");
  cfg.aws.region = "us-east-1".to_string();
  cfg.ssh.bootstrap_public_key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 keel".to_string();
  cfg
}

#[tokio::test]
async fn test_aws_pre_provision_records_fabric() {
  let h = harness(Vec::new());
  let task = h
    .runtime
    .create_task(WorkflowName::PreProvision, aws_config())
    .await
    .unwrap();
  let journal_uri = task.journal_uri.clone();

  let cfg = h
    .runtime
    .run_task(task, &CancellationToken::new())
    .await
    .unwrap();

  assert!(cfg.aws.image_id.as_deref().is_some_and(|s| !s.is_empty()));
  assert!(cfg.aws.vpc_id.is_some());
  assert!(cfg.aws.masters_security_group_id.is_some());
  assert!(cfg.aws.nodes_security_group_id.is_some());
  assert_eq!(
    cfg.aws.external_load_balancer_name.as_deref(),
    Some("keel-c-1-api")
  );
  assert!(cfg.aws.external_load_balancer_dns.is_some());
  assert_eq!(cfg.aws.subnets.len(), 1);
  assert_eq!(cfg.aws.route_table_associations.len(), 1);

  // The finished task leaves no record behind.
  assert!(h.runtime.repository().list().await.unwrap().is_empty());

  let journal = h.journals.contents(&journal_uri).unwrap();
  let banners: Vec<&str> = journal
    .lines()
    .filter(|l| l.starts_with("==> ["))
    .collect();
  assert_eq!(banners.len(), AWS_PRE_PROVISION.len());
  for (banner, step) in banners.iter().zip(AWS_PRE_PROVISION) {
    assert!(banner.ends_with(step), "{banner} != {step}");
  }

  // Every created resource carries the cluster tag.
  let tagged = h.cloud.resources_tagged(CLUSTER_TAG, "c-1");
  assert_eq!(tagged.len(), h.cloud.resources().len());
}

#[tokio::test]
async fn test_pre_provision_spreads_subnets_over_zones() {
  let h = harness(Vec::new());
  let mut cfg = aws_config();
  cfg.aws.availability_zones = vec![
    "us-east-1a".to_string(),
    "us-east-1b".to_string(),
    "us-east-1c".to_string(),
  ];

  let cfg = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, cfg, &CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(cfg.aws.subnets.len(), 3);
  assert_eq!(cfg.aws.route_table_associations.len(), 3);
  assert_eq!(h.cloud.count(ResourceKind::Subnet), 3);
}

#[tokio::test]
async fn test_rerunning_pre_provision_calls_no_sdk() {
  let h = harness(Vec::new());
  let cancel = CancellationToken::new();

  let first = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, aws_config(), &cancel)
    .await
    .unwrap();
  let calls = h.cloud.total_calls();
  let resources = h.cloud.resources();

  let second = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, first.clone(), &cancel)
    .await
    .unwrap();

  assert_eq!(h.cloud.total_calls(), calls);
  assert_eq!(h.cloud.resources(), resources);
  assert_eq!(second.aws, first.aws);
}

#[tokio::test]
async fn test_rollback_of_every_prefix_leaves_nothing() {
  for len in 0..=AWS_PRE_PROVISION.len() {
    let mut names = AWS_PRE_PROVISION[..len].to_vec();
    names.push("deny");
    let h = harness(vec![Workflow::new(WorkflowName::PreProvision, &names)]);

    let err = h
      .runtime
      .run_workflow(
        WorkflowName::PreProvision,
        aws_config(),
        &CancellationToken::new(),
      )
      .await
      .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(
      h.cloud.resources().is_empty(),
      "prefix of {len} left {:?}",
      h.cloud.resources()
    );
  }
}

#[tokio::test]
async fn test_failed_pre_provision_keeps_error_record_with_cleared_outputs() {
  let h = harness(Vec::new());
  h.cloud.fail_next(
    "create_load_balancer",
    StepError::Authorization {
      message: "not allowed to create load balancers".to_string(),
    },
  );

  let task = h
    .runtime
    .create_task(WorkflowName::PreProvision, aws_config())
    .await
    .unwrap();
  let id = task.id.clone();
  let err = h
    .runtime
    .run_task(task, &CancellationToken::new())
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Authorization);

  let record = h.runtime.repository().get(&id).await.unwrap().unwrap();
  let failure = record.error.unwrap();
  assert_eq!(failure.kind, ErrorKind::Authorization);
  assert_eq!(failure.step.as_deref(), Some(steps::CREATE_LOAD_BALANCER));
  assert_eq!(record.config.aws.vpc_id, None);
  assert!(record.config.aws.subnets.is_empty());
  assert!(h.cloud.resources().is_empty());
}

#[tokio::test]
async fn test_leftover_named_resources_are_reused() {
  use keel_steps::AwsApi;

  let h = harness(Vec::new());
  let tags = aws_config().cluster_tags();
  h.cloud
    .create_instance_profile("keel-c-1-master", &tags)
    .await
    .unwrap();
  h.cloud
    .import_key_pair("keel-c-1", "ssh-ed25519 AAAA", &tags)
    .await
    .unwrap();

  let cfg = h
    .runtime
    .run_workflow(
      WorkflowName::PreProvision,
      aws_config(),
      &CancellationToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(
    cfg.aws.masters_instance_profile.as_deref(),
    Some("keel-c-1-master")
  );
  assert_eq!(cfg.aws.key_pair_name.as_deref(), Some("keel-c-1"));
  assert_eq!(h.cloud.count(ResourceKind::InstanceProfile), 2);
}

#[tokio::test]
async fn test_missing_public_key_is_fatal() {
  let h = harness(Vec::new());
  let mut cfg = aws_config();
  cfg.ssh.bootstrap_public_key.clear();

  let err = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, cfg, &CancellationToken::new())
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Fatal);
  assert!(h.cloud.resources().is_empty());
}

#[tokio::test]
async fn test_delete_cluster_removes_fabric_and_tolerates_missing() {
  let h = harness(Vec::new());
  let cancel = CancellationToken::new();

  let provisioned = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, aws_config(), &cancel)
    .await
    .unwrap();
  assert!(!h.cloud.resources().is_empty());

  let deleted = h
    .runtime
    .run_workflow(WorkflowName::DeleteCluster, provisioned.clone(), &cancel)
    .await
    .unwrap();
  assert!(h.cloud.resources_tagged(CLUSTER_TAG, "c-1").is_empty());
  assert!(h.cloud.resources().is_empty());
  assert_eq!(deleted.aws.vpc_id, None);
  assert_eq!(deleted.aws.external_load_balancer_name, None);

  // Deleting from the stale config again finds nothing and succeeds.
  h.runtime
    .run_workflow(WorkflowName::DeleteCluster, provisioned, &cancel)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_delete_cluster_propagates_non_not_found_errors() {
  let h = harness(Vec::new());
  let cancel = CancellationToken::new();

  let provisioned = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, aws_config(), &cancel)
    .await
    .unwrap();
  h.cloud.fail_next(
    "delete_vpc",
    StepError::Authorization {
      message: "denied".to_string(),
    },
  );

  let err = h
    .runtime
    .run_workflow(WorkflowName::DeleteCluster, provisioned, &cancel)
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Authorization);
  assert_eq!(h.cloud.count(ResourceKind::Vpc), 1);
  assert_eq!(h.cloud.count(ResourceKind::Subnet), 0);
}

#[tokio::test]
async fn test_other_providers_import_and_delete_ssh_key() {
  let h = harness(Vec::new());
  let cancel = CancellationToken::new();
  let mut cfg = Config::new(Provider::DigitalOcean, "c-2", "droplets");
  cfg.ssh.public_key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 user".to_string();

  let cfg = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, cfg, &cancel)
    .await
    .unwrap();
  let key = cfg.ssh.imported_key_id.clone().unwrap();
  assert!(h.cloud.contains(&key));
  assert_eq!(h.cloud.calls("create_vpc"), 0);

  let cfg = h
    .runtime
    .run_workflow(WorkflowName::DeleteCluster, cfg, &cancel)
    .await
    .unwrap();
  assert_eq!(cfg.ssh.imported_key_id, None);
  assert!(!h.cloud.contains(&key));
}

#[tokio::test]
async fn test_subnet_failure_part_way_rolls_back_created_subnets() {
  let h = harness(Vec::new());
  let mut cfg = aws_config();
  cfg.aws.availability_zones = vec![
    "us-east-1a".to_string(),
    "us-east-1b".to_string(),
    "us-east-1c".to_string(),
  ];
  h.cloud.fail_after(
    "create_subnet",
    1,
    StepError::Authorization {
      message: "subnet quota denied".to_string(),
    },
  );

  let err = h
    .runtime
    .run_workflow(WorkflowName::PreProvision, cfg, &CancellationToken::new())
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Authorization);
  assert_eq!(h.cloud.calls("create_subnet"), 2);
  assert_eq!(h.cloud.calls("delete_subnet"), 1);
  assert!(
    h.cloud.resources().is_empty(),
    "left {:?}",
    h.cloud.resources()
  );
}
