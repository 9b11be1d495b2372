use std::collections::HashMap;
use std::time::Duration;

use keel_config::Provider;
use keel_step::StepRegistry;

use crate::steps::*;
use crate::{RetryPolicy, Workflow, WorkflowError, WorkflowName, validate_workflow};

const JOIN_RETRY: RetryPolicy = RetryPolicy {
  max_attempts: 3,
  delay: Duration::from_secs(1),
};

/// The six workflows for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSet {
  workflows: HashMap<WorkflowName, Workflow>,
}

impl WorkflowSet {
  /// Standard definitions for `provider`.
  pub fn for_provider(provider: Provider) -> Self {
    let (pre_provision, delete_cluster) = match provider {
      Provider::Aws => (
        Workflow::new(
          WorkflowName::PreProvision,
          &[
            FIND_AMI,
            CREATE_VPC,
            CREATE_SECURITY_GROUPS,
            CREATE_INSTANCE_PROFILES,
            IMPORT_KEY_PAIR,
            CREATE_INTERNET_GATEWAY,
            CREATE_SUBNETS,
            CREATE_ROUTE_TABLE,
            ASSOCIATE_ROUTE_TABLE,
            CREATE_LOAD_BALANCER,
          ],
        ),
        Workflow::new(
          WorkflowName::DeleteCluster,
          &[
            DELETE_LOAD_BALANCER,
            DISASSOCIATE_ROUTE_TABLE,
            DELETE_ROUTE_TABLE,
            DELETE_SUBNETS,
            DELETE_INTERNET_GATEWAY,
            DELETE_KEY_PAIR,
            DELETE_INSTANCE_PROFILES,
            DELETE_SECURITY_GROUPS,
            DELETE_VPC,
          ],
        ),
      ),
      Provider::DigitalOcean
      | Provider::Gce
      | Provider::Azure
      | Provider::OpenStack
      | Provider::Packet => (
        Workflow::new(WorkflowName::PreProvision, &[IMPORT_SSH_KEY]),
        Workflow::new(WorkflowName::DeleteCluster, &[DELETE_SSH_KEY]),
      ),
    };

    let workflows = [
      pre_provision,
      Workflow::new(
        WorkflowName::MasterBootstrap,
        &[
          CREATE_INSTANCE,
          INSTALL_CONTAINER_RUNTIME,
          KUBELET_CONFIG,
          INSTALL_KUBELET,
          KUBEADM_INIT,
          POST_START,
        ],
      ),
      Workflow::new(
        WorkflowName::MasterJoin,
        &[
          CREATE_INSTANCE,
          INSTALL_CONTAINER_RUNTIME,
          KUBELET_CONFIG,
          INSTALL_KUBELET,
          KUBEADM_JOIN,
        ],
      )
      .with_retry(JOIN_RETRY),
      Workflow::new(
        WorkflowName::WorkerJoin,
        &[
          CREATE_INSTANCE,
          INSTALL_CONTAINER_RUNTIME,
          KUBELET_CONFIG,
          INSTALL_KUBELET,
          KUBEADM_JOIN,
        ],
      )
      .with_retry(JOIN_RETRY),
      Workflow::new(WorkflowName::DeleteNode, &[DELETE_INSTANCE]),
      delete_cluster,
    ];

    Self {
      workflows: workflows.into_iter().map(|w| (w.name, w)).collect(),
    }
  }

  pub fn get(&self, name: WorkflowName) -> Option<&Workflow> {
    self.workflows.get(&name)
  }

  /// Replace the definition of `workflow.name`.
  pub fn set(&mut self, workflow: Workflow) {
    self.workflows.insert(workflow.name, workflow);
  }
}

/// Workflow definitions for every provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowCatalog {
  sets: HashMap<Provider, WorkflowSet>,
}

impl WorkflowCatalog {
  pub fn standard() -> Self {
    Self {
      sets: Provider::ALL
        .into_iter()
        .map(|p| (p, WorkflowSet::for_provider(p)))
        .collect(),
    }
  }

  /// Replace one workflow for one provider.
  pub fn with_override(mut self, provider: Provider, workflow: Workflow) -> Self {
    self
      .sets
      .entry(provider)
      .or_insert_with(|| WorkflowSet::for_provider(provider))
      .set(workflow);
    self
  }

  /// Shorthand for overriding the retry policy of an existing workflow.
  pub fn with_retry(mut self, provider: Provider, name: WorkflowName, retry: RetryPolicy) -> Self {
    if let Some(set) = self.sets.get_mut(&provider) {
      if let Some(existing) = set.get(name).cloned() {
        set.set(existing.with_retry(retry));
      }
    }
    self
  }

  pub fn get(&self, provider: Provider, name: WorkflowName) -> Result<&Workflow, WorkflowError> {
    self
      .sets
      .get(&provider)
      .and_then(|set| set.get(name))
      .ok_or(WorkflowError::NotDefined {
        workflow: name,
        provider,
      })
  }

  /// Look up and validate in one go; what the runtime does at dispatch.
  pub fn resolve(
    &self,
    provider: Provider,
    name: WorkflowName,
    registry: &StepRegistry,
  ) -> Result<&Workflow, WorkflowError> {
    let workflow = self.get(provider, name)?;
    validate_workflow(workflow, registry)?;
    Ok(workflow)
  }
}

impl Default for WorkflowCatalog {
  fn default() -> Self {
    Self::standard()
  }
}
