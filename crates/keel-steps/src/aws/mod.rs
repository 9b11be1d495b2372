//! AWS cluster fabric: network, security, IAM and the API load balancer.
//!
//! Each [`Fabric`] resource knows how to ensure itself (create if the config
//! does not record it yet) and how to remove itself (delete whatever the
//! config records, treating "not found" as done). The pre-provision
//! workflow's create steps and the delete-cluster workflow's delete steps
//! are thin wrappers over the two, so a create step's rollback and the
//! matching delete step run the same code.

mod fabric;

pub use fabric::Fabric;

use std::sync::Arc;

use async_trait::async_trait;
use keel_config::Config;
use keel_journal::JournalWriter;
use keel_step::{Step, StepError};
use tokio_util::sync::CancellationToken;

use crate::api::AwsApi;

/// Pre-provision step that creates one fabric resource.
pub struct CreateFabric {
  resource: Fabric,
  api: Arc<dyn AwsApi>,
}

impl CreateFabric {
  pub fn new(resource: Fabric, api: Arc<dyn AwsApi>) -> Self {
    Self { resource, api }
  }
}

#[async_trait]
impl Step for CreateFabric {
  fn name(&self) -> &str {
    self.resource.create_step()
  }

  fn description(&self) -> &str {
    self.resource.create_description()
  }

  fn depends(&self) -> &[&'static str] {
    self.resource.depends()
  }

  async fn run(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    self.resource.ensure(self.api.as_ref(), out, cfg).await
  }

  async fn rollback(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    self.resource.remove(self.api.as_ref(), out, cfg).await
  }
}

/// Delete-cluster step that removes one fabric resource.
pub struct DeleteFabric {
  name: &'static str,
  resource: Fabric,
  api: Arc<dyn AwsApi>,
}

impl DeleteFabric {
  /// `None` for resources that have nothing to delete.
  pub fn new(resource: Fabric, api: Arc<dyn AwsApi>) -> Option<Self> {
    let name = resource.delete_step()?;
    Some(Self {
      name,
      resource,
      api,
    })
  }
}

#[async_trait]
impl Step for DeleteFabric {
  fn name(&self) -> &str {
    self.name
  }

  fn description(&self) -> &str {
    self.resource.delete_description()
  }

  async fn run(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    self.resource.remove(self.api.as_ref(), out, cfg).await
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
