//! Provider-neutral cluster fabric: the bootstrap SSH key.

use async_trait::async_trait;
use keel_config::Config;
use keel_journal::JournalWriter;
use keel_step::{Step, StepError};
use keel_workflow::steps;
use tokio_util::sync::CancellationToken;

use crate::api::ignore_not_found;
use crate::{Clouds, journal};

/// Import the bootstrap public key so new instances accept the runner.
pub struct ImportSshKey {
  clouds: Clouds,
}

impl ImportSshKey {
  pub fn new(clouds: Clouds) -> Self {
    Self { clouds }
  }
}

#[async_trait]
impl Step for ImportSshKey {
  fn name(&self) -> &str {
    steps::IMPORT_SSH_KEY
  }

  fn description(&self) -> &str {
    "Import the bootstrap SSH key"
  }

  async fn run(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    if cfg.ssh.imported_key_id.is_some() {
      return Ok(());
    }
    let key = if cfg.ssh.bootstrap_public_key.is_empty() {
      &cfg.ssh.public_key
    } else {
      &cfg.ssh.bootstrap_public_key
    };
    if key.is_empty() {
      return Err(StepError::fatal("no SSH public key configured"));
    }

    let name = format!("keel-{}", cfg.cluster_id);
    let api = self.clouds.compute(cfg.provider)?;
    let id = api.import_key(&name, key, &cfg.cluster_tags()).await?;
    journal(out, &format!("imported ssh key {name} as {id}")).await;
    cfg.ssh.imported_key_id = Some(id);
    Ok(())
  }

  async fn rollback(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    remove_key(&self.clouds, out, cfg).await
  }
}

/// Delete the imported key; the delete-cluster counterpart of
/// [`ImportSshKey`].
pub struct DeleteSshKey {
  clouds: Clouds,
}

impl DeleteSshKey {
  pub fn new(clouds: Clouds) -> Self {
    Self { clouds }
  }
}

#[async_trait]
impl Step for DeleteSshKey {
  fn name(&self) -> &str {
    steps::DELETE_SSH_KEY
  }

  fn description(&self) -> &str {
    "Delete the bootstrap SSH key"
  }

  async fn run(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    remove_key(&self.clouds, out, cfg).await
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

async fn remove_key(
  clouds: &Clouds,
  out: &JournalWriter,
  cfg: &mut Config,
) -> Result<(), StepError> {
  let Some(id) = cfg.ssh.imported_key_id.clone() else {
    return Ok(());
  };
  let api = clouds.compute(cfg.provider)?;
  ignore_not_found(api.delete_key(&id).await)?;
  journal(out, &format!("deleted ssh key {id}")).await;
  cfg.ssh.imported_key_id = None;
  Ok(())
}
