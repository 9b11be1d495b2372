//! Keel Steps
//!
//! Concrete step bodies for every workflow, written against two narrow SDK
//! seams: [`AwsApi`] for the AWS cluster fabric and [`ComputeApi`] for
//! instances and SSH keys on any provider. [`register_all`] binds the steps
//! to a set of [`Clouds`] and adds them to a registry.
//!
//! [`SimulatedCloud`] implements both seams in memory with a resource
//! ledger, for tests and dry runs.

mod api;
pub mod aws;
mod clouds;
mod node;
mod scripts;
mod simulated;
mod ssh_key;

pub use api::{AwsApi, ComputeApi, InstanceRequest, InstanceState, InstanceStatus};
pub use aws::{CreateFabric, DeleteFabric, Fabric};
pub use clouds::Clouds;
pub use node::{CreateInstance, DeleteInstance};
pub use scripts::{Script, ScriptStep};
pub use simulated::{Resource, ResourceKind, SimulatedCloud};
pub use ssh_key::{DeleteSshKey, ImportSshKey};

use keel_journal::JournalWriter;
use keel_step::StepRegistry;
use tracing::warn;

/// Register every step under its workflow name.
///
/// Panics if any of them is already registered.
pub fn register_all(registry: &mut StepRegistry, clouds: &Clouds) {
  for resource in Fabric::ALL {
    registry.register_step(CreateFabric::new(resource, clouds.aws.clone()));
    if let Some(step) = DeleteFabric::new(resource, clouds.aws.clone()) {
      registry.register_step(step);
    }
  }

  registry.register_step(ImportSshKey::new(clouds.clone()));
  registry.register_step(DeleteSshKey::new(clouds.clone()));
  registry.register_step(CreateInstance::new(clouds.clone()));
  registry.register_step(DeleteInstance::new(clouds.clone()));

  for script in Script::ALL {
    registry.register_step(ScriptStep::new(script));
  }
}

/// Journal writes are best effort; a broken journal never fails a step.
pub(crate) async fn journal(out: &JournalWriter, line: &str) {
  if let Err(e) = out.line(line).await {
    warn!(journal = %out.uri(), error = %e, "journal_write_failed");
  }
}
