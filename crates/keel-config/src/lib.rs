//! Keel Config
//!
//! The [`Config`] record is the envelope carried through every step of a
//! task. Steps publish their outputs by mutating it; the task runtime
//! checkpoints it after every step, so everything except the attached
//! handles (runner, node-event sink) round-trips through JSON.
//!
//! Two pieces are shared between clones rather than copied:
//! - the master and worker [`NodeMap`]s, so the provisioner sees updates made
//!   by concurrent per-node tasks;
//! - the [`NodeEvents`] sink, which carries node lifecycle transitions back to
//!   the provisioner.

mod cloud;
mod config;
mod error;
mod events;
mod node;
mod node_map;
mod provider;

pub use cloud::{
  AwsConfig, AzureConfig, CertificateMaterial, CloudAccount, DigitalOceanConfig, GceConfig,
  KubeConfig, OpenStackConfig, PacketConfig, SshConfig,
};
pub use config::{CLUSTER_TAG, Config, RunnerHandle, Tags};
pub use error::ConfigError;
pub use events::{NodeEvents, node_events};
pub use node::{Node, NodeRole, NodeState};
pub use node_map::NodeMap;
pub use provider::Provider;
