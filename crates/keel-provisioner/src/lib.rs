//! Keel Provisioner
//!
//! Turns a [`ClusterSpec`] into a running cluster by composing workflows on
//! a [`keel_runtime::TaskRuntime`]: pre-provision (provider fabric), then
//! master-bootstrap for the first master, then master-join and worker-join
//! for every other node, concurrently. Deletion runs delete-node for every
//! node, then delete-cluster.

mod cluster;
mod error;
mod provisioner;
mod spec;

pub use cluster::{Cluster, ClusterState};
pub use error::ProvisionError;
pub use provisioner::{ClusterProvisioner, NodeFailure, ProvisionOutcome, ProvisionerConfig};
pub use spec::{ClusterSpec, NodeSpec};
