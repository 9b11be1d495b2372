use std::collections::BTreeMap;

use futures::future::join_all;
use keel_config::{Config, NodeEvents};
use keel_store::{Task, TaskStatus};
use keel_workflow::WorkflowName;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{RuntimeError, TaskRuntime};

/// Result of resuming one task.
#[derive(Debug)]
pub struct ResumeOutcome {
  pub task_id: String,
  pub workflow: WorkflowName,
  pub cluster_id: String,
  pub result: Result<Config, RuntimeError>,
}

/// Tasks of one cluster run in phases; a later phase consumes the outputs
/// of the earlier ones.
fn phase(workflow: WorkflowName) -> u8 {
  match workflow {
    WorkflowName::PreProvision => 0,
    WorkflowName::MasterBootstrap => 1,
    WorkflowName::MasterJoin | WorkflowName::WorkerJoin => 2,
    WorkflowName::DeleteNode => 3,
    WorkflowName::DeleteCluster => 4,
  }
}

impl TaskRuntime {
  /// Resume every `running` or `queued` task from its persisted step index.
  ///
  /// Clusters are resumed concurrently. Within a cluster, tasks run phase by
  /// phase (fabric, bootstrap master, joins, node deletion, fabric
  /// deletion); a phase that fails leaves later phases untouched for the
  /// operator. Each task gets the runtime's runner and `events` attached,
  /// and adopts the cluster outputs of the last task that finished before it.
  pub async fn resume_all(
    &self,
    events: NodeEvents,
    cancel: &CancellationToken,
  ) -> Result<Vec<ResumeOutcome>, RuntimeError> {
    let mut clusters: BTreeMap<String, Vec<Task>> = BTreeMap::new();
    for task in self.repository().list().await? {
      if matches!(task.status, TaskStatus::Running | TaskStatus::Queued) {
        clusters.entry(task.cluster_id.clone()).or_default().push(task);
      }
    }

    if clusters.is_empty() {
      info!("no tasks to resume");
      return Ok(Vec::new());
    }

    info!(
      clusters = clusters.len(),
      tasks = clusters.values().map(Vec::len).sum::<usize>(),
      "resume_started"
    );

    let runs = clusters
      .into_values()
      .map(|tasks| self.resume_phases(tasks, events.clone(), cancel));
    Ok(join_all(runs).await.into_iter().flatten().collect())
  }

  /// Resume the `running` or `queued` tasks of one cluster, phase by phase
  /// as [`TaskRuntime::resume_all`] does.
  pub async fn resume_cluster(
    &self,
    cluster_id: &str,
    events: NodeEvents,
    cancel: &CancellationToken,
  ) -> Result<Vec<ResumeOutcome>, RuntimeError> {
    let tasks: Vec<Task> = self
      .repository()
      .list_cluster(cluster_id)
      .await?
      .into_iter()
      .filter(|t| matches!(t.status, TaskStatus::Running | TaskStatus::Queued))
      .collect();

    if tasks.is_empty() {
      info!(cluster_id = %cluster_id, "no tasks to resume");
      return Ok(Vec::new());
    }
    info!(cluster_id = %cluster_id, tasks = tasks.len(), "resume_started");
    Ok(self.resume_phases(tasks, events, cancel).await)
  }

  async fn resume_phases(
    &self,
    mut tasks: Vec<Task>,
    events: NodeEvents,
    cancel: &CancellationToken,
  ) -> Vec<ResumeOutcome> {
    tasks.sort_by_key(|t| (phase(t.workflow), t.created_at));

    let mut phases: BTreeMap<u8, Vec<Task>> = BTreeMap::new();
    for task in tasks {
      phases.entry(phase(task.workflow)).or_default().push(task);
    }

    let mut outcomes = Vec::new();
    let mut published: Option<Config> = None;

    for (_, tasks) in phases {
      if cancel.is_cancelled() || self.shutdown_token().is_cancelled() {
        break;
      }

      let runs = tasks.into_iter().map(|mut task| {
        if let Some(base) = &published {
          if let Err(e) = task.config.adopt_cluster_outputs(base) {
            warn!(task_id = %task.id, error = %e, "adopt_outputs_failed");
          }
        }
        task.config.set_events(events.clone());
        let (task_id, workflow, cluster_id) =
          (task.id.clone(), task.workflow, task.cluster_id.clone());

        async move {
          info!(task_id = %task_id, workflow = %workflow, step_index = task.step_index, "task_resumed");
          let result = self.run_task(task, cancel).await;
          ResumeOutcome {
            task_id,
            workflow,
            cluster_id,
            result,
          }
        }
      });

      let results = join_all(runs).await;
      let failed = results.iter().any(|o| o.result.is_err());
      if let Some(cfg) = results.iter().rev().find_map(|o| o.result.as_ref().ok()) {
        published = Some(cfg.clone());
      }
      outcomes.extend(results);

      if failed {
        break;
      }
    }

    outcomes
  }
}

/// Cluster configs that a resume brought to a settled, provisioned state.
///
/// A cluster is included when every resumed task of it finished and none of
/// them was a deletion. The result merges each finished task's node into
/// one config with no current node, ordered by cluster id.
pub fn provisioned_clusters(outcomes: &[ResumeOutcome]) -> Vec<Config> {
  let mut clusters: BTreeMap<&str, Vec<&ResumeOutcome>> = BTreeMap::new();
  for outcome in outcomes {
    clusters.entry(outcome.cluster_id.as_str()).or_default().push(outcome);
  }

  let mut settled = Vec::new();
  for (cluster_id, outcomes) in clusters {
    let deleting = outcomes
      .iter()
      .any(|o| matches!(o.workflow, WorkflowName::DeleteNode | WorkflowName::DeleteCluster));
    if deleting {
      continue;
    }
    let configs: Option<Vec<&Config>> = outcomes.iter().map(|o| o.result.as_ref().ok()).collect();
    let Some(&last) = configs.as_ref().and_then(|c| c.last()) else {
      continue;
    };

    let mut merged: Config = last.clone();
    merged.node = None;
    for cfg in configs.iter().flatten() {
      if let Some(node) = &cfg.node {
        if let Err(e) = merged.add_node(node.clone()) {
          warn!(cluster_id = %cluster_id, node_id = %node.id, error = %e, "node_merge_failed");
        }
      }
    }
    settled.push(merged);
  }
  settled
}
