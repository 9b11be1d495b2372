use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use keel_config::{Config, Node, NodeEvents, node_events};
use keel_runtime::{RuntimeError, TaskRuntime};
use keel_step::ErrorKind;
use keel_store::Task;
use keel_workflow::WorkflowName;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{Cluster, ClusterSpec, ClusterState, ProvisionError};

/// Lifecycle events one node can emit: building, provisioning, active and
/// error.
const EVENTS_PER_NODE: usize = 4;

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
  /// Maximum number of node tasks running at once.
  pub fan_out: usize,
}

impl Default for ProvisionerConfig {
  fn default() -> Self {
    Self { fan_out: 4 }
  }
}

/// A node whose task ended in error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
  pub node_id: String,
  pub name: String,
  pub kind: ErrorKind,
  pub message: String,
}

#[derive(Debug)]
pub struct ProvisionOutcome {
  pub cluster: Cluster,
  /// Final cluster config, with every node's outputs.
  pub config: Config,
  /// Join tasks that failed. Their peers are kept.
  pub failures: Vec<NodeFailure>,
}

impl ProvisionOutcome {
  pub fn is_healthy(&self) -> bool {
    self.failures.is_empty()
  }
}

type Clusters = Arc<Mutex<HashMap<String, Cluster>>>;

/// Composes per-cluster and per-node workflows.
///
/// Provisioning persists every task of the cluster as `queued`, then runs
/// the pre-provision workflow, bootstraps the first master, and joins every
/// other node concurrently (bounded by [`ProvisionerConfig::fan_out`]). Node
/// events from all tasks are mirrored into an in-memory [`Cluster`] record.
pub struct ClusterProvisioner {
  runtime: Arc<TaskRuntime>,
  config: ProvisionerConfig,
  clusters: Clusters,
}

impl ClusterProvisioner {
  pub fn new(runtime: Arc<TaskRuntime>) -> Self {
    Self {
      runtime,
      config: ProvisionerConfig::default(),
      clusters: Arc::default(),
    }
  }

  pub fn with_config(mut self, config: ProvisionerConfig) -> Self {
    self.config = config;
    self
  }

  pub fn runtime(&self) -> &Arc<TaskRuntime> {
    &self.runtime
  }

  pub fn cluster(&self, id: &str) -> Option<Cluster> {
    lock(&self.clusters).get(id).cloned()
  }

  /// Every known cluster, sorted by id.
  pub fn clusters(&self) -> Vec<Cluster> {
    let mut all: Vec<Cluster> = lock(&self.clusters).values().cloned().collect();
    all.sort_by(|a, b| a.id.cmp(&b.id));
    all
  }

  /// Provision the cluster described by `spec`.
  ///
  /// Fabric and bootstrap failures abort the whole provision. Join failures
  /// do not: the outcome lists them and the cluster is marked unhealthy,
  /// with the nodes that made it left in place.
  #[instrument(
    name = "cluster_provision",
    skip(self, spec, cancel),
    fields(cluster_name = %spec.name, provider = %spec.provider)
  )]
  pub async fn provision(
    &self,
    spec: &ClusterSpec,
    cancel: &CancellationToken,
  ) -> Result<ProvisionOutcome, ProvisionError> {
    let cluster_id = spec
      .cluster_id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (mut cfg, masters, workers) = spec.plan(&cluster_id)?;

    let mut workflows = vec![WorkflowName::PreProvision, WorkflowName::MasterBootstrap];
    if masters.len() > 1 {
      workflows.push(WorkflowName::MasterJoin);
    }
    if !workers.is_empty() {
      workflows.push(WorkflowName::WorkerJoin);
    }
    for name in workflows {
      self
        .runtime
        .validate(&cfg, name)
        .map_err(ProvisionError::Dispatch)?;
    }

    let (events, rx) = node_events(spec.node_count() * EVENTS_PER_NODE);
    cfg.set_events(events);
    self.record(Cluster::from_config(&cfg, ClusterState::Provisioning));
    let mirror = self.mirror(&cluster_id, rx);

    info!(
      cluster_id = %cluster_id,
      masters = masters.len(),
      workers = workers.len(),
      "cluster_provision_started"
    );

    let result = self.provision_nodes(cfg, masters, workers, cancel).await;
    mirror.finish().await;

    match result {
      Ok((mut cfg, failures)) => {
        cfg.set_events(NodeEvents::disconnected());
        let state = if failures.is_empty() {
          ClusterState::Operational
        } else {
          ClusterState::Unhealthy
        };
        let cluster = Cluster::from_config(&cfg, state);
        self.record(cluster.clone());

        if failures.is_empty() {
          info!(cluster_id = %cluster_id, "cluster_provisioned");
        } else {
          warn!(
            cluster_id = %cluster_id,
            failed = failures.len(),
            "cluster_unhealthy"
          );
        }
        Ok(ProvisionOutcome {
          cluster,
          config: cfg,
          failures,
        })
      }
      Err(e) => {
        if !e.is_cancelled() {
          self.set_state(&cluster_id, ClusterState::Unhealthy);
        }
        error!(cluster_id = %cluster_id, error = %e, "cluster_provision_failed");
        Err(e)
      }
    }
  }

  /// Persist the whole plan as queued tasks, then drive them phase by
  /// phase: fabric, bootstrap master, joins. Each phase's outputs are
  /// written into the records of the phases after it before they run, so a
  /// process stopped at any point leaves tasks that resume can finish.
  async fn provision_nodes(
    &self,
    cfg: Config,
    masters: Vec<Node>,
    workers: Vec<Node>,
    cancel: &CancellationToken,
  ) -> Result<(Config, Vec<NodeFailure>), ProvisionError> {
    let cluster_id = cfg.cluster_id.clone();
    let Some((bootstrap, rest)) = masters.split_first() else {
      return Err(ProvisionError::InvalidSpec(
        "at least one master is required".to_string(),
      ));
    };

    let mut jobs = vec![
      (WorkflowName::PreProvision, None),
      (WorkflowName::MasterBootstrap, Some(bootstrap.clone())),
    ];
    jobs.extend(rest.iter().map(|n| (WorkflowName::MasterJoin, Some(n.clone()))));
    jobs.extend(workers.into_iter().map(|n| (WorkflowName::WorkerJoin, Some(n))));

    let mut tasks = self.create_all(&cfg, jobs).await?.into_iter();
    let (Some(fabric_task), Some(mut bootstrap_task)) = (tasks.next(), tasks.next()) else {
      return Err(ProvisionError::InvalidSpec(
        "cluster plan has no fabric or bootstrap task".to_string(),
      ));
    };
    let mut joins: Vec<Task> = tasks.collect();

    let fabric = match self.runtime.run_task(fabric_task, cancel).await {
      Ok(fabric) => fabric,
      Err(source) => {
        let pending = std::iter::once(bootstrap_task).chain(joins).collect();
        self.settle(&source, pending, "cluster fabric failed").await;
        return Err(classify(&cluster_id, source, |cluster_id, source| {
          ProvisionError::Fabric { cluster_id, source }
        }));
      }
    };
    info!(cluster_id = %cluster_id, "fabric_ready");

    self.stage(std::slice::from_mut(&mut bootstrap_task), &fabric).await?;
    self.stage(&mut joins, &fabric).await?;

    let mut base = match self.runtime.run_task(bootstrap_task, cancel).await {
      Ok(base) => base,
      Err(source) => {
        self.settle(&source, joins, "bootstrap master failed").await;
        return Err(classify(&cluster_id, source, |cluster_id, source| {
          ProvisionError::Bootstrap {
            cluster_id,
            node: bootstrap.name.clone(),
            source,
          }
        }));
      }
    };
    base.node = None;

    let endpoint = base.kube.api_endpoint();
    info!(
      cluster_id = %cluster_id,
      api_endpoint = endpoint.as_deref().unwrap_or_default(),
      "control_plane_ready"
    );
    self.update(&cluster_id, |c| c.api_endpoint = endpoint);

    self.stage(&mut joins, &base).await?;
    let failures = self.fan_out(&cluster_id, joins, cancel).await?;
    Ok((base, failures))
  }

  /// Delete every node of the cluster, then its fabric.
  ///
  /// The delete-node tasks and the delete-cluster task are all persisted
  /// before the first one runs. The fabric is only torn down once every
  /// node is gone; if any delete-node task fails the cluster is marked
  /// unhealthy and the fabric stays. Returns the final config.
  #[instrument(name = "cluster_delete", skip(self, cfg, cancel), fields(cluster_id = %cfg.cluster_id))]
  pub async fn delete(
    &self,
    cfg: Config,
    cancel: &CancellationToken,
  ) -> Result<Config, ProvisionError> {
    let cluster_id = cfg.cluster_id.clone();
    for name in [WorkflowName::DeleteNode, WorkflowName::DeleteCluster] {
      self
        .runtime
        .validate(&cfg, name)
        .map_err(ProvisionError::Dispatch)?;
    }

    let mut base = cfg;
    base.node = None;
    let nodes = base.all_nodes();

    if self.update(&cluster_id, |c| c.state = ClusterState::Deleting).is_none() {
      self.record(Cluster::from_config(&base, ClusterState::Deleting));
    }
    info!(cluster_id = %cluster_id, nodes = nodes.len(), "cluster_delete_started");

    let mut jobs: Vec<(WorkflowName, Option<Node>)> = nodes
      .into_iter()
      .map(|n| (WorkflowName::DeleteNode, Some(n)))
      .collect();
    jobs.push((WorkflowName::DeleteCluster, None));

    let mut tasks = self.create_all(&base, jobs).await?;
    let Some(mut cleanup_task) = tasks.pop() else {
      return Err(ProvisionError::InvalidSpec(
        "deletion plan has no delete-cluster task".to_string(),
      ));
    };

    let failures = self.fan_out(&cluster_id, tasks, cancel).await?;
    if !failures.is_empty() {
      self
        .settle_all(vec![cleanup_task], "node deletion failed")
        .await;
      self.set_state(&cluster_id, ClusterState::Unhealthy);
      error!(
        cluster_id = %cluster_id,
        failed = failures.len(),
        "cluster_node_deletion_failed"
      );
      return Err(ProvisionError::NodeDeletion {
        cluster_id,
        failed: failures.len(),
      });
    }

    self.stage(std::slice::from_mut(&mut cleanup_task), &base).await?;
    let cleaned = match self.runtime.run_task(cleanup_task, cancel).await {
      Ok(cfg) => cfg,
      Err(source) => {
        let err = classify(&cluster_id, source, |cluster_id, source| {
          ProvisionError::Cleanup { cluster_id, source }
        });
        if !err.is_cancelled() {
          self.set_state(&cluster_id, ClusterState::Unhealthy);
        }
        error!(cluster_id = %cluster_id, error = %err, "cluster_cleanup_failed");
        return Err(err);
      }
    };

    self.update(&cluster_id, |c| {
      c.state = ClusterState::Deleted;
      c.api_endpoint = None;
      c.nodes.clear();
    });
    info!(cluster_id = %cluster_id, "cluster_deleted");
    Ok(cleaned)
  }

  /// Persist one queued task per job, in order. A job without a node runs
  /// on the cluster config itself. If any create fails, the tasks created
  /// so far are abandoned and nothing runs.
  async fn create_all(
    &self,
    base: &Config,
    jobs: Vec<(WorkflowName, Option<Node>)>,
  ) -> Result<Vec<Task>, ProvisionError> {
    let mut tasks = Vec::with_capacity(jobs.len());
    for (workflow, node) in jobs {
      let cfg = match node {
        Some(node) => base.with_node(node),
        None => base.clone(),
      };
      match self.runtime.create_task(workflow, cfg).await {
        Ok(task) => tasks.push(task),
        Err(e) => {
          self.settle_all(tasks, "cluster plan could not be persisted").await;
          return Err(ProvisionError::Dispatch(e));
        }
      }
    }
    Ok(tasks)
  }

  /// Copy the cluster outputs of `base` into queued tasks and persist them.
  async fn stage(&self, tasks: &mut [Task], base: &Config) -> Result<(), ProvisionError> {
    for task in tasks {
      task
        .config
        .adopt_cluster_outputs(base)
        .map_err(|e| ProvisionError::InvalidSpec(e.to_string()))?;
      task.touch();
      self
        .runtime
        .repository()
        .put(task)
        .await
        .map_err(|e| ProvisionError::Dispatch(e.into()))?;
    }
    Ok(())
  }

  /// Deal with queued tasks that will not run because `err` stopped an
  /// earlier phase. After a shutdown they stay queued for resume.
  async fn settle(&self, err: &RuntimeError, pending: Vec<Task>, reason: &str) {
    if err.is_cancelled() && self.runtime.shutdown_token().is_cancelled() {
      info!(pending = pending.len(), "tasks_left_for_resume");
      return;
    }
    self.settle_all(pending, reason).await;
  }

  async fn settle_all(&self, pending: Vec<Task>, reason: &str) {
    for task in pending {
      let task_id = task.id.clone();
      if let Err(e) = self.runtime.abandon(task, reason).await {
        warn!(task_id = %task_id, error = %e, "task_abandon_failed");
      }
    }
  }

  /// Run already persisted node tasks with at most `fan_out` in flight.
  async fn fan_out(
    &self,
    cluster_id: &str,
    tasks: Vec<Task>,
    cancel: &CancellationToken,
  ) -> Result<Vec<NodeFailure>, ProvisionError> {
    let semaphore = Arc::new(Semaphore::new(self.config.fan_out.max(1)));

    let mut nodes = Vec::with_capacity(tasks.len());
    let mut handles: Vec<JoinHandle<Result<Config, RuntimeError>>> =
      Vec::with_capacity(tasks.len());
    for task in tasks {
      nodes.push(match &task.config.node {
        Some(node) => (node.id.clone(), node.name.clone()),
        None => (task.id.clone(), task.workflow.to_string()),
      });

      let runtime = self.runtime.clone();
      let semaphore = semaphore.clone();
      let cancel = cancel.clone();
      handles.push(tokio::spawn(async move {
        let _permit = semaphore.acquire_owned().await;
        runtime.run_task(task, &cancel).await
      }));
    }

    let mut failures = Vec::new();
    for ((node_id, name), joined) in nodes.into_iter().zip(join_all(handles).await) {
      let err = match joined {
        Ok(Ok(_)) => continue,
        Ok(Err(e)) => NodeFailure {
          node_id,
          name,
          kind: e.kind(),
          message: e.to_string(),
        },
        Err(e) => NodeFailure {
          node_id,
          name,
          kind: ErrorKind::Fatal,
          message: format!("node task aborted: {e}"),
        },
      };
      warn!(
        cluster_id = %cluster_id,
        node_id = %err.node_id,
        node = %err.name,
        kind = %err.kind,
        error = %err.message,
        "node_task_failed"
      );
      failures.push(err);
    }

    if cancel.is_cancelled() || self.runtime.shutdown_token().is_cancelled() {
      return Err(ProvisionError::Cancelled {
        cluster_id: cluster_id.to_string(),
      });
    }
    Ok(failures)
  }

  fn record(&self, cluster: Cluster) {
    lock(&self.clusters).insert(cluster.id.clone(), cluster);
  }

  fn update(&self, id: &str, f: impl FnOnce(&mut Cluster)) -> Option<Cluster> {
    let mut clusters = lock(&self.clusters);
    let cluster = clusters.get_mut(id)?;
    f(cluster);
    Some(cluster.clone())
  }

  fn set_state(&self, id: &str, state: ClusterState) {
    self.update(id, |c| c.state = state);
  }

  /// Mirror node events into the cluster record until finished.
  fn mirror(&self, cluster_id: &str, mut rx: mpsc::Receiver<Node>) -> Mirror {
    let stop = CancellationToken::new();
    let clusters = self.clusters.clone();
    let cluster_id = cluster_id.to_string();
    let token = stop.clone();

    let handle = tokio::spawn(async move {
      loop {
        tokio::select! {
          biased;
          Some(node) = rx.recv() => apply_event(&clusters, &cluster_id, node),
          _ = token.cancelled() => {
            while let Ok(node) = rx.try_recv() {
              apply_event(&clusters, &cluster_id, node);
            }
            break;
          }
        }
      }
    });

    Mirror { stop, handle }
  }
}

struct Mirror {
  stop: CancellationToken,
  handle: JoinHandle<()>,
}

impl Mirror {
  /// Drain what is buffered, then stop.
  async fn finish(self) {
    self.stop.cancel();
    if let Err(e) = self.handle.await {
      warn!(error = %e, "node_event_mirror_failed");
    }
  }
}

fn apply_event(clusters: &Clusters, cluster_id: &str, node: Node) {
  info!(
    cluster_id = %cluster_id,
    node_id = %node.id,
    node = %node.name,
    state = %node.state,
    "node_state_changed"
  );
  if let Some(cluster) = lock(clusters).get_mut(cluster_id) {
    cluster.nodes.insert(node.id.clone(), node);
  }
}

fn classify(
  cluster_id: &str,
  source: RuntimeError,
  wrap: impl FnOnce(String, RuntimeError) -> ProvisionError,
) -> ProvisionError {
  if source.is_cancelled() {
    ProvisionError::Cancelled {
      cluster_id: cluster_id.to_string(),
    }
  } else {
    wrap(cluster_id.to_string(), source)
  }
}

fn lock(clusters: &Clusters) -> MutexGuard<'_, HashMap<String, Cluster>> {
  clusters.lock().unwrap_or_else(PoisonError::into_inner)
}
