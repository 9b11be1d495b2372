//! Task runtime behavior against recording fake steps and in-memory stores.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keel_config::{Config, Node, NodeEvents, NodeRole, NodeState, Provider, node_events};
use keel_journal::{JournalWriter, MemoryJournalStore};
use keel_runtime::{RuntimeConfig, RuntimeError, TaskRuntime, provisioned_clusters};
use keel_step::{ErrorKind, Step, StepError, StepRegistry};
use keel_store::{KvStore, MemoryKvStore, Task, TaskRepository, TaskStatus};
use keel_workflow::{RetryPolicy, Workflow, WorkflowCatalog, WorkflowName};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
  fn push(&self, entry: String) {
    self.0.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
  }

  fn entries(&self) -> Vec<String> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

/// Records runs and rollbacks; records its output in `cfg.aws.subnets`.
/// Fails with the queued errors first, if any.
struct Recorder {
  name: String,
  log: Log,
  failures: Mutex<Vec<StepError>>,
}

impl Recorder {
  fn new(name: &str, log: &Log) -> Self {
    Self {
      name: name.to_string(),
      log: log.clone(),
      failures: Mutex::new(Vec::new()),
    }
  }

  fn failing(self, errors: Vec<StepError>) -> Self {
    *self.failures.lock().unwrap() = errors;
    self
  }
}

#[async_trait]
impl Step for Recorder {
  fn name(&self) -> &str {
    &self.name
  }

  fn description(&self) -> &str {
    "records invocations"
  }

  async fn run(
    &self,
    _cancel: &CancellationToken,
    out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    self.log.push(format!("run:{}", self.name));
    let failure = {
      let mut failures = self.failures.lock().unwrap();
      (!failures.is_empty()).then(|| failures.remove(0))
    };
    if let Some(err) = failure {
      return Err(err);
    }
    out.line(&format!("{} did its thing", self.name)).await.ok();
    cfg.aws.subnets.insert(self.name.clone(), "done".to_string());
    Ok(())
  }

  async fn rollback(
    &self,
    _cancel: &CancellationToken,
    _out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    self.log.push(format!("rollback:{}", self.name));
    cfg.aws.subnets.remove(&self.name);
    Ok(())
  }
}

/// Waits for cancellation like a step stuck in a poll loop, optionally
/// tripping a token first.
struct Hang {
  name: String,
  trip: Option<CancellationToken>,
}

#[async_trait]
impl Step for Hang {
  fn name(&self) -> &str {
    &self.name
  }

  fn description(&self) -> &str {
    "waits for cancellation"
  }

  async fn run(
    &self,
    cancel: &CancellationToken,
    _out: &JournalWriter,
    cfg: &mut Config,
  ) -> Result<(), StepError> {
    cfg.set_node_state(NodeState::Building, cancel).await?;
    if let Some(trip) = &self.trip {
      trip.cancel();
    }
    cancel.cancelled().await;
    Err(StepError::Cancelled)
  }

  async fn rollback(
    &self,
    _cancel: &CancellationToken,
    _out: &JournalWriter,
    _cfg: &mut Config,
  ) -> Result<(), StepError> {
    panic!("cancellation must not roll back");
  }
}

struct Harness {
  runtime: TaskRuntime,
  kv: MemoryKvStore,
  journals: MemoryJournalStore,
}

fn harness(kv: MemoryKvStore, steps: Vec<Arc<dyn Step>>, workflows: Vec<Workflow>) -> Harness {
  let mut registry = StepRegistry::new();
  for step in steps {
    registry.register(step.name().to_string(), step);
  }

  let mut catalog = WorkflowCatalog::standard();
  for workflow in workflows {
    catalog = catalog.with_override(Provider::Aws, workflow);
  }

  let journals = MemoryJournalStore::new();
  let repository = TaskRepository::new(Arc::new(kv.clone()), "keel");
  let runtime = TaskRuntime::new(
    Arc::new(registry),
    Arc::new(catalog),
    repository,
    Arc::new(journals.clone()),
  )
  .with_config(RuntimeConfig {
    retry_delay: Some(Duration::from_millis(1)),
  });

  Harness {
    runtime,
    kv,
    journals,
  }
}

fn recorders(names: &[&str], log: &Log) -> Vec<Arc<dyn Step>> {
  names
    .iter()
    .map(|n| Arc::new(Recorder::new(n, log)) as Arc<dyn Step>)
    .collect()
}

fn config_with_node() -> Config {
  let base = Config::new(Provider::Aws, "c-1", "demo");
  let node = Node::new("m-0", "master-0", NodeRole::Master, "c-1", Provider::Aws);
  base.add_node(node.clone()).unwrap();
  base.with_node(node)
}

#[tokio::test]
async fn test_runs_steps_in_order_and_deletes_record() {
  let log = Log::default();
  let h = harness(
    MemoryKvStore::new(),
    recorders(&["a", "b", "c"], &log),
    vec![Workflow::new(WorkflowName::PreProvision, &["a", "b", "c"])],
  );

  let task = h
    .runtime
    .create_task(WorkflowName::PreProvision, Config::new(Provider::Aws, "c-1", "demo"))
    .await
    .unwrap();
  assert_eq!(task.status, TaskStatus::Queued);
  assert!(h.runtime.repository().get(&task.id).await.unwrap().is_some());

  let uri = task.journal_uri.clone();
  let id = task.id.clone();
  let cfg = h.runtime.run_task(task, &CancellationToken::new()).await.unwrap();

  assert_eq!(log.entries(), vec!["run:a", "run:b", "run:c"]);
  assert_eq!(cfg.aws.subnets.len(), 3);
  assert!(h.runtime.repository().get(&id).await.unwrap().is_none());

  let journal = h.journals.contents(&uri).unwrap();
  assert!(journal.contains("==> [1/3] a"));
  assert!(journal.contains("b did its thing"));
  assert!(journal.contains("==> finished"));
}

#[tokio::test]
async fn test_unknown_step_fails_at_dispatch() {
  let log = Log::default();
  let h = harness(
    MemoryKvStore::new(),
    recorders(&["a"], &log),
    vec![Workflow::new(WorkflowName::PreProvision, &["a", "missing"])],
  );

  let err = h
    .runtime
    .create_task(WorkflowName::PreProvision, Config::new(Provider::Aws, "c-1", "demo"))
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Fatal);
  assert!(log.entries().is_empty());
  assert!(h.kv.list("keel/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_marks_error_and_rolls_back_in_reverse() {
  let log = Log::default();
  let mut steps = recorders(&["a", "b", "c"], &log);
  steps.push(Arc::new(Recorder::new("d", &log).failing(vec![
    StepError::Authorization {
      message: "bad credentials".to_string(),
    },
  ])));
  let h = harness(
    MemoryKvStore::new(),
    steps,
    vec![Workflow::new(WorkflowName::MasterBootstrap, &["a", "b", "c", "d"])
      .with_retry(RetryPolicy::new(3, Duration::ZERO))],
  );

  let (events, mut rx) = node_events(8);
  let mut cfg = config_with_node();
  cfg.set_events(events);
  let task = h
    .runtime
    .create_task(WorkflowName::MasterBootstrap, cfg)
    .await
    .unwrap();
  let id = task.id.clone();

  let err = h
    .runtime
    .run_task(task, &CancellationToken::new())
    .await
    .unwrap_err();

  // Authorization is never retried.
  match &err {
    RuntimeError::Step { step, source, .. } => {
      assert_eq!(step, "d");
      assert_eq!(source.kind(), ErrorKind::Authorization);
    }
    other => panic!("unexpected error: {other}"),
  }
  assert_eq!(
    log.entries(),
    vec![
      "run:a",
      "run:b",
      "run:c",
      "run:d",
      "rollback:d",
      "rollback:c",
      "rollback:b",
      "rollback:a",
    ]
  );

  let stored = h.runtime.repository().get(&id).await.unwrap().unwrap();
  assert_eq!(stored.status, TaskStatus::Error);
  assert_eq!(stored.step_index, 3);
  let failure = stored.error.unwrap();
  assert_eq!(failure.kind, ErrorKind::Authorization);
  assert_eq!(failure.step.as_deref(), Some("d"));
  assert!(stored.config.aws.subnets.is_empty());
  assert_eq!(stored.config.node.unwrap().state, NodeState::Error);

  let event = rx.try_recv().unwrap();
  assert_eq!(event.state, NodeState::Error);
}

#[tokio::test]
async fn test_failure_at_first_step_rolls_back_only_that_step() {
  let log = Log::default();
  let mut steps = recorders(&["b"], &log);
  steps.push(Arc::new(
    Recorder::new("a", &log).failing(vec![StepError::fatal("corrupted")]),
  ));
  let h = harness(
    MemoryKvStore::new(),
    steps,
    vec![Workflow::new(WorkflowName::DeleteNode, &["a", "b"])],
  );

  let err = h
    .runtime
    .run_workflow(
      WorkflowName::DeleteNode,
      config_with_node(),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Fatal);
  assert_eq!(log.entries(), vec!["run:a", "rollback:a"]);
}

#[tokio::test]
async fn test_retryable_error_is_retried() {
  let log = Log::default();
  let mut steps = recorders(&["a"], &log);
  steps.push(Arc::new(Recorder::new("flaky", &log).failing(vec![
    StepError::RemoteExec {
      exit_code: 1,
      stderr_tail: "apt lock held".to_string(),
    },
    StepError::provider("throttled"),
  ])));
  let h = harness(
    MemoryKvStore::new(),
    steps,
    vec![
      Workflow::new(WorkflowName::WorkerJoin, &["a", "flaky"])
        .with_retry(RetryPolicy::new(3, Duration::from_secs(30))),
    ],
  );

  h.runtime
    .run_workflow(
      WorkflowName::WorkerJoin,
      config_with_node(),
      &CancellationToken::new(),
    )
    .await
    .unwrap();

  assert_eq!(
    log.entries(),
    vec!["run:a", "run:flaky", "run:flaky", "run:flaky"]
  );
}

#[tokio::test]
async fn test_retries_exhausted_rolls_back() {
  let log = Log::default();
  let mut steps = recorders(&["a"], &log);
  let boom = || StepError::RemoteExec {
    exit_code: 2,
    stderr_tail: "boom".to_string(),
  };
  steps.push(Arc::new(
    Recorder::new("join", &log).failing(vec![boom(), boom(), boom()]),
  ));
  let h = harness(
    MemoryKvStore::new(),
    steps,
    vec![
      Workflow::new(WorkflowName::WorkerJoin, &["a", "join"])
        .with_retry(RetryPolicy::new(2, Duration::ZERO)),
    ],
  );

  let task = h
    .runtime
    .create_task(WorkflowName::WorkerJoin, config_with_node())
    .await
    .unwrap();
  let id = task.id.clone();
  let err = h
    .runtime
    .run_task(task, &CancellationToken::new())
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::RemoteExec);
  assert_eq!(
    log.entries(),
    vec!["run:a", "run:join", "run:join", "rollback:join", "rollback:a"]
  );
  let stored = h.runtime.repository().get(&id).await.unwrap().unwrap();
  assert_eq!(stored.attempts, 2);
  assert_eq!(stored.status, TaskStatus::Error);
}

#[tokio::test]
async fn test_caller_cancel_marks_error_without_rollback() {
  let log = Log::default();
  let mut steps = recorders(&["a"], &log);
  steps.push(Arc::new(Hang {
    name: "poll".to_string(),
    trip: None,
  }));
  let h = harness(
    MemoryKvStore::new(),
    steps,
    vec![Workflow::new(WorkflowName::WorkerJoin, &["a", "poll"])],
  );

  let task = h
    .runtime
    .create_task(WorkflowName::WorkerJoin, config_with_node())
    .await
    .unwrap();
  let id = task.id.clone();

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let err = h.runtime.run_task(task, &cancel).await.unwrap_err();
  assert!(err.is_cancelled());
  assert_eq!(log.entries(), vec!["run:a"]);

  let stored = h.runtime.repository().get(&id).await.unwrap().unwrap();
  assert_eq!(stored.status, TaskStatus::Error);
  assert_eq!(stored.error.unwrap().kind, ErrorKind::Cancelled);
  assert_eq!(stored.step_index, 1);
  assert_eq!(stored.config.node.unwrap().state, NodeState::Building);
}

#[tokio::test]
async fn test_shutdown_suspends_then_resume_runs_remaining_steps() {
  let names = ["s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10"];
  let workflow = Workflow::new(WorkflowName::PreProvision, &names);
  let kv = MemoryKvStore::new();

  // First process: the fourth step trips shutdown while it runs.
  let first_log = Log::default();
  let shutdown = CancellationToken::new();
  let mut steps = recorders(&names[..3], &first_log);
  steps.push(Arc::new(Hang {
    name: "s4".to_string(),
    trip: Some(shutdown.clone()),
  }));
  steps.extend(recorders(&names[4..], &first_log));
  let first = harness(kv.clone(), steps, vec![workflow.clone()]);
  let runtime = first.runtime.with_shutdown(shutdown);

  let task = runtime
    .create_task(WorkflowName::PreProvision, config_with_node())
    .await
    .unwrap();
  let id = task.id.clone();
  let err = runtime
    .run_task(task, &CancellationToken::new())
    .await
    .unwrap_err();
  assert!(err.is_cancelled());
  assert_eq!(first_log.entries(), vec!["run:s1", "run:s2", "run:s3"]);

  let stored = runtime.repository().get(&id).await.unwrap().unwrap();
  assert_eq!(stored.status, TaskStatus::Running);
  assert_eq!(stored.step_index, 3);
  assert_eq!(stored.config.aws.subnets.len(), 3);

  // Second process over the same store.
  let second_log = Log::default();
  let second = harness(kv, recorders(&names, &second_log), vec![workflow]);
  let outcomes = second
    .runtime
    .resume_all(NodeEvents::disconnected(), &CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcomes.len(), 1);
  assert_eq!(outcomes[0].task_id, id);
  let cfg = outcomes[0].result.as_ref().unwrap();
  assert_eq!(cfg.aws.subnets.len(), 10);
  assert_eq!(
    second_log.entries(),
    names[3..]
      .iter()
      .map(|n| format!("run:{n}"))
      .collect::<Vec<_>>()
  );
  assert!(second.runtime.repository().get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_skips_terminal_tasks_and_orders_phases() {
  let log = Log::default();
  let kv = MemoryKvStore::new();
  let h = harness(
    kv,
    recorders(&["fabric", "boot", "join"], &log),
    vec![
      Workflow::new(WorkflowName::PreProvision, &["fabric"]),
      Workflow::new(WorkflowName::MasterBootstrap, &["boot"]),
      Workflow::new(WorkflowName::WorkerJoin, &["join"]),
    ],
  );

  // Created in reverse order on purpose.
  let worker = Node::new("w-0", "worker-0", NodeRole::Node, "c-1", Provider::Aws);
  let base = Config::new(Provider::Aws, "c-1", "demo");
  h.runtime
    .create_task(WorkflowName::WorkerJoin, base.with_node(worker))
    .await
    .unwrap();
  h.runtime
    .create_task(WorkflowName::MasterBootstrap, config_with_node())
    .await
    .unwrap();
  h.runtime
    .create_task(WorkflowName::PreProvision, base.clone())
    .await
    .unwrap();
  let mut done = Task::new("done-1", WorkflowName::DeleteNode, base.clone(), "mem://done-1");
  done.status = TaskStatus::Error;
  h.runtime.repository().put(&done).await.unwrap();

  let (events, _rx) = node_events(4);
  let outcomes = h
    .runtime
    .resume_all(events, &CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcomes.len(), 3);
  assert_eq!(log.entries(), vec!["run:fabric", "run:boot", "run:join"]);

  // The join task adopted the fabric output published before it.
  let join = outcomes
    .iter()
    .find(|o| o.workflow == WorkflowName::WorkerJoin)
    .unwrap();
  let cfg = join.result.as_ref().unwrap();
  assert!(cfg.aws.subnets.contains_key("fabric"));
  assert!(cfg.aws.subnets.contains_key("boot"));
  assert!(cfg.masters.contains("m-0"));

  let remaining = h.runtime.repository().list().await.unwrap();
  assert_eq!(remaining.len(), 1);
  assert_eq!(remaining[0].id, done.id);
}

#[tokio::test]
async fn test_resume_cluster_leaves_other_clusters_queued() {
  let log = Log::default();
  let h = harness(
    MemoryKvStore::new(),
    recorders(&["fabric"], &log),
    vec![Workflow::new(WorkflowName::PreProvision, &["fabric"])],
  );

  h.runtime
    .create_task(WorkflowName::PreProvision, Config::new(Provider::Aws, "c-1", "one"))
    .await
    .unwrap();
  let other = h
    .runtime
    .create_task(WorkflowName::PreProvision, Config::new(Provider::Aws, "c-2", "two"))
    .await
    .unwrap();

  let outcomes = h
    .runtime
    .resume_cluster("c-1", NodeEvents::disconnected(), &CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(outcomes.len(), 1);
  assert_eq!(outcomes[0].cluster_id, "c-1");
  assert_eq!(log.entries(), vec!["run:fabric"]);

  let remaining = h.runtime.repository().list().await.unwrap();
  assert_eq!(remaining.len(), 1);
  assert_eq!(remaining[0].id, other.id);
  assert_eq!(remaining[0].status, TaskStatus::Queued);

  // Nothing left for the finished cluster.
  let again = h
    .runtime
    .resume_cluster("c-1", NodeEvents::disconnected(), &CancellationToken::new())
    .await
    .unwrap();
  assert!(again.is_empty());
}

#[tokio::test]
async fn test_provisioned_clusters_merges_nodes_of_finished_clusters() {
  let log = Log::default();
  let mut steps = recorders(&["boot", "join"], &log);
  steps.push(Arc::new(Recorder::new("bad", &log).failing(vec![
    StepError::Authorization {
      message: "denied".to_string(),
    },
  ])));
  let h = harness(
    MemoryKvStore::new(),
    steps,
    vec![
      Workflow::new(WorkflowName::MasterBootstrap, &["boot"]),
      Workflow::new(WorkflowName::WorkerJoin, &["join"]),
      Workflow::new(WorkflowName::MasterJoin, &["bad"]),
    ],
  );

  let base = Config::new(Provider::Aws, "c-1", "demo");
  let worker = Node::new("w-0", "worker-0", NodeRole::Node, "c-1", Provider::Aws);
  h.runtime
    .create_task(WorkflowName::MasterBootstrap, config_with_node())
    .await
    .unwrap();
  h.runtime
    .create_task(WorkflowName::WorkerJoin, base.with_node(worker))
    .await
    .unwrap();

  let broken = Config::new(Provider::Aws, "c-2", "broken");
  let master = Node::new("m-9", "master-9", NodeRole::Master, "c-2", Provider::Aws);
  h.runtime
    .create_task(WorkflowName::MasterJoin, broken.with_node(master))
    .await
    .unwrap();

  let outcomes = h
    .runtime
    .resume_all(NodeEvents::disconnected(), &CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(outcomes.len(), 3);

  let settled = provisioned_clusters(&outcomes);
  assert_eq!(settled.len(), 1);
  let cfg = &settled[0];
  assert_eq!(cfg.cluster_id, "c-1");
  assert!(cfg.node.is_none());
  assert!(cfg.masters.contains("m-0"));
  assert!(cfg.nodes.contains("w-0"));
  assert!(cfg.aws.subnets.contains_key("boot"));
  assert!(cfg.aws.subnets.contains_key("join"));
}
