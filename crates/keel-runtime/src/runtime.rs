use std::sync::Arc;
use std::time::Duration;

use keel_config::{Config, NodeState};
use keel_journal::{JournalStore, JournalWriter};
use keel_runner::Runner;
use keel_step::{ErrorKind, StepError, StepRegistry};
use keel_store::{Task, TaskFailure, TaskRepository, TaskStatus};
use keel_workflow::{Workflow, WorkflowCatalog, WorkflowName};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::RuntimeError;

/// Configuration for the task runtime.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
  /// Overrides every workflow's retry delay when set.
  pub retry_delay: Option<Duration>,
}

/// Runs workflows as checkpointed tasks.
///
/// The runtime keeps no per-task state of its own; everything a task needs
/// to continue lives in its record in the [`TaskRepository`].
pub struct TaskRuntime {
  registry: Arc<StepRegistry>,
  catalog: Arc<WorkflowCatalog>,
  repository: TaskRepository,
  journals: Arc<dyn JournalStore>,
  runner: Option<Arc<dyn Runner>>,
  shutdown: CancellationToken,
  config: RuntimeConfig,
}

impl TaskRuntime {
  pub fn new(
    registry: Arc<StepRegistry>,
    catalog: Arc<WorkflowCatalog>,
    repository: TaskRepository,
    journals: Arc<dyn JournalStore>,
  ) -> Self {
    Self {
      registry,
      catalog,
      repository,
      journals,
      runner: None,
      shutdown: CancellationToken::new(),
      config: RuntimeConfig::default(),
    }
  }

  /// Runner attached to every config that arrives without one.
  pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
    self.runner = Some(runner);
    self
  }

  /// Token that suspends all tasks when cancelled. Suspended tasks stay
  /// `running` and are picked up again by [`TaskRuntime::resume_all`].
  pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
    self.shutdown = shutdown;
    self
  }

  pub fn with_config(mut self, config: RuntimeConfig) -> Self {
    self.config = config;
    self
  }

  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  pub fn repository(&self) -> &TaskRepository {
    &self.repository
  }

  pub fn journals(&self) -> &Arc<dyn JournalStore> {
    &self.journals
  }

  pub fn registry(&self) -> &StepRegistry {
    &self.registry
  }

  /// Resolve `name` for the config's provider and check every step is
  /// registered. Nothing is persisted or executed.
  pub fn validate(&self, cfg: &Config, name: WorkflowName) -> Result<&Workflow, RuntimeError> {
    Ok(self.catalog.resolve(cfg.provider, name, &self.registry)?)
  }

  /// Validate and persist a new `queued` task for `name` over `cfg`.
  pub async fn create_task(&self, name: WorkflowName, cfg: Config) -> Result<Task, RuntimeError> {
    self.validate(&cfg, name)?;

    let id = uuid::Uuid::new_v4().to_string();
    let journal_uri = self.journals.uri_for(&id);
    let task = Task::new(id, name, cfg, journal_uri);
    self.repository.put(&task).await?;

    info!(
      task_id = %task.id,
      workflow = %name,
      cluster_id = %task.cluster_id,
      "task_created"
    );
    Ok(task)
  }

  /// Mark a queued task that will never run as `error` (kind `cancelled`).
  /// The record stays for inspection and is skipped by resume.
  pub async fn abandon(&self, mut task: Task, reason: &str) -> Result<(), RuntimeError> {
    task.status = TaskStatus::Error;
    task.error = Some(TaskFailure {
      kind: ErrorKind::Cancelled,
      message: reason.to_string(),
      step: None,
    });
    task.touch();
    self.repository.put(&task).await?;

    warn!(
      task_id = %task.id,
      workflow = %task.workflow,
      reason,
      "task_abandoned"
    );
    Ok(())
  }

  /// Create a task for `name` and run it to completion.
  pub async fn run_workflow(
    &self,
    name: WorkflowName,
    cfg: Config,
    cancel: &CancellationToken,
  ) -> Result<Config, RuntimeError> {
    let task = self.create_task(name, cfg).await?;
    self.run_task(task, cancel).await
  }

  /// Run `task` from its persisted step index.
  ///
  /// On success the record is deleted and the final config returned. On
  /// failure the record is kept with status `error`. Cancelling `cancel`
  /// marks the task `error` (kind `cancelled`); the shutdown token leaves it
  /// `running`. Neither rolls back.
  #[instrument(
    name = "task_run",
    skip(self, task, cancel),
    fields(
      task_id = %task.id,
      workflow = %task.workflow,
      cluster_id = %task.cluster_id,
    )
  )]
  pub async fn run_task(
    &self,
    mut task: Task,
    cancel: &CancellationToken,
  ) -> Result<Config, RuntimeError> {
    let workflow = match self.catalog.resolve(task.config.provider, task.workflow, &self.registry) {
      Ok(workflow) => workflow.clone(),
      Err(e) => {
        task.status = TaskStatus::Error;
        task.error = Some(TaskFailure {
          kind: ErrorKind::Fatal,
          message: e.to_string(),
          step: None,
        });
        task.touch();
        self.repository.put(&task).await?;
        error!(task_id = %task.id, error = %e, "task_dispatch_failed");
        return Err(e.into());
      }
    };

    // Shutdown cancels through the parent; the caller's token is linked in.
    let token = self.shutdown.child_token();
    let _guard = token.clone().drop_guard();
    {
      let caller = cancel.clone();
      let linked = token.clone();
      tokio::spawn(async move {
        tokio::select! {
          _ = caller.cancelled() => linked.cancel(),
          _ = linked.cancelled() => {}
        }
      });
    }

    if !task.config.runner.is_attached() {
      if let Some(runner) = &self.runner {
        task.config.attach_runner(runner.clone());
      }
    }

    let out = self.journals.open(&task.journal_uri).await?;

    task.status = TaskStatus::Running;
    task.touch();
    self.repository.put(&task).await?;

    info!(
      task_id = %task.id,
      workflow = %task.workflow,
      step_index = task.step_index,
      steps = workflow.len(),
      "task_started"
    );

    while task.step_index < workflow.len() {
      let index = task.step_index;
      let name = workflow.steps[index].clone();

      let Some(step) = self.registry.get(&name) else {
        let err = StepError::fatal(format!("step '{name}' is not registered"));
        return self.fail(task, &workflow, &name, err, &token, &out).await;
      };

      journal_line(
        &out,
        &format!("==> [{}/{}] {}", index + 1, workflow.len(), name),
      )
      .await;

      let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(StepError::Cancelled),
        result = step.run(&token, &out, &mut task.config) => result,
      };

      match result {
        Ok(()) => {
          task.step_index += 1;
          task.attempts = 0;
          task.error = None;
          task.touch();
          self.repository.put(&task).await?;

          info!(
            task_id = %task.id,
            step = %name,
            step_index = task.step_index,
            "step_completed"
          );
        }
        Err(err) if err.is_cancelled() || token.is_cancelled() => {
          return self.suspend_or_cancel(task, &name, cancel, &out).await;
        }
        Err(err) => {
          task.attempts += 1;
          if err.kind().is_retryable() && workflow.retry.allows_another(task.attempts) {
            task.status = TaskStatus::Queued;
            task.error = Some(TaskFailure::from_step(&name, &err));
            task.touch();
            self.repository.put(&task).await?;

            let delay = self.config.retry_delay.unwrap_or(workflow.retry.delay);
            warn!(
              task_id = %task.id,
              step = %name,
              attempts = task.attempts,
              max_attempts = workflow.retry.max_attempts,
              error = %err,
              "step_retry_scheduled"
            );
            journal_line(&out, &format!("--> {name} failed ({err}), retrying")).await;

            tokio::select! {
              biased;
              _ = token.cancelled() => {
                return self.suspend_or_cancel(task, &name, cancel, &out).await;
              }
              _ = tokio::time::sleep(delay) => {}
            }

            task.status = TaskStatus::Running;
            task.touch();
            self.repository.put(&task).await?;
            continue;
          }

          return self.fail(task, &workflow, &name, err, &token, &out).await;
        }
      }
    }

    task.status = TaskStatus::Finished;
    journal_line(&out, "==> finished").await;
    self.repository.delete(&task.id).await?;

    info!(task_id = %task.id, workflow = %task.workflow, "task_finished");
    Ok(task.config)
  }

  /// Record `err`, flip the node to `error`, and roll back the failing step
  /// and everything before it.
  async fn fail(
    &self,
    mut task: Task,
    workflow: &Workflow,
    step: &str,
    err: StepError,
    token: &CancellationToken,
    out: &JournalWriter,
  ) -> Result<Config, RuntimeError> {
    task.status = TaskStatus::Error;
    task.error = Some(TaskFailure::from_step(step, &err));
    task.touch();
    self.repository.put(&task).await?;

    error!(
      task_id = %task.id,
      step = %step,
      kind = %err.kind(),
      error = %err,
      "task_failed"
    );
    journal_line(out, &format!("==> {step} failed: {err}")).await;

    if task.config.node.is_some() {
      if let Err(e) = task.config.set_node_state(NodeState::Error, token).await {
        warn!(task_id = %task.id, error = %e, "node_state_update_failed");
      }
    }

    self.rollback(&mut task, workflow, token, out).await;

    task.touch();
    self.repository.put(&task).await?;

    Err(RuntimeError::Step {
      task_id: task.id,
      step: step.to_string(),
      source: err,
    })
  }

  /// Roll back the failing step, then every completed step in reverse order.
  ///
  /// The failing step goes first because it may have produced part of its
  /// outputs before the error. Errors are logged only.
  async fn rollback(
    &self,
    task: &mut Task,
    workflow: &Workflow,
    token: &CancellationToken,
    out: &JournalWriter,
  ) {
    let Some(last) = workflow.len().checked_sub(1).map(|l| task.step_index.min(l)) else {
      return;
    };

    info!(task_id = %task.id, steps = last + 1, "rollback_started");

    for index in (0..=last).rev() {
      let name = &workflow.steps[index];
      let Some(step) = self.registry.get(name) else {
        warn!(task_id = %task.id, step = %name, "rollback_step_missing");
        continue;
      };

      journal_line(out, &format!("<== rollback {name}")).await;
      if let Err(e) = step.rollback(token, out, &mut task.config).await {
        warn!(
          task_id = %task.id,
          step = %name,
          error = %e,
          "rollback_step_failed"
        );
        journal_line(out, &format!("<== rollback {name} failed: {e}")).await;
      }
    }

    info!(task_id = %task.id, "rollback_finished");
  }

  async fn suspend_or_cancel(
    &self,
    mut task: Task,
    step: &str,
    cancel: &CancellationToken,
    out: &JournalWriter,
  ) -> Result<Config, RuntimeError> {
    if self.shutdown.is_cancelled() && !cancel.is_cancelled() {
      task.status = TaskStatus::Running;
      task.touch();
      self.repository.put(&task).await?;

      info!(
        task_id = %task.id,
        step = %step,
        step_index = task.step_index,
        "task_suspended"
      );
      journal_line(out, &format!("==> suspended at {step}")).await;
    } else {
      task.status = TaskStatus::Error;
      task.error = Some(TaskFailure::from_step(step, &StepError::Cancelled));
      task.touch();
      self.repository.put(&task).await?;

      warn!(task_id = %task.id, step = %step, "task_cancelled");
      journal_line(out, &format!("==> cancelled at {step}")).await;
    }

    Err(RuntimeError::Cancelled { task_id: task.id })
  }
}

async fn journal_line(out: &JournalWriter, line: &str) {
  if let Err(e) = out.line(line).await {
    warn!(journal = %out.uri(), error = %e, "journal_write_failed");
  }
}
