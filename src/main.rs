use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_config::{Config, NodeEvents};
use keel_journal::{FsJournalStore, JournalStore, read_to_end};
use keel_provisioner::{ClusterProvisioner, ClusterSpec, ProvisionerConfig};
use keel_runner::{LocalRunner, Runner, ScriptedRunner};
use keel_runtime::{TaskRuntime, provisioned_clusters};
use keel_step::{PollPolicy, StepRegistry};
use keel_steps::{Clouds, SimulatedCloud, register_all};
use keel_store::{SqliteKvStore, TaskRepository};
use keel_workflow::WorkflowCatalog;

/// Keel - Kubernetes cluster provisioning as resumable workflows
#[derive(Parser)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.keel)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Prefix for task keys in the store
  #[arg(long, global = true, default_value = "keel")]
  key_prefix: String,

  /// Maximum number of node tasks running at once
  #[arg(long, global = true, default_value_t = 4)]
  fan_out: usize,

  /// Initial interval for cloud poll loops, in milliseconds
  #[arg(long, global = true)]
  poll_interval_ms: Option<u64>,

  /// Run node scripts with the local shell instead of recording them
  #[arg(long, global = true)]
  local_shell: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Provision a cluster from a JSON cluster spec
  Provision {
    /// Path to the cluster spec
    spec_file: PathBuf,
  },

  /// Delete a cluster's nodes and fabric
  Delete {
    /// Cluster id, or path to a saved cluster config
    cluster: String,
  },

  /// Resume tasks a previous run left running or queued
  Resume {
    /// Only resume the tasks of this cluster
    #[arg(long)]
    cluster: Option<String>,
  },

  /// Inspect persisted tasks
  Tasks {
    #[command(subcommand)]
    target: TasksTarget,
  },
}

#[derive(Subcommand)]
enum TasksTarget {
  /// List persisted tasks
  List,

  /// Print a task's record and journal
  Show {
    /// The task id
    task_id: String,
  },
}

fn main() -> Result<()> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir.clone() {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".keel"),
  };

  let Some(command) = cli.command.as_ref() else {
    println!("keel - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let app = App::open(&cli, data_dir).await?;
    match command {
      Commands::Provision { spec_file } => app.provision(spec_file).await,
      Commands::Delete { cluster } => app.delete(cluster).await,
      Commands::Resume { cluster } => app.resume(cluster.as_deref()).await,
      Commands::Tasks { target } => match target {
        TasksTarget::List => app.list_tasks().await,
        TasksTarget::Show { task_id } => app.show_task(task_id).await,
      },
    }
  })
}

struct App {
  data_dir: PathBuf,
  runtime: Arc<TaskRuntime>,
  journals: Arc<FsJournalStore>,
  provisioner: ClusterProvisioner,
  shutdown: CancellationToken,
}

impl App {
  async fn open(cli: &Cli, data_dir: PathBuf) -> Result<Self> {
    tokio::fs::create_dir_all(&data_dir)
      .await
      .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let db_path = data_dir.join("keel.db");
    let kv = SqliteKvStore::open(&db_path)
      .await
      .with_context(|| format!("failed to open task store: {}", db_path.display()))?;
    let journals = Arc::new(FsJournalStore::new(data_dir.join("journals")));

    let mut poll = PollPolicy::default();
    if let Some(ms) = cli.poll_interval_ms {
      poll.initial_interval = Duration::from_millis(ms);
      poll.max_interval = poll.max_interval.max(poll.initial_interval);
    }
    // No SDK client is linked in; every run talks to a fresh in-memory cloud.
    let clouds = Clouds::simulated(&SimulatedCloud::new()).with_poll_policy(poll);

    let mut registry = StepRegistry::new();
    register_all(&mut registry, &clouds);

    let runner: Arc<dyn Runner> = if cli.local_shell {
      Arc::new(LocalRunner::new())
    } else {
      Arc::new(ScriptedRunner::new())
    };

    let shutdown = CancellationToken::new();
    let runtime = Arc::new(
      TaskRuntime::new(
        Arc::new(registry),
        Arc::new(WorkflowCatalog::standard()),
        TaskRepository::new(Arc::new(kv), cli.key_prefix.clone()),
        journals.clone(),
      )
      .with_runner(runner)
      .with_shutdown(shutdown.clone()),
    );

    {
      let shutdown = shutdown.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          warn!("shutdown_requested");
          shutdown.cancel();
        }
      });
    }

    let provisioner = ClusterProvisioner::new(runtime.clone()).with_config(ProvisionerConfig {
      fan_out: cli.fan_out,
    });

    Ok(Self {
      data_dir,
      runtime,
      journals,
      provisioner,
      shutdown,
    })
  }

  fn cluster_path(&self, cluster_id: &str) -> PathBuf {
    self.data_dir.join("clusters").join(format!("{cluster_id}.json"))
  }

  async fn save_config(&self, cfg: &Config) -> Result<PathBuf> {
    let path = self.cluster_path(&cfg.cluster_id);
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, serde_json::to_vec_pretty(cfg)?)
      .await
      .with_context(|| format!("failed to write cluster config: {}", path.display()))?;
    Ok(path)
  }

  async fn provision(&self, spec_file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(spec_file)
      .await
      .with_context(|| format!("failed to read cluster spec: {}", spec_file.display()))?;
    let spec: ClusterSpec = serde_json::from_str(&content)
      .with_context(|| format!("failed to parse cluster spec: {}", spec_file.display()))?;

    eprintln!(
      "Provisioning cluster '{}' on {} ({} masters, {} workers)",
      spec.name,
      spec.provider,
      spec.masters.len(),
      spec.workers.len()
    );

    let outcome = self
      .provisioner
      .provision(&spec, &CancellationToken::new())
      .await
      .context("cluster provisioning failed")?;

    let path = self.save_config(&outcome.config).await?;
    eprintln!("Saved cluster config to {}", path.display());
    for failure in &outcome.failures {
      eprintln!(
        "Node {} failed ({}): {}",
        failure.name, failure.kind, failure.message
      );
    }

    println!("{}", serde_json::to_string_pretty(&outcome.cluster)?);
    if !outcome.is_healthy() {
      bail!("{} node(s) failed to join", outcome.failures.len());
    }
    Ok(())
  }

  async fn delete(&self, cluster: &str) -> Result<()> {
    let path = if Path::new(cluster).is_file() {
      PathBuf::from(cluster)
    } else {
      self.cluster_path(cluster)
    };
    let content = tokio::fs::read_to_string(&path)
      .await
      .with_context(|| format!("failed to read cluster config: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&content)
      .with_context(|| format!("failed to parse cluster config: {}", path.display()))?;

    eprintln!(
      "Deleting cluster {} ({} nodes)",
      cfg.cluster_id,
      cfg.all_nodes().len()
    );

    let cfg = self
      .provisioner
      .delete(cfg, &CancellationToken::new())
      .await
      .context("cluster deletion failed")?;

    let saved = self.cluster_path(&cfg.cluster_id);
    if tokio::fs::try_exists(&saved).await.unwrap_or(false) {
      tokio::fs::remove_file(&saved)
        .await
        .with_context(|| format!("failed to remove cluster config: {}", saved.display()))?;
    }
    eprintln!("Deleted cluster {}", cfg.cluster_id);
    Ok(())
  }

  async fn resume(&self, cluster: Option<&str>) -> Result<()> {
    let events = NodeEvents::disconnected();
    let outcomes = match cluster {
      Some(cluster_id) => self.runtime.resume_cluster(cluster_id, events, &self.shutdown).await,
      None => self.runtime.resume_all(events, &self.shutdown).await,
    }
    .context("failed to resume tasks")?;

    if outcomes.is_empty() {
      eprintln!("Nothing to resume");
      return Ok(());
    }

    let mut failed = 0;
    for outcome in &outcomes {
      match &outcome.result {
        Ok(_) => {
          eprintln!(
            "Task {} ({}) finished for cluster {}",
            outcome.task_id, outcome.workflow, outcome.cluster_id
          );
        }
        Err(e) => {
          failed += 1;
          eprintln!(
            "Task {} ({}) failed for cluster {}: {e}",
            outcome.task_id, outcome.workflow, outcome.cluster_id
          );
        }
      }
    }
    info!(resumed = outcomes.len(), failed, "resume_finished");

    for cfg in provisioned_clusters(&outcomes) {
      let path = self.save_config(&cfg).await?;
      eprintln!("Saved cluster config to {}", path.display());
    }

    if failed > 0 {
      bail!("{failed} of {} resumed task(s) failed", outcomes.len());
    }
    Ok(())
  }

  async fn list_tasks(&self) -> Result<()> {
    let mut tasks = self
      .runtime
      .repository()
      .list()
      .await
      .context("failed to list tasks")?;
    tasks.sort_by_key(|t| t.created_at);

    if tasks.is_empty() {
      eprintln!("No tasks");
      return Ok(());
    }
    for task in tasks {
      let error = task
        .error
        .as_ref()
        .map(|e| format!(" [{}] {}", e.kind, e.message))
        .unwrap_or_default();
      println!(
        "{}  {:<16} {:<10} cluster={} step={}{}",
        task.id,
        task.workflow.as_str(),
        task.status.as_str(),
        task.cluster_id,
        task.step_index,
        error
      );
    }
    Ok(())
  }

  async fn show_task(&self, task_id: &str) -> Result<()> {
    // Finished tasks are removed from the store but keep their journal.
    let uri = match self
      .runtime
      .repository()
      .get(task_id)
      .await
      .context("failed to load task")?
    {
      Some(task) => {
        println!("{}", serde_json::to_string_pretty(&task)?);
        task.journal_uri
      }
      None => self.journals.uri_for(task_id),
    };

    let journal = read_to_end(self.journals.as_ref(), &uri)
      .await
      .with_context(|| format!("failed to read journal: {uri}"))?;
    print!("{}", String::from_utf8_lossy(&journal));
    Ok(())
  }
}
