use std::sync::Arc;

use crate::{KvStore, StoreError, Task};

/// Task records over a [`KvStore`], keyed `<prefix>/tasks/<task-id>`.
#[derive(Clone)]
pub struct TaskRepository {
  kv: Arc<dyn KvStore>,
  prefix: String,
}

impl TaskRepository {
  pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
    Self {
      kv,
      prefix: prefix.into().trim_end_matches('/').to_string(),
    }
  }

  fn tasks_prefix(&self) -> String {
    format!("{}/tasks/", self.prefix)
  }

  pub fn key(&self, id: &str) -> String {
    format!("{}{id}", self.tasks_prefix())
  }

  /// Write the full record, replacing any previous checkpoint.
  pub async fn put(&self, task: &Task) -> Result<(), StoreError> {
    let key = self.key(&task.id);
    let value = serde_json::to_vec(task).map_err(|source| StoreError::Codec {
      key: key.clone(),
      source,
    })?;
    self.kv.put(&key, value).await
  }

  pub async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
    let key = self.key(id);
    match self.kv.get(&key).await? {
      Some(bytes) => decode(&key, &bytes).map(Some),
      None => Ok(None),
    }
  }

  /// Every task, ordered by id.
  pub async fn list(&self) -> Result<Vec<Task>, StoreError> {
    self
      .kv
      .list(&self.tasks_prefix())
      .await?
      .into_iter()
      .map(|(key, bytes)| decode(&key, &bytes))
      .collect()
  }

  pub async fn list_cluster(&self, cluster_id: &str) -> Result<Vec<Task>, StoreError> {
    let mut tasks = self.list().await?;
    tasks.retain(|t| t.cluster_id == cluster_id);
    Ok(tasks)
  }

  pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
    self.kv.delete(&self.key(id)).await
  }
}

fn decode(key: &str, bytes: &[u8]) -> Result<Task, StoreError> {
  serde_json::from_slice(bytes).map_err(|source| StoreError::Codec {
    key: key.to_string(),
    source,
  })
}

impl std::fmt::Debug for TaskRepository {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskRepository")
      .field("prefix", &self.prefix)
      .finish()
  }
}
