use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::{KvStore, StoreError};

/// In-memory [`KvStore`]. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
  entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn with<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> R) -> R {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut entries)
  }
}

#[async_trait]
impl KvStore for MemoryKvStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(self.with(|entries| entries.get(key).cloned()))
  }

  async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
    self.with(|entries| entries.insert(key.to_string(), value));
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<bool, StoreError> {
    Ok(self.with(|entries| entries.remove(key).is_some()))
  }

  async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    Ok(self.with(|entries| {
      entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
    }))
  }
}
