//! Keel Store
//!
//! Task records are checkpointed into a key-value store under
//! `<prefix>/tasks/<task-id>`. The [`KvStore`] trait is the only thing the
//! runtime needs from a backend: linearizable single-key reads and writes
//! plus prefix listing.
//!
//! Backends:
//! - [`MemoryKvStore`] for tests and in-process use
//! - [`SqliteKvStore`] for a single-node deployment

mod memory;
mod repository;
mod sqlite;
mod task;

pub use memory::MemoryKvStore;
pub use repository::TaskRepository;
pub use sqlite::SqliteKvStore;
pub use task::{Task, TaskFailure, TaskStatus};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration failed: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  /// A stored record could not be encoded or decoded.
  #[error("corrupted record '{key}': {source}")]
  Codec {
    key: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Minimal key-value contract.
#[async_trait]
pub trait KvStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

  /// Insert or overwrite.
  async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

  /// Returns whether the key existed.
  async fn delete(&self, key: &str) -> Result<bool, StoreError>;

  /// All entries whose key starts with `prefix`, ordered by key.
  async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}
