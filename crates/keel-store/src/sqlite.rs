use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::{KvStore, StoreError};

/// SQLite-backed [`KvStore`] with a single `kv` table.
pub struct SqliteKvStore {
  pool: SqlitePool,
}

impl SqliteKvStore {
  /// Create a store over an existing pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database file at `path` and run
  /// migrations.
  pub async fn open(path: &Path) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(&self.pool).await
  }
}

#[async_trait]
impl KvStore for SqliteKvStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let value = sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM kv WHERE key = ?")
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;
    Ok(value)
  }

  async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO kv (key, value, updated_at)
      VALUES (?, ?, ?)
      ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
      "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM kv WHERE key = ?")
      .bind(key)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let rows = sqlx::query_as::<_, (String, Vec<u8>)>(
      r#"
      SELECT key, value
      FROM kv
      WHERE substr(key, 1, ?) = ?
      ORDER BY key ASC
      "#,
    )
    .bind(prefix.chars().count() as i64)
    .bind(prefix)
    .fetch_all(&self.pool)
    .await?;
    Ok(rows)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn open_store(dir: &tempfile::TempDir) -> SqliteKvStore {
    SqliteKvStore::open(&dir.path().join("keel.db"))
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_upsert_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_store(&dir).await;

    kv.put("keel/tasks/1", b"first".to_vec()).await.unwrap();
    kv.put("keel/tasks/1", b"second".to_vec()).await.unwrap();

    assert_eq!(kv.get("keel/tasks/1").await.unwrap(), Some(b"second".to_vec()));
    assert_eq!(kv.get("keel/tasks/2").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_list_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let kv = open_store(&dir).await;

    kv.put("keel/tasks/b", vec![2]).await.unwrap();
    kv.put("keel/tasks/a", vec![1]).await.unwrap();
    kv.put("keel/clusters/c", vec![3]).await.unwrap();

    let listed = kv.list("keel/tasks/").await.unwrap();
    assert_eq!(
      listed,
      vec![
        ("keel/tasks/a".to_string(), vec![1]),
        ("keel/tasks/b".to_string(), vec![2]),
      ]
    );

    assert!(kv.delete("keel/tasks/a").await.unwrap());
    assert!(!kv.delete("keel/tasks/a").await.unwrap());
    assert_eq!(kv.list("keel/tasks/").await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
      let kv = open_store(&dir).await;
      kv.put("k", vec![7]).await.unwrap();
    }
    let kv = open_store(&dir).await;
    assert_eq!(kv.get("k").await.unwrap(), Some(vec![7]));
  }
}
