//! Keel Journal
//!
//! Every task owns an append-only journal: step banners written by the
//! runtime plus the stdout/stderr captured from remote scripts. Journals are
//! addressed by URI (`file://...` or `mem://...`) so the task record can point
//! at one without knowing which backend wrote it.
//!
//! The [`JournalStore`] trait is the backend layer. [`JournalWriter`] is the
//! cloneable sink handed to steps and runners.

mod fs;
mod memory;
mod writer;

pub use fs::FsJournalStore;
pub use memory::MemoryJournalStore;
pub use writer::JournalWriter;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed stream of bytes for journal contents.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for journal operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested journal was not found.
  #[error("journal not found: {0}")]
  NotFound(String),

  /// The URI does not belong to this store.
  #[error("unsupported journal uri: {0}")]
  InvalidUri(String),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Journal storage trait.
#[async_trait]
pub trait JournalStore: Send + Sync {
  /// The URI a task with the given id writes its journal to.
  fn uri_for(&self, task_id: &str) -> String;

  /// Open a journal for appending, creating it if needed.
  async fn open(&self, uri: &str) -> Result<JournalWriter, Error>;

  /// Stream the full contents of a journal.
  async fn read(&self, uri: &str) -> Result<ByteStream, Error>;

  /// Delete a journal.
  async fn delete(&self, uri: &str) -> Result<(), Error>;
}

/// Read a whole journal into memory.
pub async fn read_to_end(store: &dyn JournalStore, uri: &str) -> Result<Bytes, Error> {
  let mut stream = store.read(uri).await?;
  let mut buf = BytesMut::new();
  while let Some(chunk) = stream.next().await {
    buf.extend_from_slice(&chunk?);
  }
  Ok(buf.freeze())
}
