use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio_util::io::ReaderStream;

use crate::{ByteStream, Error, JournalStore, JournalWriter};

const SCHEME: &str = "file://";

/// Filesystem-based journal store.
///
/// Each journal is a file at `{base_path}/{task_id}.log`, opened in append
/// mode so a resumed task keeps writing after what the previous process left.
pub struct FsJournalStore {
  base_path: PathBuf,
}

impl FsJournalStore {
  /// Create a new filesystem store with the given base path.
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  fn uri_to_path(&self, uri: &str) -> Result<PathBuf, Error> {
    uri
      .strip_prefix(SCHEME)
      .map(PathBuf::from)
      .ok_or_else(|| Error::InvalidUri(uri.to_string()))
  }
}

#[async_trait]
impl JournalStore for FsJournalStore {
  fn uri_for(&self, task_id: &str) -> String {
    let path = self.base_path.join(format!("{}.log", task_id));
    format!("{}{}", SCHEME, path.display())
  }

  async fn open(&self, uri: &str) -> Result<JournalWriter, Error> {
    let path = self.uri_to_path(uri)?;

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .await?;

    Ok(JournalWriter::new(uri, file))
  }

  async fn read(&self, uri: &str) -> Result<ByteStream, Error> {
    let path = self.uri_to_path(uri)?;
    let file = File::open(&path).await.map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(uri.to_string())
      } else {
        Error::Io(e)
      }
    })?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }

  async fn delete(&self, uri: &str) -> Result<(), Error> {
    let path = self.uri_to_path(uri)?;
    fs::remove_file(&path).await.map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(uri.to_string())
      } else {
        Error::Io(e)
      }
    })
  }
}
