use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;

use crate::{ByteStream, Error, JournalStore, JournalWriter};

const SCHEME: &str = "mem://";

type Buffer = Arc<Mutex<Vec<u8>>>;

/// In-memory journal store.
///
/// Suitable for tests and short-lived processes.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournalStore {
  journals: Arc<Mutex<HashMap<String, Buffer>>>,
}

impl MemoryJournalStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Contents of a journal as UTF-8 text (lossy).
  pub fn contents(&self, uri: &str) -> Option<String> {
    let journals = self.journals.lock().unwrap_or_else(PoisonError::into_inner);
    journals.get(uri).map(|buf| {
      let buf = buf.lock().unwrap_or_else(PoisonError::into_inner);
      String::from_utf8_lossy(&buf).into_owned()
    })
  }

  fn check_uri(uri: &str) -> Result<(), Error> {
    if uri.starts_with(SCHEME) {
      Ok(())
    } else {
      Err(Error::InvalidUri(uri.to_string()))
    }
  }
}

#[async_trait]
impl JournalStore for MemoryJournalStore {
  fn uri_for(&self, task_id: &str) -> String {
    format!("{}{}", SCHEME, task_id)
  }

  async fn open(&self, uri: &str) -> Result<JournalWriter, Error> {
    Self::check_uri(uri)?;
    let buffer = {
      let mut journals = self.journals.lock().unwrap_or_else(PoisonError::into_inner);
      journals.entry(uri.to_string()).or_default().clone()
    };
    Ok(JournalWriter::new(uri, SharedBuffer(buffer)))
  }

  async fn read(&self, uri: &str) -> Result<ByteStream, Error> {
    Self::check_uri(uri)?;
    let bytes = {
      let journals = self.journals.lock().unwrap_or_else(PoisonError::into_inner);
      let buffer = journals
        .get(uri)
        .ok_or_else(|| Error::NotFound(uri.to_string()))?;
      let buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
      Bytes::copy_from_slice(&buffer)
    };
    Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
  }

  async fn delete(&self, uri: &str) -> Result<(), Error> {
    Self::check_uri(uri)?;
    let mut journals = self.journals.lock().unwrap_or_else(PoisonError::into_inner);
    journals
      .remove(uri)
      .map(|_| ())
      .ok_or_else(|| Error::NotFound(uri.to_string()))
  }
}

/// `AsyncWrite` adapter over a shared byte buffer.
struct SharedBuffer(Buffer);

impl AsyncWrite for SharedBuffer {
  fn poll_write(
    self: Pin<&mut Self>,
    _cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    self
      .0
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .extend_from_slice(buf);
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Poll::Ready(Ok(()))
  }
}
