use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::Error;

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable, append-only handle to a journal.
///
/// Clones share the underlying sink, so a runner can hand one clone to the
/// stdout copier and another to the stderr copier. Every write is flushed.
#[derive(Clone)]
pub struct JournalWriter {
  uri: Arc<str>,
  sink: Arc<Mutex<Sink>>,
}

impl JournalWriter {
  /// Wrap an async writer.
  pub fn new(uri: impl Into<String>, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
    let uri: String = uri.into();
    Self {
      uri: uri.into(),
      sink: Arc::new(Mutex::new(Box::new(sink))),
    }
  }

  /// A writer that drops everything.
  pub fn discard() -> Self {
    Self::new("null://", tokio::io::sink())
  }

  pub fn uri(&self) -> &str {
    &self.uri
  }

  /// Append raw bytes.
  pub async fn write(&self, buf: &[u8]) -> Result<(), Error> {
    let mut sink = self.sink.lock().await;
    sink.write_all(buf).await?;
    sink.flush().await?;
    Ok(())
  }

  /// Append a line of text.
  pub async fn line(&self, line: &str) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    self.write(&buf).await
  }
}

impl fmt::Debug for JournalWriter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JournalWriter").field("uri", &self.uri).finish()
  }
}
