//! In-process shell runner.

use std::process::Stdio;

use async_trait::async_trait;
use keel_journal::JournalWriter;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::tail;
use crate::{Command, Runner, RunnerError};

const STDERR_TAIL_BYTES: usize = 4096;
const STDERR_TAIL_LINES: usize = 10;

/// Runs scripts with a local shell (`sh -c` by default).
///
/// The command's host is ignored. The child is killed when cancellation
/// drops the in-flight future.
#[derive(Debug, Clone)]
pub struct LocalRunner {
  shell: String,
}

impl LocalRunner {
  pub fn new() -> Self {
    Self::with_shell("sh")
  }

  /// Use a different shell binary. It must accept `-c <script>`.
  pub fn with_shell(shell: impl Into<String>) -> Self {
    Self {
      shell: shell.into(),
    }
  }
}

impl Default for LocalRunner {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Runner for LocalRunner {
  async fn run(&self, command: Command) -> Result<(), RunnerError> {
    if command.host.is_some() {
      debug!(host = ?command.host, "local runner ignores target host");
    }

    let mut child = tokio::process::Command::new(&self.shell)
      .arg("-c")
      .arg(&command.script)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
      let (out, err, status) = tokio::join!(
        pump(stdout, &command.stdout),
        pump(stderr, &command.stderr),
        child.wait()
      );
      out?;
      let err_tail = err?;
      let status = status?;

      if status.success() {
        Ok(())
      } else {
        let exit_code = status.code().unwrap_or(-1);
        warn!(exit_code, "script failed");
        Err(RunnerError::Exit {
          exit_code,
          stderr_tail: tail(&err_tail, STDERR_TAIL_LINES),
          category: None,
        })
      }
    };

    tokio::select! {
      biased;
      _ = command.cancel.cancelled() => Err(RunnerError::Cancelled),
      result = run => result,
    }
  }
}

/// Copy a child stream into a journal, keeping the last few KiB.
///
/// The stream is drained to the end even once the journal stops accepting
/// writes, so the child never blocks on a full pipe.
async fn pump(
  reader: Option<impl AsyncRead + Unpin>,
  sink: &JournalWriter,
) -> Result<Vec<u8>, RunnerError> {
  let mut kept = Vec::new();
  let Some(mut reader) = reader else {
    return Ok(kept);
  };

  let mut journaling = true;
  let mut buf = [0u8; 8192];
  loop {
    let n = reader.read(&mut buf).await?;
    if n == 0 {
      break;
    }
    if journaling {
      if let Err(e) = sink.write(&buf[..n]).await {
        warn!(uri = %sink.uri(), error = %e, "journal_write_failed");
        journaling = false;
      }
    }
    kept.extend_from_slice(&buf[..n]);
    if kept.len() > STDERR_TAIL_BYTES {
      let excess = kept.len() - STDERR_TAIL_BYTES;
      kept.drain(..excess);
    }
  }

  Ok(kept)
}
