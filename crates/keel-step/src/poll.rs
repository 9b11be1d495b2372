use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::StepError;

/// Bounds for a poll loop waiting on a cloud resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
  pub initial_interval: Duration,
  pub max_interval: Duration,
  /// Overall deadline, measured from the first check.
  pub deadline: Duration,
}

impl Default for PollPolicy {
  fn default() -> Self {
    Self {
      initial_interval: Duration::from_secs(1),
      max_interval: Duration::from_secs(15),
      deadline: Duration::from_secs(10 * 60),
    }
  }
}

impl PollPolicy {
  /// Fixed interval polling, mostly for tests.
  pub fn fixed(interval: Duration, deadline: Duration) -> Self {
    Self {
      initial_interval: interval,
      max_interval: interval,
      deadline,
    }
  }

  fn backoff(&self) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
      current_interval: self.initial_interval,
      initial_interval: self.initial_interval,
      randomization_factor: 0.0,
      multiplier: 2.0,
      max_interval: self.max_interval,
      max_elapsed_time: Some(self.deadline),
      ..ExponentialBackoff::default()
    };
    backoff.reset();
    backoff
  }
}

/// Call `check` until it yields `Some`, sleeping with exponential backoff in
/// between.
///
/// Probe errors are returned as-is. Running past the policy deadline yields
/// [`StepError::DeadlineExceeded`]; cancellation during a sleep returns
/// [`StepError::Cancelled`] immediately.
pub async fn poll_until<T, F, Fut>(
  operation: &str,
  policy: &PollPolicy,
  cancel: &CancellationToken,
  mut check: F,
) -> Result<T, StepError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<Option<T>, StepError>>,
{
  let mut backoff = policy.backoff();
  let mut attempt = 0u32;

  loop {
    if cancel.is_cancelled() {
      return Err(StepError::Cancelled);
    }

    attempt += 1;
    if let Some(value) = check().await? {
      return Ok(value);
    }

    let Some(wait) = backoff.next_backoff() else {
      return Err(StepError::DeadlineExceeded {
        operation: operation.to_string(),
        after: policy.deadline,
      });
    };
    debug!(operation, attempt, wait_ms = wait.as_millis() as u64, "poll_pending");

    tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(StepError::Cancelled),
      _ = tokio::time::sleep(wait) => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;

  #[tokio::test]
  async fn test_returns_first_ready_value() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = PollPolicy::fixed(Duration::from_millis(1), Duration::from_secs(5));

    let check_calls = calls.clone();
    let value = poll_until("wait", &policy, &CancellationToken::new(), move || {
      let n = check_calls.fetch_add(1, Ordering::SeqCst);
      async move { Ok((n >= 2).then_some(n)) }
    })
    .await
    .unwrap();

    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_deadline_exceeded() {
    let policy = PollPolicy::fixed(Duration::from_millis(5), Duration::from_millis(30));

    let err = poll_until::<(), _, _>("instance-running", &policy, &CancellationToken::new(), || {
      async { Ok(None) }
    })
    .await
    .unwrap_err();

    assert_eq!(
      err,
      StepError::DeadlineExceeded {
        operation: "instance-running".to_string(),
        after: Duration::from_millis(30),
      }
    );
  }

  #[tokio::test]
  async fn test_cancel_interrupts_sleep() {
    let policy = PollPolicy::fixed(Duration::from_secs(60), Duration::from_secs(600));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = poll_until::<(), _, _>("public-ip", &policy, &cancel, || async { Ok(None) })
      .await
      .unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_check_error_propagates() {
    let policy = PollPolicy::default();
    let err = poll_until::<(), _, _>("describe", &policy, &CancellationToken::new(), || async {
      Err(StepError::Authorization {
        message: "expired token".to_string(),
      })
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), crate::ErrorKind::Authorization);
  }
}
