//! Bounded remote calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, SyncError};

/// How a single remote call is bounded and retried.
///
/// The default makes exactly one attempt with a 30 second cutoff: a timeout
/// counts as a failure like any other and is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  /// Pause before attempt `n + 1` is `backoff * n`
  pub backoff: Duration,
  /// Hard cutoff for each attempt
  pub timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 1,
      backoff: Duration::ZERO,
      timeout: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// Run `op` under this policy.
  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let attempts = self.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      let result = match tokio::time::timeout(self.timeout, op()).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::RemoteTimeout(self.timeout)),
      };

      match result {
        Ok(value) => return Ok(value),
        Err(e) if attempt < attempts && is_transient(&e) => {
          warn!(attempt, error = %e, "remote call failed, retrying");
          tokio::time::sleep(self.backoff * attempt).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

fn is_transient(err: &SyncError) -> bool {
  matches!(err, SyncError::RemoteTimeout(_) | SyncError::RemoteRejected(_))
}
