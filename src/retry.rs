//! Retry-with-backoff executor for transient transport failures.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::SyncError;

/// Executes an operation up to `max_retries + 1` times.
///
/// Only retryable failures (see [`SyncError::is_retryable`]) are attempted
/// again; auth and validation errors abort immediately. The delay before
/// attempt `n` is `base_delay * 2^(n-1)`. On exhaustion the last error is
/// returned unchanged.
///
/// Callers are responsible for only routing idempotent operations through
/// the executor; write verbs do not use it by default.
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
  max_retries: u32,
  base_delay: Duration,
}

impl RetryExecutor {
  pub fn new(max_retries: u32, base_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay,
    }
  }

  pub fn from_config(config: &SyncConfig) -> Self {
    Self::new(config.max_retries, config.retry_base())
  }

  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let mut attempt = 0u32;

    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_retryable() && attempt < self.max_retries => {
          let delay = self.base_delay * 2u32.saturating_pow(attempt);
          debug!(attempt, ?delay, error = %err, "transient failure, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
