//! In-flight request deduplication.
//!
//! Concurrent callers presenting the same key share one underlying execution:
//! the first caller installs a pending entry and spawns the factory, later
//! callers join its watch channel. Settled entries linger for a short grace
//! window so a burst of near-simultaneous calls coalesces, and a hard
//! lifetime bound evicts the slot even when the factory never settles.

use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::transport::Method;

type Outcome<T> = Option<Result<T, SyncError>>;

struct PendingEntry<T> {
  rx: watch::Receiver<Outcome<T>>,
  /// Guards delayed removal: a newer entry under the same key must never be
  /// evicted by a stale cleanup timer.
  generation: u64,
}

struct Inner<T> {
  pending: Mutex<HashMap<String, PendingEntry<T>>>,
  grace: Duration,
  max_lifetime: Duration,
  generation: AtomicU64,
}

pub struct RequestCoordinator<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> RequestCoordinator<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new(grace: Duration, max_lifetime: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        pending: Mutex::new(HashMap::new()),
        grace,
        max_lifetime,
        generation: AtomicU64::new(0),
      }),
    }
  }

  pub fn from_config(config: &SyncConfig) -> Self {
    Self::new(config.pending_grace(), config.pending_max_lifetime())
  }

  /// Join the pending execution for `key`, or start one via `factory`.
  ///
  /// For N concurrent callers within the pending window the factory runs
  /// exactly once and all N observe the identical outcome, errors included.
  /// A caller that stops awaiting does not cancel the shared execution.
  pub async fn run_or_join<F, Fut>(&self, key: &str, factory: F) -> Result<T, SyncError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    let mut rx = {
      // Check-for-entry and create-entry form one critical section so two
      // racing callers cannot both spawn the factory.
      let mut pending = lock(&self.inner.pending);

      if let Some(entry) = pending.get(key) {
        debug!(key, "joining in-flight request");
        entry.rx.clone()
      } else {
        let (tx, rx) = watch::channel(None);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        pending.insert(
          key.to_string(),
          PendingEntry {
            rx: rx.clone(),
            generation,
          },
        );

        let fut = factory();
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
          // The send and the delayed eviction below must run no matter how
          // the factory ends, so a panic is caught and settled as an error
          // rather than unwinding past them and leaving the slot occupied.
          let guarded = AssertUnwindSafe(fut).catch_unwind();
          let result = match tokio::time::timeout(inner.max_lifetime, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(SyncError::Cancelled(format!(
              "pending request '{}' panicked before settling",
              key
            ))),
            Err(_) => Err(SyncError::Timeout(format!(
              "pending request '{}' exceeded its slot lifetime",
              key
            ))),
          };
          // Waiters may have gone away; a closed channel is fine.
          let _ = tx.send(Some(result));

          // Keep the settled entry joinable through the grace window, then
          // evict it unless a newer generation reoccupied the key.
          tokio::time::sleep(inner.grace).await;
          let mut pending = lock(&inner.pending);
          if pending.get(&key).map(|e| e.generation) == Some(generation) {
            pending.remove(&key);
          }
        });

        rx
      }
    };

    let outcome = rx
      .wait_for(|value| value.is_some())
      .await
      .map_err(|_| {
        SyncError::Cancelled(format!("in-flight request '{}' dropped before settling", key))
      })?
      .clone();

    match outcome {
      Some(result) => result,
      None => Err(SyncError::Cancelled(format!(
        "in-flight request '{}' settled without a result",
        key
      ))),
    }
  }

  /// Number of currently occupied pending slots.
  pub fn pending_len(&self) -> usize {
    lock(&self.inner.pending).len()
  }
}

/// Stable fixed-length dedup key for a logical request.
///
/// Hashed (unlike cache keys) because dedup never needs substring matching
/// and query strings can get arbitrarily long.
pub fn dedup_key(session: &str, method: Method, path: &str, params: &[(&str, &str)]) -> String {
  let mut sorted: Vec<(&str, &str)> = params.to_vec();
  sorted.sort();

  let query = sorted
    .iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect::<Vec<_>>()
    .join("&");

  let mut hasher = Sha256::new();
  hasher.update(format!("{}:{}:{}?{}", session, method, path, query).as_bytes());
  hex::encode(hasher.finalize())
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicU32};

  fn coordinator<T: Clone + Send + Sync + 'static>() -> RequestCoordinator<T> {
    RequestCoordinator::new(Duration::from_millis(400), Duration::from_secs(10))
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_callers_share_one_execution() {
    let coord: RequestCoordinator<u32> = coordinator();
    let calls = Arc::new(AtomicU32::new(0));

    let run = |value: u32| {
      let coord = coord.clone();
      let calls = calls.clone();
      async move {
        coord
          .run_or_join("profile", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(value)
          })
          .await
      }
    };

    let (a, b, c) = tokio::join!(run(1), run(2), run(3));

    // the first registrant's factory ran; everyone saw its outcome
    assert_eq!(a, Ok(1));
    assert_eq!(b, Ok(1));
    assert_eq!(c, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_errors_fan_out_to_all_joined_callers() {
    let coord: RequestCoordinator<u32> = coordinator();

    let run = || {
      let coord = coord.clone();
      async move {
        coord
          .run_or_join("boom", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(SyncError::Validation {
              status: 422,
              message: "rejected".into(),
            })
          })
          .await
      }
    };

    let (a, b) = tokio::join!(run(), run());
    assert_eq!(a, b);
    assert!(matches!(a, Err(SyncError::Validation { status: 422, .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn test_grace_window_coalesces_bursts() {
    let coord: RequestCoordinator<u32> = coordinator();

    let first = coord.run_or_join("k", || async { Ok(1) }).await;
    assert_eq!(first, Ok(1));

    // still within the grace window: joins the settled entry
    let second = coord.run_or_join("k", || async { Ok(2) }).await;
    assert_eq!(second, Ok(1));

    // past the grace window: a fresh execution
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(coord.pending_len(), 0);
    let third = coord.run_or_join("k", || async { Ok(3) }).await;
    assert_eq!(third, Ok(3));
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_factory_is_forcibly_expired() {
    let coord: RequestCoordinator<u32> = coordinator();

    let result = coord
      .run_or_join("stuck", || async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(1)
      })
      .await;

    assert!(matches!(result, Err(SyncError::Timeout(_))));

    // the slot is freed for future callers
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(coord.pending_len(), 0);
    let retry = coord.run_or_join("stuck", || async { Ok(7) }).await;
    assert_eq!(retry, Ok(7));
  }

  #[tokio::test(start_paused = true)]
  async fn test_panicking_factory_frees_the_slot() {
    let coord: RequestCoordinator<u32> = coordinator();

    let result = coord
      .run_or_join("crash", || async { panic!("scripted failure") })
      .await;
    assert!(matches!(result, Err(SyncError::Cancelled(_))));

    // the slot is evicted like any other settled entry
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(coord.pending_len(), 0);
    let retry = coord.run_or_join("crash", || async { Ok(9) }).await;
    assert_eq!(retry, Ok(9));
  }

  #[tokio::test(start_paused = true)]
  async fn test_distinct_keys_run_independently() {
    let coord: RequestCoordinator<u32> = coordinator();
    let calls = Arc::new(AtomicU32::new(0));

    let run = |key: &'static str, value: u32| {
      let coord = coord.clone();
      let calls = calls.clone();
      async move {
        coord
          .run_or_join(key, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(value)
          })
          .await
      }
    };

    let (a, b) = tokio::join!(run("left", 1), run("right", 2));
    assert_eq!(a, Ok(1));
    assert_eq!(b, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_waiter_does_not_cancel_execution() {
    let coord: RequestCoordinator<u32> = coordinator();
    let finished = Arc::new(AtomicBool::new(false));

    let waiter = tokio::spawn({
      let coord = coord.clone();
      let finished = finished.clone();
      async move {
        coord
          .run_or_join("shared", move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            finished.store(true, Ordering::SeqCst);
            Ok(1)
          })
          .await
      }
    });

    // let the waiter register its entry, then abandon it
    tokio::task::yield_now().await;
    waiter.abort();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(finished.load(Ordering::SeqCst));
  }

  #[test]
  fn test_dedup_key_is_stable_and_session_scoped() {
    let a = dedup_key("s1", Method::Get, "/profile", &[("v", "2"), ("q", "x")]);
    let b = dedup_key("s1", Method::Get, "/profile", &[("q", "x"), ("v", "2")]);
    let c = dedup_key("s2", Method::Get, "/profile", &[("q", "x"), ("v", "2")]);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 64);
  }
}
