//! Shared test doubles.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::SyncError;
use crate::transport::{Transport, TransportRequest};

/// Install a tracing subscriber writing through the test harness.
///
/// Idempotent; later calls are no-ops. Filtered by `RUST_LOG` so a normal
/// run stays quiet.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

type Outcome = Result<Value, SyncError>;

struct Script {
  /// Outcomes consumed front to back; the last one is sticky.
  outcomes: VecDeque<Outcome>,
  delay: Option<Duration>,
}

/// Scripted transport: per-path outcome queues plus call accounting.
#[derive(Default)]
pub struct FakeTransport {
  scripts: Mutex<HashMap<String, Script>>,
  calls: Mutex<Vec<String>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Always answer `path` with `payload`.
  pub fn respond(&self, path: &str, payload: Value) {
    self.script(path, vec![Ok(payload)], None);
  }

  /// Answer `path` with `payload` after a simulated transport delay.
  pub fn respond_with_delay(&self, path: &str, payload: Value, delay: Duration) {
    self.script(path, vec![Ok(payload)], Some(delay));
  }

  /// Always fail `path` with `error`.
  pub fn fail(&self, path: &str, error: SyncError) {
    self.script(path, vec![Err(error)], None);
  }

  /// Fail once, then answer with `payload` from then on.
  pub fn fail_then_respond(&self, path: &str, error: SyncError, payload: Value) {
    self.script(path, vec![Err(error), Ok(payload)], None);
  }

  fn script(&self, path: &str, outcomes: Vec<Outcome>, delay: Option<Duration>) {
    lock(&self.scripts).insert(
      path.to_string(),
      Script {
        outcomes: outcomes.into(),
        delay,
      },
    );
  }

  pub fn call_count(&self, path: &str) -> usize {
    lock(&self.calls).iter().filter(|p| p == &path).count()
  }

  pub fn total_calls(&self) -> usize {
    lock(&self.calls).len()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn fetch(&self, request: TransportRequest) -> Result<Value, SyncError> {
    lock(&self.calls).push(request.path.clone());

    let (outcome, delay) = {
      let mut scripts = lock(&self.scripts);
      match scripts.get_mut(&request.path) {
        Some(script) => {
          let outcome = if script.outcomes.len() > 1 {
            script.outcomes.pop_front().unwrap_or(Ok(Value::Null))
          } else {
            script.outcomes.front().cloned().unwrap_or(Ok(Value::Null))
          };
          (outcome, script.delay)
        }
        None => (
          Err(SyncError::Validation {
            status: 404,
            message: format!("no script for {}", request.path),
          }),
          None,
        ),
      }
    };

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    outcome
  }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}
