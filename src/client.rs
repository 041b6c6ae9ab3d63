//! The request surface exposed to the rest of the application.
//!
//! `ApiClient` composes the cache, the in-flight coordinator, and the retry
//! executor around an injected transport. Reads are cached, deduplicated,
//! and retried; writes go straight through and invalidate the reads they
//! shadow.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{cache_key, CachePolicy, RequestCache};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::coordinator::{dedup_key, RequestCoordinator};
use crate::error::SyncError;
use crate::retry::RetryExecutor;
use crate::transport::{Method, SessionIdentity, Transport, TransportRequest};

#[derive(Clone)]
pub struct ApiClient {
  transport: Arc<dyn Transport>,
  session: Arc<dyn SessionIdentity>,
  cache: Arc<RequestCache>,
  coordinator: RequestCoordinator<Value>,
  retry: RetryExecutor,
}

impl ApiClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionIdentity>,
    clock: Arc<dyn Clock>,
    config: &SyncConfig,
  ) -> Self {
    Self {
      transport,
      session,
      cache: Arc::new(RequestCache::new(CachePolicy::from_config(config), clock)),
      coordinator: RequestCoordinator::from_config(config),
      retry: RetryExecutor::from_config(config),
    }
  }

  /// Cached, deduplicated, retried read.
  ///
  /// Returns `Ok(None)` when the session expired mid-flight (benign sign-out
  /// race); every other failure propagates. `ttl_override` pins the cache
  /// TTL instead of the endpoint's resolved one; never-cache endpoints stay
  /// uncached regardless.
  pub async fn get(
    &self,
    path: &str,
    params: &[(&str, &str)],
    use_cache: bool,
    ttl_override: Option<chrono::Duration>,
  ) -> Result<Option<Value>, SyncError> {
    let session = self.session.current_session_id();
    let key = cache_key(&session, Method::Get, path, params);

    if use_cache {
      if let Some(hit) = self.cache.get(&key) {
        debug!(path, "cache hit");
        return Ok(Some(hit));
      }
    }

    let dedup = dedup_key(&session, Method::Get, path, params);
    let transport = Arc::clone(&self.transport);
    let retry = self.retry;
    let request = TransportRequest::get(path, params);

    let result = self
      .coordinator
      .run_or_join(&dedup, move || async move {
        retry
          .run(|| {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.fetch(request).await }
          })
          .await
      })
      .await;

    match result {
      Ok(payload) => {
        if use_cache {
          match ttl_override {
            Some(ttl) => self.cache.set_override(&key, payload.clone(), path, ttl),
            None => self.cache.set(&key, payload.clone(), path),
          }
        }
        Ok(Some(payload))
      }
      Err(SyncError::AuthExpired) => {
        debug!(path, "auth expired, surfacing absent result");
        Ok(None)
      }
      Err(err) => Err(err),
    }
  }

  pub async fn post(&self, path: &str, body: Value) -> Result<Value, SyncError> {
    self.write(Method::Post, path, Some(body)).await
  }

  pub async fn put(&self, path: &str, body: Value) -> Result<Value, SyncError> {
    self.write(Method::Put, path, Some(body)).await
  }

  pub async fn delete(&self, path: &str) -> Result<Value, SyncError> {
    self.write(Method::Delete, path, None).await
  }

  /// Writes are neither deduplicated nor retried (not idempotent); on
  /// success, cached reads under the resource prefix are dropped.
  async fn write(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> Result<Value, SyncError> {
    let payload = self
      .transport
      .fetch(TransportRequest::write(method, path, body))
      .await?;

    let prefix = resource_prefix(path);
    let removed = self.cache.invalidate_fragment(&prefix);
    debug!(%method, path, prefix = %prefix, removed, "write invalidated cached reads");

    Ok(payload)
  }

  /// Low-level dedup primitive, re-exposed for callers with bespoke keys.
  pub async fn run_or_join<F, Fut>(&self, key: &str, factory: F) -> Result<Value, SyncError>
  where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Value, SyncError>> + Send + 'static,
  {
    self.coordinator.run_or_join(key, factory).await
  }

  /// Drop every cached read whose key contains `fragment`.
  pub fn invalidate(&self, fragment: &str) -> usize {
    self.cache.invalidate_fragment(fragment)
  }

  pub fn invalidate_all(&self) {
    self.cache.clear();
  }

  pub fn cache(&self) -> &RequestCache {
    &self.cache
  }
}

/// The invalidation scope of a write: its first path segment.
/// A write to "/profile/42/links" shadows every read under "/profile".
fn resource_prefix(path: &str) -> String {
  let trimmed = path.trim_start_matches('/');
  match trimmed.split('/').next() {
    Some(first) if !first.is_empty() => format!("/{}", first),
    _ => path.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::testutil::FakeTransport;
  use crate::transport::StaticSession;
  use serde_json::json;

  fn client_with(config: SyncConfig, transport: Arc<FakeTransport>) -> ApiClient {
    crate::testutil::init_tracing();
    ApiClient::new(
      transport,
      Arc::new(StaticSession("session-1".into())),
      Arc::new(ManualClock::default()),
      &config,
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_repeat_get_is_served_from_cache() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond("/profile/42", json!({"id": 42}));
    let client = client_with(SyncConfig::default(), transport.clone());

    let first = client.get("/profile/42", &[], true, None).await.unwrap();
    let second = client.get("/profile/42", &[], true, None).await.unwrap();

    assert_eq!(first, Some(json!({"id": 42})));
    assert_eq!(second, first);
    assert_eq!(transport.call_count("/profile/42"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_never_cache_endpoint_always_refetches() {
    let config = SyncConfig {
      never_cache_endpoints: vec!["/chat".into()],
      pending_grace_ms: 0,
      ..SyncConfig::default()
    };
    let transport = Arc::new(FakeTransport::new());
    transport.respond("/chat/threads", json!([]));
    let client = client_with(config, transport.clone());

    client.get("/chat/threads", &[], true, None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    client.get("/chat/threads", &[], true, None).await.unwrap();

    assert_eq!(transport.call_count("/chat/threads"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_override_cannot_cache_never_cache_endpoint() {
    let config = SyncConfig {
      never_cache_endpoints: vec!["/chat".into()],
      pending_grace_ms: 0,
      ..SyncConfig::default()
    };
    let transport = Arc::new(FakeTransport::new());
    transport.respond("/chat/threads", json!([]));
    let client = client_with(config, transport.clone());

    client
      .get("/chat/threads", &[], true, Some(chrono::Duration::seconds(600)))
      .await
      .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    client.get("/chat/threads", &[], true, None).await.unwrap();

    assert_eq!(transport.call_count("/chat/threads"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_use_cache_false_bypasses_cache() {
    let config = SyncConfig {
      pending_grace_ms: 0,
      ..SyncConfig::default()
    };
    let transport = Arc::new(FakeTransport::new());
    transport.respond("/profile/42", json!({"id": 42}));
    let client = client_with(config, transport.clone());

    client.get("/profile/42", &[], true, None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    client.get("/profile/42", &[], false, None).await.unwrap();

    assert_eq!(transport.call_count("/profile/42"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_invalidates_reads_under_prefix() {
    let config = SyncConfig {
      pending_grace_ms: 0,
      ..SyncConfig::default()
    };
    let transport = Arc::new(FakeTransport::new());
    transport.respond("/profile/42", json!({"bio": "old"}));
    transport.respond("/documents/7", json!({"name": "diploma"}));
    let client = client_with(config, transport.clone());

    client.get("/profile/42", &[], true, None).await.unwrap();
    client.get("/documents/7", &[], true, None).await.unwrap();

    client
      .put("/profile/42", json!({"bio": "new"}))
      .await
      .unwrap();

    // profile read refetches, document read still cached
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    client.get("/profile/42", &[], true, None).await.unwrap();
    client.get("/documents/7", &[], true, None).await.unwrap();

    assert_eq!(transport.call_count("/profile/42"), 3); // get, put, get
    assert_eq!(transport.call_count("/documents/7"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_auth_expired_surfaces_as_absent() {
    let transport = Arc::new(FakeTransport::new());
    transport.fail("/profile/42", SyncError::AuthExpired);
    let client = client_with(SyncConfig::default(), transport.clone());

    let result = client.get("/profile/42", &[], true, None).await;
    assert_eq!(result, Ok(None));
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_error_propagates_untouched() {
    let transport = Arc::new(FakeTransport::new());
    transport.fail(
      "/profile/42",
      SyncError::Validation {
        status: 422,
        message: "bad field".into(),
      },
    );
    let client = client_with(SyncConfig::default(), transport.clone());

    let result = client.get("/profile/42", &[], true, None).await;
    assert_eq!(
      result,
      Err(SyncError::Validation {
        status: 422,
        message: "bad field".into()
      })
    );
    // fatal errors skip the retry loop
    assert_eq!(transport.call_count("/profile/42"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_error_is_retried_then_recovers() {
    let transport = Arc::new(FakeTransport::new());
    transport.fail_then_respond(
      "/formations",
      SyncError::Unreachable("down".into()),
      json!([{"id": 1}]),
    );
    let client = client_with(SyncConfig::default(), transport.clone());

    let result = client.get("/formations", &[], true, None).await.unwrap();
    assert_eq!(result, Some(json!([{"id": 1}])));
    assert_eq!(transport.call_count("/formations"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_gets_share_one_transport_call() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond_with_delay(
      "/formations",
      json!([1, 2]),
      std::time::Duration::from_millis(50),
    );
    let client = client_with(SyncConfig::default(), transport.clone());

    let (a, b) = tokio::join!(
      client.get("/formations", &[], false, None),
      client.get("/formations", &[], false, None),
    );

    assert_eq!(a.unwrap(), Some(json!([1, 2])));
    assert_eq!(b.unwrap(), Some(json!([1, 2])));
    assert_eq!(transport.call_count("/formations"), 1);
  }
}
