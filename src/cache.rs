//! In-memory TTL cache for read results.
//!
//! Keys embed the session identity so entries never leak across an identity
//! switch on a shared client process. Keys stay human-readable (no hashing)
//! because invalidation matches on key substrings ("everything under
//! /profile").

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::transport::Method;

/// A single cached payload.
struct CacheEntry {
  payload: Value,
  stored_at: DateTime<Utc>,
  ttl: Duration,
}

impl CacheEntry {
  fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now - self.stored_at > self.ttl
  }
}

/// Per-endpoint TTL policy.
///
/// Resolution order: never-cache rule, then short-TTL rule, then the default.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  never_cache: Vec<String>,
  short_ttl_endpoints: Vec<String>,
  default_ttl: Duration,
  short_ttl: Duration,
}

impl CachePolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      never_cache: config.never_cache_endpoints.clone(),
      short_ttl_endpoints: config.short_ttl_endpoints.clone(),
      default_ttl: config.default_ttl(),
      short_ttl: config.short_ttl(),
    }
  }

  /// TTL for an endpoint, or None when the endpoint must not be cached.
  pub fn resolve(&self, endpoint: &str) -> Option<Duration> {
    if self.never_cache.iter().any(|p| endpoint.starts_with(p)) {
      return None;
    }
    if self
      .short_ttl_endpoints
      .iter()
      .any(|p| endpoint.starts_with(p))
    {
      return Some(self.short_ttl);
    }
    Some(self.default_ttl)
  }
}

/// TTL-bounded response cache. Mutation is exclusive; no I/O.
pub struct RequestCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  policy: CachePolicy,
  clock: Arc<dyn Clock>,
}

impl RequestCache {
  pub fn new(policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      policy,
      clock,
    }
  }

  /// Return the payload for `key` if present and unexpired.
  ///
  /// Expired entries are dropped on read so the map cannot accumulate dead
  /// weight for keys that keep being asked for.
  pub fn get(&self, key: &str) -> Option<Value> {
    let now = self.clock.now();
    let mut entries = lock(&self.entries);

    match entries.get(key) {
      Some(entry) if !entry.is_expired(now) => Some(entry.payload.clone()),
      Some(_) => {
        entries.remove(key);
        None
      }
      None => None,
    }
  }

  /// Store a payload under the endpoint's resolved TTL policy.
  ///
  /// No-op when the endpoint matches a never-cache rule.
  pub fn set(&self, key: &str, payload: Value, endpoint: &str) {
    if let Some(ttl) = self.policy.resolve(endpoint) {
      self.set_with_ttl(key, payload, ttl);
    }
  }

  /// Store a payload with an explicit TTL instead of the endpoint's
  /// resolved one. Never-cache rules still apply: an override cannot make
  /// an uncacheable endpoint cacheable.
  pub fn set_override(&self, key: &str, payload: Value, endpoint: &str, ttl: Duration) {
    if self.policy.resolve(endpoint).is_some() {
      self.set_with_ttl(key, payload, ttl);
    }
  }

  /// Store a payload with an explicit TTL, bypassing endpoint policy.
  pub fn set_with_ttl(&self, key: &str, payload: Value, ttl: Duration) {
    let entry = CacheEntry {
      payload,
      stored_at: self.clock.now(),
      ttl,
    };
    lock(&self.entries).insert(key.to_string(), entry);
  }

  /// Remove every entry whose key satisfies `matcher`. Returns the count.
  pub fn invalidate<F>(&self, matcher: F) -> usize
  where
    F: Fn(&str) -> bool,
  {
    let mut entries = lock(&self.entries);
    let before = entries.len();
    entries.retain(|key, _| !matcher(key));
    before - entries.len()
  }

  /// Remove every entry whose key contains `fragment` (e.g. "/profile").
  pub fn invalidate_fragment(&self, fragment: &str) -> usize {
    self.invalidate(|key| key.contains(fragment))
  }

  pub fn clear(&self) {
    lock(&self.entries).clear();
  }

  pub fn len(&self) -> usize {
    lock(&self.entries).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Build a readable cache key namespaced by session identity.
///
/// Params are sorted so logically identical requests share one key.
pub fn cache_key(session: &str, method: Method, path: &str, params: &[(&str, &str)]) -> String {
  let mut sorted: Vec<(&str, &str)> = params.to_vec();
  sorted.sort();

  let query = sorted
    .iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect::<Vec<_>>()
    .join("&");

  format!("{}:{}:{}?{}", session, method, path, query)
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    // A poisoned lock only means another thread panicked mid-write; the
    // cache map itself is still structurally sound.
    Err(poisoned) => poisoned.into_inner(),
  }
}
