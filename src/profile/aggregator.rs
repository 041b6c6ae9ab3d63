//! The consolidation engine.
//!
//! One cycle: fetch every declared source in order (through the cached,
//! deduplicated, retried client), normalize each payload, merge by
//! precedence, persist a snapshot, notify subscribers. Individual source
//! failures degrade the result; only a total failure with no usable
//! snapshot surfaces an error.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

use crate::client::ApiClient;
use crate::clock::Clock;
use crate::config::{SourceSpec, SyncConfig};
use crate::coordinator::RequestCoordinator;
use crate::error::SyncError;
use crate::transport::SessionIdentity;

use super::merge::merge;
use super::normalize::normalize;
use super::snapshot::SnapshotStore;
use super::types::{ConsolidatedProfile, SourceRecord};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidateOptions {
  /// Skip the fresh in-memory profile and every read cache.
  pub force_refresh: bool,
  /// Keep existing free-form values instead of overwriting them.
  pub preserve_current: bool,
}

type SubscriberFn = Arc<dyn Fn(&ConsolidatedProfile) + Send + Sync>;

pub struct SourceAggregator {
  inner: Arc<Inner>,
}

impl Clone for SourceAggregator {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct Inner {
  client: ApiClient,
  session: Arc<dyn SessionIdentity>,
  clock: Arc<dyn Clock>,
  store: Arc<dyn SnapshotStore>,
  sources: Vec<SourceSpec>,
  /// How long a consolidated profile (in memory or snapshotted) stays usable.
  freshness: chrono::Duration,
  current: Mutex<Option<ConsolidatedProfile>>,
  subscribers: Mutex<Vec<(u64, SubscriberFn)>>,
  next_subscriber: AtomicU64,
  coordinator: RequestCoordinator<ConsolidatedProfile>,
}

impl SourceAggregator {
  pub fn new(
    client: ApiClient,
    session: Arc<dyn SessionIdentity>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SnapshotStore>,
    config: &SyncConfig,
  ) -> Self {
    let inner = Arc::new(Inner {
      client,
      session,
      clock,
      store,
      sources: config.sources.clone(),
      freshness: config.default_ttl(),
      current: Mutex::new(None),
      subscribers: Mutex::new(Vec::new()),
      next_subscriber: AtomicU64::new(0),
      coordinator: RequestCoordinator::from_config(config),
    });

    // Crash/restart recovery: adopt the last snapshot when still fresh.
    if let Some(snapshot) = inner.load_snapshot() {
      if inner.clock.now() - snapshot.merged_at <= inner.freshness {
        debug!("restored consolidated profile from snapshot");
        *lock(&inner.current) = Some(snapshot);
      }
    }

    Self { inner }
  }

  /// Return the consolidated profile, consolidating if needed.
  ///
  /// Concurrent callers share one consolidation cycle. With
  /// `force_refresh=false` a fresh in-memory profile is answered with no
  /// I/O at all.
  pub async fn get_consolidated(
    &self,
    options: ConsolidateOptions,
  ) -> Result<ConsolidatedProfile, SyncError> {
    if !options.force_refresh {
      if let Some(profile) = self.inner.fresh_profile() {
        return Ok(profile);
      }
    }

    let key = format!("consolidation:{}", self.inner.session.current_session_id());
    let inner = Arc::clone(&self.inner);
    self
      .inner
      .coordinator
      .run_or_join(&key, move || Inner::run_cycle(inner, options))
      .await
  }

  /// Register a listener for every newly consolidated profile.
  ///
  /// Listeners run synchronously in registration order. Dropping the
  /// returned handle unsubscribes.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&ConsolidatedProfile) + Send + Sync + 'static,
  {
    let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
    lock(&self.inner.subscribers).push((id, Arc::new(callback)));
    Subscription {
      id,
      inner: Arc::downgrade(&self.inner),
    }
  }

  /// Drop the in-memory profile, per-source cached reads, and the persisted
  /// snapshot. Used on logout or identity switch.
  pub fn invalidate(&self) -> Result<(), SyncError> {
    *lock(&self.inner.current) = None;
    for spec in &self.inner.sources {
      self.inner.client.invalidate(&spec.path);
    }
    self.inner.store.remove(&self.inner.snapshot_key())
  }

  /// The current in-memory profile, fresh or not, without triggering I/O.
  pub fn current(&self) -> Option<ConsolidatedProfile> {
    lock(&self.inner.current).clone()
  }
}

impl Inner {
  async fn run_cycle(
    inner: Arc<Inner>,
    options: ConsolidateOptions,
  ) -> Result<ConsolidatedProfile, SyncError> {
    if inner.sources.is_empty() {
      return Err(SyncError::Aggregation("no profile sources declared".into()));
    }

    // Sources are fetched concurrently; `join_all` keeps declaration order
    // in the collected records, which is what the merge precedence needs.
    let use_cache = !options.force_refresh;
    let fetches = inner.sources.iter().map(|spec| {
      let client = inner.client.clone();
      let clock = Arc::clone(&inner.clock);
      async move {
        match client.get(&spec.path, &[], use_cache, None).await {
          Ok(Some(payload)) => {
            SourceRecord::succeeded(&spec.id, normalize(spec.shape, &payload), clock.now())
          }
          Ok(None) => SourceRecord::failed(&spec.id, SyncError::AuthExpired, clock.now()),
          Err(err) => {
            warn!(source = %spec.id, error = %err, "source fetch failed, degrading");
            SourceRecord::failed(&spec.id, err, clock.now())
          }
        }
      }
    });
    let records: Vec<SourceRecord> = futures::future::join_all(fetches).await;

    let degraded = records.iter().any(|r| !r.ok);

    if records.iter().all(|r| !r.ok) {
      // Total failure: the last good snapshot still beats a hard error,
      // as long as it has not aged past the freshness bound.
      if let Some(mut snapshot) = inner.load_snapshot() {
        if inner.clock.now() - snapshot.merged_at <= inner.freshness {
          warn!("all sources failed, serving last good snapshot");
          snapshot.degraded = true;
          return Ok(snapshot);
        }
      }
      return Err(SyncError::Aggregation(
        "all declared sources failed and no usable snapshot exists".into(),
      ));
    }

    let roles_authority = inner
      .sources
      .iter()
      .find(|s| s.roles_authority)
      .map(|s| s.id.clone());
    let prior = lock(&inner.current).as_ref().map(|p| p.fields.clone());
    let outcome = merge(
      &records,
      roles_authority.as_deref(),
      prior.as_ref(),
      options.preserve_current,
    );

    let profile = ConsolidatedProfile {
      fields: outcome.fields,
      provenance: outcome.provenance,
      merged_at: inner.clock.now(),
      degraded,
    };

    *lock(&inner.current) = Some(profile.clone());
    inner.persist_snapshot(&profile);
    inner.notify(&profile);

    debug!(degraded, sources = records.len(), "consolidation cycle complete");
    Ok(profile)
  }

  fn fresh_profile(&self) -> Option<ConsolidatedProfile> {
    let current = lock(&self.current);
    current
      .as_ref()
      .filter(|p| self.clock.now() - p.merged_at <= self.freshness)
      .cloned()
  }

  fn snapshot_key(&self) -> String {
    format!("profile_snapshot:{}", self.session.current_session_id())
  }

  fn load_snapshot(&self) -> Option<ConsolidatedProfile> {
    let value: Value = match self.store.get(&self.snapshot_key()) {
      Ok(Some(value)) => value,
      Ok(None) => return None,
      Err(err) => {
        warn!(error = %err, "failed to read snapshot");
        return None;
      }
    };

    match serde_json::from_value(value) {
      Ok(profile) => Some(profile),
      Err(err) => {
        warn!(error = %err, "discarding unreadable snapshot");
        None
      }
    }
  }

  /// Persistence failures degrade durability, not the current cycle.
  fn persist_snapshot(&self, profile: &ConsolidatedProfile) {
    let value = match serde_json::to_value(profile) {
      Ok(value) => value,
      Err(err) => {
        warn!(error = %err, "failed to serialize snapshot");
        return;
      }
    };
    if let Err(err) = self.store.set(&self.snapshot_key(), &value) {
      warn!(error = %err, "failed to persist snapshot");
    }
  }

  /// Callbacks run synchronously in registration order. The registry is
  /// snapshotted before dispatch so a callback may drop its own
  /// subscription; registrations made mid-dispatch take effect next cycle.
  fn notify(&self, profile: &ConsolidatedProfile) {
    let callbacks: Vec<SubscriberFn> = lock(&self.subscribers)
      .iter()
      .map(|(_, callback)| Arc::clone(callback))
      .collect();
    for callback in callbacks {
      callback(profile);
    }
  }
}

/// Subscription handle; unsubscribes when dropped.
pub struct Subscription {
  id: u64,
  inner: Weak<Inner>,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      lock(&inner.subscribers).retain(|(id, _)| *id != self.id);
    }
  }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}
