//! edusync — client-side data synchronization layer.
//!
//! Sits between an educational-platform front end and its REST backends:
//! a TTL response cache with per-endpoint policies, an in-flight request
//! coordinator that deduplicates identical calls, a retry executor for
//! transient failures, and a multi-source profile aggregator that merges
//! partially overlapping records into one canonical profile, persists it,
//! and republishes it to subscribers.
//!
//! Everything is constructed explicitly and injected (no ambient globals):
//!
//! ```no_run
//! use std::sync::Arc;
//! use edusync::{ApiClient, HttpTransport, SourceAggregator, StaticSession, SyncConfig, SystemClock};
//! use edusync::profile::SqliteStore;
//!
//! # fn main() -> Result<(), edusync::SyncError> {
//! let config = SyncConfig::load(None)?;
//! let transport = Arc::new(HttpTransport::new("https://api.example.edu/", None)?);
//! let session = Arc::new(StaticSession("user-42".into()));
//! let clock = Arc::new(SystemClock);
//!
//! let client = ApiClient::new(transport, session.clone(), clock.clone(), &config);
//! let aggregator = SourceAggregator::new(
//!   client.clone(),
//!   session,
//!   clock,
//!   Arc::new(SqliteStore::open()?),
//!   &config,
//! );
//! # let _ = aggregator;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod profile;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use cache::{CachePolicy, RequestCache};
pub use client::ApiClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SourceSpec, SyncConfig};
pub use coordinator::RequestCoordinator;
pub use error::SyncError;
pub use profile::{
  CanonicalFragment, ConsolidateOptions, ConsolidatedProfile, SourceAggregator, Subscription,
};
pub use retry::RetryExecutor;
pub use transport::{HttpTransport, Method, SessionIdentity, StaticSession, Transport};
