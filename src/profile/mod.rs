//! Multi-source profile consolidation.
//!
//! Fetches every declared source, normalizes each payload into a canonical
//! fragment, merges fragments by precedence rules, persists a snapshot, and
//! republishes the consolidated record to subscribers.

mod aggregator;
mod merge;
mod normalize;
mod snapshot;
mod types;

pub use aggregator::{ConsolidateOptions, SourceAggregator, Subscription};
pub use merge::{merge, MergeOutcome};
pub use normalize::{normalize, EnvelopeShape};
pub use snapshot::{MemoryStore, SnapshotStore, SqliteStore};
pub use types::{CanonicalFragment, ConsolidatedProfile, SourceRecord};
