//! Canonical profile shapes, independent of any source's wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SyncError;

/// The canonical field set a single source can contribute.
///
/// Field groups carry different merge precedence:
/// roles are identity fields, street/city/postal_code/country are
/// address fields, bio/links/avatar_url are free-form fields. Everything
/// else follows the default last-non-empty rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFragment {
  pub roles: Option<Vec<String>>,
  pub first_name: Option<String>,
  pub last_name: Option<String>,
  pub email: Option<String>,
  pub phone: Option<String>,
  pub street: Option<String>,
  pub city: Option<String>,
  pub postal_code: Option<String>,
  pub country: Option<String>,
  pub bio: Option<String>,
  pub links: Option<Vec<String>>,
  pub avatar_url: Option<String>,
}

impl CanonicalFragment {
  pub fn is_empty(&self) -> bool {
    self == &CanonicalFragment::default()
  }
}

/// The outcome of fetching one declared source during a consolidation cycle.
/// Transient; never persisted.
#[derive(Debug, Clone)]
pub struct SourceRecord {
  pub source_id: String,
  pub fragment: CanonicalFragment,
  pub fetched_at: DateTime<Utc>,
  pub ok: bool,
  pub error: Option<SyncError>,
}

impl SourceRecord {
  pub fn succeeded(source_id: &str, fragment: CanonicalFragment, fetched_at: DateTime<Utc>) -> Self {
    Self {
      source_id: source_id.to_string(),
      fragment,
      fetched_at,
      ok: true,
      error: None,
    }
  }

  pub fn failed(source_id: &str, error: SyncError, fetched_at: DateTime<Utc>) -> Self {
    Self {
      source_id: source_id.to_string(),
      fragment: CanonicalFragment::default(),
      fetched_at,
      ok: false,
      error: Some(error),
    }
  }
}

/// The durable, subscriber-visible consolidated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedProfile {
  pub fields: CanonicalFragment,
  /// Which source contributed each populated field.
  pub provenance: BTreeMap<String, String>,
  pub merged_at: DateTime<Utc>,
  /// True iff at least one declared source failed in the producing cycle.
  pub degraded: bool,
}
