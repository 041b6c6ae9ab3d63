//! Precedence merge of normalized source fragments.
//!
//! Records arrive in source-declaration order. Rules per field group:
//! - roles: the designated authoritative source wins when it returned a
//!   non-empty set; otherwise the first declared source with one.
//! - address fields: last non-empty wins, most-recently-fetched preferred.
//! - free-form fields: later non-null overwrites, unless the caller asked to
//!   preserve current values that already exist.
//! - everything else: last non-empty in declaration order.
//!
//! The merge is deterministic: identical record sets (and prior state)
//! always produce the same outcome.

use std::collections::BTreeMap;

use super::types::{CanonicalFragment, SourceRecord};

/// Provenance label for fields retained from the prior consolidated state.
const CURRENT: &str = "current";

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
  pub fields: CanonicalFragment,
  pub provenance: BTreeMap<String, String>,
}

pub fn merge(
  records: &[SourceRecord],
  roles_authority: Option<&str>,
  prior: Option<&CanonicalFragment>,
  preserve_current: bool,
) -> MergeOutcome {
  let mut fields = CanonicalFragment::default();
  let mut provenance = BTreeMap::new();

  // Default and free-form groups fold in declaration order.
  for record in records {
    let f = &record.fragment;
    let id = &record.source_id;

    assign_string(&mut fields.first_name, &mut provenance, "first_name", id, &f.first_name);
    assign_string(&mut fields.last_name, &mut provenance, "last_name", id, &f.last_name);
    assign_string(&mut fields.email, &mut provenance, "email", id, &f.email);
    assign_string(&mut fields.phone, &mut provenance, "phone", id, &f.phone);

    assign_string(&mut fields.bio, &mut provenance, "bio", id, &f.bio);
    assign_list(&mut fields.links, &mut provenance, "links", id, &f.links);
    assign_string(&mut fields.avatar_url, &mut provenance, "avatar_url", id, &f.avatar_url);
  }

  // Address fields prefer the most recently fetched source; a stable sort
  // keeps declaration order as the tie-breaker.
  let mut by_recency: Vec<&SourceRecord> = records.iter().collect();
  by_recency.sort_by_key(|r| r.fetched_at);
  for record in by_recency {
    let f = &record.fragment;
    let id = &record.source_id;

    assign_string(&mut fields.street, &mut provenance, "street", id, &f.street);
    assign_string(&mut fields.city, &mut provenance, "city", id, &f.city);
    assign_string(&mut fields.postal_code, &mut provenance, "postal_code", id, &f.postal_code);
    assign_string(&mut fields.country, &mut provenance, "country", id, &f.country);
  }

  // Roles: authoritative source when it answered non-empty, else fall back
  // through the remaining sources in declaration order.
  let authoritative = roles_authority.and_then(|authority| {
    records
      .iter()
      .find(|r| r.source_id == authority && r.fragment.roles.is_some())
  });
  let role_source = authoritative.or_else(|| records.iter().find(|r| r.fragment.roles.is_some()));
  if let Some(record) = role_source {
    fields.roles = record.fragment.roles.clone();
    provenance.insert("roles".to_string(), record.source_id.clone());
  }

  // Preserve-current mode: free-form values that already exist are kept.
  if preserve_current {
    if let Some(prior) = prior {
      preserve_string(&mut fields.bio, &mut provenance, "bio", &prior.bio);
      preserve_list(&mut fields.links, &mut provenance, "links", &prior.links);
      preserve_string(&mut fields.avatar_url, &mut provenance, "avatar_url", &prior.avatar_url);
    }
  }

  MergeOutcome { fields, provenance }
}

fn assign_string(
  slot: &mut Option<String>,
  provenance: &mut BTreeMap<String, String>,
  field: &str,
  source: &str,
  value: &Option<String>,
) {
  if let Some(v) = value {
    *slot = Some(v.clone());
    provenance.insert(field.to_string(), source.to_string());
  }
}

fn assign_list(
  slot: &mut Option<Vec<String>>,
  provenance: &mut BTreeMap<String, String>,
  field: &str,
  source: &str,
  value: &Option<Vec<String>>,
) {
  if let Some(v) = value {
    *slot = Some(v.clone());
    provenance.insert(field.to_string(), source.to_string());
  }
}

fn preserve_string(
  slot: &mut Option<String>,
  provenance: &mut BTreeMap<String, String>,
  field: &str,
  prior: &Option<String>,
) {
  if let Some(v) = prior {
    *slot = Some(v.clone());
    provenance.insert(field.to_string(), CURRENT.to_string());
  }
}

fn preserve_list(
  slot: &mut Option<Vec<String>>,
  provenance: &mut BTreeMap<String, String>,
  field: &str,
  prior: &Option<Vec<String>>,
) {
  if let Some(v) = prior {
    *slot = Some(v.clone());
    provenance.insert(field.to_string(), CURRENT.to_string());
  }
}
