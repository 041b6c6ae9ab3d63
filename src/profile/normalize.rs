//! Per-shape normalization of raw source payloads.
//!
//! Every declared source answers with one of a closed set of envelopes; the
//! source's configured [`EnvelopeShape`] selects the normalization function.
//! No speculative property probing: an unexpected payload simply yields an
//! empty fragment for the fields it does not carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::CanonicalFragment;

/// The closed set of response envelopes sources are known to answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeShape {
  /// `{ "data": { ...fields... } }`
  DataEnvelope,
  /// `{ "user": { ...fields... } }`
  NestedUser,
  /// `{ ...fields... }`
  Flat,
}

/// Normalize a raw payload using the source's declared envelope shape.
pub fn normalize(shape: EnvelopeShape, payload: &Value) -> CanonicalFragment {
  match shape {
    EnvelopeShape::DataEnvelope => normalize_data_envelope(payload),
    EnvelopeShape::NestedUser => normalize_nested_user(payload),
    EnvelopeShape::Flat => normalize_flat(payload),
  }
}

fn normalize_data_envelope(payload: &Value) -> CanonicalFragment {
  match payload.get("data") {
    Some(inner) => extract_fields(inner),
    None => CanonicalFragment::default(),
  }
}

fn normalize_nested_user(payload: &Value) -> CanonicalFragment {
  match payload.get("user") {
    Some(inner) => extract_fields(inner),
    None => CanonicalFragment::default(),
  }
}

fn normalize_flat(payload: &Value) -> CanonicalFragment {
  extract_fields(payload)
}

/// Shared field extraction over an unwrapped object.
///
/// Known aliases per field come from the endpoints' historical payloads.
/// Empty strings and empty lists normalize to absent so the merge's
/// "non-empty" precedence tests stay trivial.
fn extract_fields(obj: &Value) -> CanonicalFragment {
  CanonicalFragment {
    roles: string_list(obj, &["roles"]),
    first_name: string_field(obj, &["first_name", "firstName"]),
    last_name: string_field(obj, &["last_name", "lastName"]),
    email: string_field(obj, &["email"]),
    phone: string_field(obj, &["phone", "phone_number"]),
    street: string_field(obj, &["street", "address"]),
    city: string_field(obj, &["city"]),
    postal_code: string_field(obj, &["postal_code", "zip"]),
    country: string_field(obj, &["country"]),
    bio: string_field(obj, &["bio", "description"]),
    links: string_list(obj, &["links"]),
    avatar_url: string_field(obj, &["avatar_url", "avatar"]),
  }
}

fn string_field(obj: &Value, keys: &[&str]) -> Option<String> {
  for key in keys {
    if let Some(value) = obj.get(key).and_then(Value::as_str) {
      if !value.is_empty() {
        return Some(value.to_string());
      }
    }
  }
  None
}

fn string_list(obj: &Value, keys: &[&str]) -> Option<Vec<String>> {
  for key in keys {
    if let Some(items) = obj.get(key).and_then(Value::as_array) {
      let values: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
      if !values.is_empty() {
        return Some(values);
      }
    }
  }
  None
}
