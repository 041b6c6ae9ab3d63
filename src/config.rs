//! Synchronization-layer configuration.

use crate::error::SyncError;
use crate::profile::EnvelopeShape;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Endpoint prefixes that are never served from cache (e.g. "/chat").
  #[serde(default)]
  pub never_cache_endpoints: Vec<String>,
  /// Endpoint prefixes cached with the short TTL (e.g. "/notifications").
  #[serde(default)]
  pub short_ttl_endpoints: Vec<String>,
  /// Default cache TTL in seconds.
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  /// Short cache TTL in seconds, for fast-moving endpoints.
  #[serde(default = "short_ttl_secs")]
  pub short_ttl_secs: u64,
  /// Extra attempts after the first failure of a retryable call.
  #[serde(default = "max_retries")]
  pub max_retries: u32,
  /// Base backoff delay in milliseconds (doubled on every attempt).
  #[serde(default = "retry_base_ms")]
  pub retry_base_ms: u64,
  /// How long a settled in-flight entry stays joinable, absorbing bursts.
  #[serde(default = "pending_grace_ms")]
  pub pending_grace_ms: u64,
  /// Hard bound on how long a pending slot may stay occupied.
  #[serde(default = "pending_max_lifetime_ms")]
  pub pending_max_lifetime_ms: u64,
  /// Profile sources in merge-precedence order.
  #[serde(default)]
  pub sources: Vec<SourceSpec>,
}

/// One declared profile source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
  /// Stable identifier recorded in provenance (e.g. "identity").
  pub id: String,
  /// Endpoint the source is fetched from.
  pub path: String,
  /// Which response envelope this endpoint answers with.
  pub shape: EnvelopeShape,
  /// Whether this source is authoritative for role fields.
  #[serde(default)]
  pub roles_authority: bool,
}

fn default_ttl_secs() -> u64 {
  300
}
fn short_ttl_secs() -> u64 {
  10
}
fn max_retries() -> u32 {
  2
}
fn retry_base_ms() -> u64 {
  250
}
fn pending_grace_ms() -> u64 {
  400
}
fn pending_max_lifetime_ms() -> u64 {
  10_000
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      never_cache_endpoints: Vec::new(),
      short_ttl_endpoints: Vec::new(),
      default_ttl_secs: default_ttl_secs(),
      short_ttl_secs: short_ttl_secs(),
      max_retries: max_retries(),
      retry_base_ms: retry_base_ms(),
      pending_grace_ms: pending_grace_ms(),
      pending_max_lifetime_ms: pending_max_lifetime_ms(),
      sources: Vec::new(),
    }
  }
}

impl SyncConfig {
  pub fn default_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.default_ttl_secs as i64)
  }

  pub fn short_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.short_ttl_secs as i64)
  }

  pub fn retry_base(&self) -> StdDuration {
    StdDuration::from_millis(self.retry_base_ms)
  }

  pub fn pending_grace(&self) -> StdDuration {
    StdDuration::from_millis(self.pending_grace_ms)
  }

  pub fn pending_max_lifetime(&self) -> StdDuration {
    StdDuration::from_millis(self.pending_max_lifetime_ms)
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edusync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edusync/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self, SyncError> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(SyncError::Config(format!(
          "config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("edusync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edusync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self, SyncError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      SyncError::Config(format!(
        "failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    serde_yaml::from_str(&contents).map_err(|e| {
      SyncError::Config(format!(
        "failed to parse config file {}: {}",
        path.display(),
        e
      ))
    })
  }
}
