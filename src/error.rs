//! Failure taxonomy for the synchronization layer.
//!
//! Errors are `Clone` so a single outcome can fan out to every caller joined
//! on the same in-flight request.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// The transport did not answer in time.
  #[error("request timed out: {0}")]
  Timeout(String),

  /// The remote endpoint could not be reached.
  #[error("network unreachable: {0}")]
  Unreachable(String),

  /// The request was dropped mid-flight (e.g. during a page transition).
  #[error("request cancelled: {0}")]
  Cancelled(String),

  /// The session is no longer valid (401/403). Commonly a benign sign-out
  /// race, so read paths surface this as an absent result instead of failing.
  #[error("authentication expired")]
  AuthExpired,

  /// The server rejected the request for business reasons (4xx).
  #[error("request rejected ({status}): {message}")]
  Validation { status: u16, message: String },

  /// Every declared profile source failed and no usable snapshot exists.
  #[error("profile aggregation failed: {0}")]
  Aggregation(String),

  /// The durable local store misbehaved.
  #[error("snapshot store error: {0}")]
  Storage(String),

  /// Configuration could not be loaded or parsed.
  #[error("configuration error: {0}")]
  Config(String),
}

impl SyncError {
  /// Whether the retry executor may attempt this request again.
  ///
  /// Only transport-level transients qualify; auth and validation failures
  /// are final no matter how often they are repeated.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      SyncError::Timeout(_) | SyncError::Unreachable(_) | SyncError::Cancelled(_)
    )
  }

  /// Map an HTTP status code (plus response text) onto the taxonomy.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      401 | 403 => SyncError::AuthExpired,
      408 => SyncError::Timeout(message),
      400..=499 => SyncError::Validation { status, message },
      _ => SyncError::Unreachable(format!("status {}: {}", status, message)),
    }
  }
}
