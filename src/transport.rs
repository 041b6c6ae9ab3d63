//! Transport abstraction and the HTTP implementation.
//!
//! The synchronization layer never talks to `reqwest` directly; everything
//! goes through the [`Transport`] trait so tests can substitute a scripted
//! fake and the retry/dedup machinery stays transport-agnostic.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tracing::debug;
use url::Url;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One logical request handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
  pub method: Method,
  pub path: String,
  pub params: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl TransportRequest {
  pub fn get(path: &str, params: &[(&str, &str)]) -> Self {
    Self {
      method: Method::Get,
      path: path.to_string(),
      params: params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
      body: None,
    }
  }

  pub fn write(method: Method, path: &str, body: Option<Value>) -> Self {
    Self {
      method,
      path: path.to_string(),
      params: Vec::new(),
      body,
    }
  }
}

#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, request: TransportRequest) -> Result<Value, SyncError>;
}

/// Provides the identity used to namespace cache and dedup keys.
pub trait SessionIdentity: Send + Sync {
  fn current_session_id(&self) -> String;
}

/// Fixed session identity, set once at sign-in.
pub struct StaticSession(pub String);

impl SessionIdentity for StaticSession {
  fn current_session_id(&self) -> String {
    self.0.clone()
  }
}

/// HTTP transport over reqwest with an optional bearer-token decorator.
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self, SyncError> {
    let base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("invalid base url {}: {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(30))
      .build()
      .map_err(|e| SyncError::Config(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| SyncError::Validation {
        status: 0,
        message: format!("invalid request path {}: {}", path, e),
      })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, request: TransportRequest) -> Result<Value, SyncError> {
    let url = self.endpoint(&request.path)?;
    debug!(method = %request.method, %url, "transport fetch");

    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, url).query(&request.params);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(classify_send_error)?;
    let status = response.status().as_u16();
    let text = response
      .text()
      .await
      .map_err(|e| SyncError::Unreachable(format!("failed to read response body: {}", e)))?;

    if !(200..300).contains(&status) {
      return Err(SyncError::from_status(status, text));
    }

    if text.is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_str(&text).map_err(|e| SyncError::Validation {
      status,
      message: format!("malformed response body: {}", e),
    })
  }
}

fn classify_send_error(err: reqwest::Error) -> SyncError {
  if err.is_timeout() {
    SyncError::Timeout(err.to_string())
  } else {
    SyncError::Unreachable(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_joins_relative_paths() {
    let transport = HttpTransport::new("https://api.example.edu/v1/", None).expect("transport");
    let url = transport.endpoint("/profile/42").expect("url");
    assert_eq!(url.as_str(), "https://api.example.edu/v1/profile/42");
  }

  #[test]
  fn test_invalid_base_url_is_a_config_error() {
    assert!(matches!(
      HttpTransport::new("not a url", None),
      Err(SyncError::Config(_))
    ));
  }
}
