//! HTTP client for the fleet API.
//!
//! Every endpoint answers with the same JSON envelope:
//! `{ success: boolean, data?: <payload>, error?: string }`. Anything else, or
//! `success != true`, means "no data available" and is never a hard failure;
//! only transport and HTTP-status problems become fetch errors.

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;
use crate::error::FetchError;
use crate::sync::FetchOutcome;

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
  success: Option<bool>,
  #[serde(default)]
  data: Option<Value>,
  #[serde(default)]
  error: Option<String>,
}

/// Thin async client over the configured base endpoint.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
}

impl ApiClient {
  pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| FetchError::Network(format!("invalid base url '{}': {}", config.url, e)))?;

    let mut builder = reqwest::Client::builder();
    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }
    let http = builder
      .build()
      .map_err(|e| FetchError::Network(format!("failed to build http client: {}", e)))?;

    Ok(Self { http, base_url })
  }

  /// GET a read resource.
  pub async fn get_resource(&self, path: &str) -> FetchOutcome {
    self.execute(Method::GET, path).await
  }

  /// POST an action resource (retrain, clear-logs). Same envelope contract.
  pub async fn post_action(&self, path: &str) -> FetchOutcome {
    self.execute(Method::POST, path).await
  }

  async fn execute(&self, method: Method, path: &str) -> FetchOutcome {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| FetchError::Network(format!("invalid resource path '{}': {}", path, e)))?;

    let response = self
      .http
      .request(method, url)
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Http {
        status: status.as_u16(),
        message: status.canonical_reason().unwrap_or("unknown").to_string(),
      });
    }

    let body = response
      .text()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    match parse_envelope(&body) {
      Ok(data) => Ok(data),
      Err(e) => {
        // Envelope problems degrade to "no data available".
        debug!("response from '{}' unusable: {}", path, e);
        Ok(None)
      }
    }
  }
}

/// Parse the response envelope. `success != true` or an absent payload reads
/// as no data; a body that is not the envelope at all is a malformed-response
/// error for the caller to degrade on.
fn parse_envelope(body: &str) -> Result<Option<Value>, FetchError> {
  let envelope: ApiEnvelope =
    serde_json::from_str(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

  if envelope.success != Some(true) {
    if let Some(error) = envelope.error {
      debug!("remote reported failure: {}", error);
    }
    return Ok(None);
  }

  Ok(envelope.data)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn successful_envelope_yields_data() {
    let data = parse_envelope(r#"{"success": true, "data": {"spot": 18.2}}"#).unwrap();
    assert_eq!(data, Some(json!({"spot": 18.2})));
  }

  #[test]
  fn unsuccessful_envelope_is_no_data() {
    let data = parse_envelope(r#"{"success": false, "error": "bot offline"}"#).unwrap();
    assert_eq!(data, None);
  }

  #[test]
  fn missing_success_flag_is_no_data() {
    let data = parse_envelope(r#"{"data": [1, 2, 3]}"#).unwrap();
    assert_eq!(data, None);
  }

  #[test]
  fn success_without_payload_is_no_data() {
    let data = parse_envelope(r#"{"success": true}"#).unwrap();
    assert_eq!(data, None);
  }

  #[test]
  fn non_envelope_body_is_malformed() {
    let err = parse_envelope("<html>502 Bad Gateway</html>").unwrap_err();
    assert!(matches!(err, FetchError::MalformedResponse(_)));
  }
}
