//! Transport seam between the fetch client and the network.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use url::Url;

use super::retry::parse_retry_after;
use crate::config::FetchPolicyConfig;
use crate::error::{IngestError, IngestResult, body_snippet};

/// Query parameter names whose values never leave the process.
const SECRET_PARAM_MARKERS: &[&str] = &["key", "token", "secret", "password", "signature", "auth"];

/// Render `url` for logs and events: query values of credential-like
/// parameters are replaced, everything else is kept for diagnosis.
pub fn redact_url(url: &Url) -> String {
    if url.query().is_none() {
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| {
            let lowered = name.to_ascii_lowercase();
            let value = if SECRET_PARAM_MARKERS.iter().any(|m| lowered.contains(m)) {
                "[redacted]".to_string()
            } else {
                value.into_owned()
            };
            (name.into_owned(), value)
        })
        .collect();

    let mut redacted = url.clone();
    redacted.set_fragment(None);
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// One outbound request, tagged with the source whose limits it runs under.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source: String,
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get<S: Into<String>>(source: S, url: Url) -> Self {
        Self {
            source: source.into(),
            method: Method::GET,
            url,
            headers: Vec::new(),
        }
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The URL with credentials masked, see [`redact_url`].
    pub fn display_url(&self) -> String {
        redact_url(&self.url)
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl FetchResponse {
    pub fn new<B: Into<String>>(status: u16, body: B) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header<K: AsRef<str>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Server retry hint from `Retry-After`, relative to `now`.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|value| parse_retry_after(value, now))
    }

    /// Decode the body as JSON; decoding failures are adapter errors.
    pub fn json<T: DeserializeOwned>(&self) -> IngestResult<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            IngestError::adapter(format!(
                "malformed JSON payload ({e}): {}",
                body_snippet(&self.body)
            ))
        })
    }
}

/// Network-level failures. All of them are treated as transient.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("failed to read response body: {0}")]
    Body(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(policy: &FetchPolicyConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(policy.request_timeout_ms))
            .user_agent(policy.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        // reqwest errors embed the full URL, query included.
        let response = builder.send().await.map_err(|e| {
            let e = e.without_url();
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Body(e.without_url().to_string()))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_reqwest_transport_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/series"))
            .and(query_param("id", "DFF"))
            .and(header("x-api-key", "secret"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&FetchPolicyConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/series?id=DFF", server.uri())).unwrap();
        let request = FetchRequest::get("fred", url).header("x-api-key", "secret");

        let response = transport.send(&request).await.unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.body, "slow down");
        assert_eq!(response.header("Retry-After"), Some("7"));
        assert_eq!(
            response.retry_after(Utc::now()),
            Some(Duration::from_secs(7))
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let transport = ReqwestTransport::new(&FetchPolicyConfig::default()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/unreachable").unwrap();
        let result = transport.send(&FetchRequest::get("fred", url)).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn test_transport_errors_do_not_carry_the_query() {
        let transport = ReqwestTransport::new(&FetchPolicyConfig::default()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/unreachable?api_key=SECRET123").unwrap();
        let err = transport
            .send(&FetchRequest::get("fred", url))
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("SECRET123"));
    }

    #[test]
    fn test_redact_url_masks_credential_params() {
        let url = Url::parse(
            "http://fred.test/series/observations?series_id=DFF&api_key=SECRET123&file_type=json&access_token=abc",
        )
        .unwrap();
        let shown = redact_url(&url);
        assert!(!shown.contains("SECRET123"));
        assert!(!shown.contains("abc"));
        assert!(shown.contains("series_id=DFF"));
        assert!(shown.contains("file_type=json"));
        assert!(shown.contains("api_key=%5Bredacted%5D"));

        let plain = Url::parse("http://fred.test/series").unwrap();
        assert_eq!(redact_url(&plain), "http://fred.test/series");
    }

    #[test]
    fn test_json_decode_failure_is_adapter_error() {
        let response = FetchResponse::new(200, "<html>");
        let err = response.json::<serde_json::Value>().unwrap_err();
        assert_eq!(err.kind(), "adapter_error");
    }
}
