use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::retry::{RetryClassification, RetryableError};
use crate::settings::{JudgeSettings, ProviderKind, ProviderSettings};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limit exceeded{}", .retry_after_ms.map(|ms| format!(", retry after {}ms", ms)).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("server error: {0}")]
    Server(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("model not available: {0}")]
    ModelNotAvailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => ProviderError::Authentication(body.to_string()),
            404 => ProviderError::ModelNotAvailable(body.to_string()),
            408 => ProviderError::Network(format!("HTTP 408: {}", body)),
            429 => ProviderError::RateLimited {
                retry_after_ms: None,
            },
            500..=599 => ProviderError::Server(format!("HTTP {}: {}", status, body)),
            _ => ProviderError::InvalidRequest(format!("HTTP {}: {}", status, body)),
        }
    }

    /// The provider cannot serve this evaluation at all and the chain should
    /// move on to the next one.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ProviderError::NotConfigured(_)
                | ProviderError::Authentication(_)
                | ProviderError::ModelNotAvailable(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        self.classify() != RetryClassification::NoRetry
    }
}

impl RetryableError for ProviderError {
    fn classify(&self) -> RetryClassification {
        match self {
            ProviderError::RateLimited { retry_after_ms } => RetryClassification::RateLimited {
                retry_after_ms: *retry_after_ms,
            },
            ProviderError::Server(_) | ProviderError::Network(_) | ProviderError::Timeout(_) => {
                RetryClassification::Retry
            }
            ProviderError::NotConfigured(_)
            | ProviderError::Authentication(_)
            | ProviderError::ModelNotAvailable(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::InvalidResponse(_) => RetryClassification::NoRetry,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(0)
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A judge model behind some API. `judge` returns the raw completion text.
#[async_trait]
pub trait JudgeProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Cheap local check, e.g. that credentials are present.
    async fn check_availability(&self) -> Result<(), ProviderError>;

    async fn judge(&self, request: &JudgeRequest) -> Result<String, ProviderError>;
}

/// Builds the provider chain for one evaluation, in fallback order.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, settings: &JudgeSettings) -> Vec<Arc<dyn JudgeProvider>>;
}

/// Reads API keys from the environment and talks to the real APIs.
#[derive(Clone, Default)]
pub struct HttpProviderFactory {
    client: reqwest::Client,
}

impl HttpProviderFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, settings: &JudgeSettings) -> Vec<Arc<dyn JudgeProvider>> {
        let timeout = Duration::from_millis(settings.request_timeout_ms);
        settings
            .providers
            .iter()
            .map(|p| {
                let api_key = std::env::var(&p.api_key_env)
                    .ok()
                    .filter(|k| !k.trim().is_empty());
                let provider: Arc<dyn JudgeProvider> = match p.kind {
                    ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(
                        self.client.clone(),
                        p,
                        api_key,
                        timeout,
                    )),
                    ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                        self.client.clone(),
                        p,
                        api_key,
                        timeout,
                    )),
                };
                provider
            })
            .collect()
    }
}

fn require_key<'a>(key: &'a Option<String>, env: &str) -> Result<&'a str, ProviderError> {
    key.as_deref()
        .ok_or_else(|| ProviderError::NotConfigured(format!("{} is not set", env)))
}

async fn read_error(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp.text().await.unwrap_or_default();
    error_from_response(status, &headers, &body)
}

fn error_from_response(status: u16, headers: &HeaderMap, body: &str) -> ProviderError {
    match ProviderError::from_http_status(status, body) {
        ProviderError::RateLimited { .. } => ProviderError::RateLimited {
            retry_after_ms: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after),
        },
        other => other,
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored and fall back
/// to the backoff schedule.
fn parse_retry_after(value: &str) -> Option<u64> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some((secs * 1000.0).round() as u64)
}

/// OpenAI-compatible chat completions endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key_env: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        client: reqwest::Client,
        settings: &ProviderSettings,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: settings.model.clone(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            api_key_env: settings.api_key_env.clone(),
            api_key,
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl JudgeProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn check_availability(&self) -> Result<(), ProviderError> {
        require_key(&self.api_key, &self.api_key_env).map(|_| ())
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<String, ProviderError> {
        let key = require_key(&self.api_key, &self.api_key_env)?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(provider = "openai", model = %self.model, "Requesting judge completion");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(key)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.model,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "response_format": { "type": "json_object" },
                "messages": [
                    { "role": "system", "content": request.system },
                    { "role": "user", "content": request.prompt },
                ],
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }

        let completion: ChatCompletion = resp.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("completion has no content".to_string()))
    }
}

/// Anthropic messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    api_key_env: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(
        client: reqwest::Client,
        settings: &ProviderSettings,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: settings.model.clone(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            api_key_env: settings.api_key_env.clone(),
            api_key,
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl JudgeProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn check_availability(&self) -> Result<(), ProviderError> {
        require_key(&self.api_key, &self.api_key_env).map(|_| ())
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<String, ProviderError> {
        let key = require_key(&self.api_key, &self.api_key_env)?;
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        debug!(provider = "anthropic", model = %self.model, "Requesting judge completion");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.model,
                "system": request.system,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "messages": [
                    { "role": "user", "content": request.prompt },
                ],
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }

        let message: MessagesResponse = resp.json().await?;
        message
            .content
            .into_iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text)
            .ok_or_else(|| ProviderError::InvalidResponse("message has no text block".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_http_status() {
        assert!(matches!(
            ProviderError::from_http_status(401, "bad key"),
            ProviderError::Authentication(_)
        ));
        assert!(matches!(
            ProviderError::from_http_status(429, ""),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_http_status(503, "overloaded"),
            ProviderError::Server(_)
        ));
        assert!(matches!(
            ProviderError::from_http_status(400, "bad"),
            ProviderError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_rate_limit_honours_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "2".parse().unwrap());
        assert!(matches!(
            error_from_response(429, &headers, "slow down"),
            ProviderError::RateLimited {
                retry_after_ms: Some(2000)
            }
        ));
        assert_eq!(
            error_from_response(429, &headers, "").classify(),
            RetryClassification::RateLimited {
                retry_after_ms: Some(2000)
            }
        );

        headers.insert(RETRY_AFTER, "0.5".parse().unwrap());
        assert!(matches!(
            error_from_response(429, &headers, ""),
            ProviderError::RateLimited {
                retry_after_ms: Some(500)
            }
        ));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert!(matches!(
            error_from_response(429, &headers, ""),
            ProviderError::RateLimited {
                retry_after_ms: None
            }
        ));

        assert!(matches!(
            error_from_response(503, &headers, "down"),
            ProviderError::Server(_)
        ));
        assert!(matches!(
            error_from_response(429, &HeaderMap::new(), ""),
            ProviderError::RateLimited {
                retry_after_ms: None
            }
        ));
    }

    #[test]
    fn test_classification() {
        assert!(ProviderError::Timeout(1000).is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::RateLimited {
            retry_after_ms: None
        }
        .is_transient());
        assert!(!ProviderError::Authentication("x".into()).is_transient());
        assert!(ProviderError::Authentication("x".into()).is_unavailable());
        assert!(!ProviderError::InvalidResponse("x".into()).is_unavailable());
    }

    #[tokio::test]
    async fn test_missing_credentials_reported_unavailable() {
        let mut settings = JudgeSettings::default();
        for (i, provider) in settings.providers.iter_mut().enumerate() {
            provider.api_key_env = format!("AGENT_JUDGE_TEST_UNSET_KEY_{}", i);
        }
        let providers = HttpProviderFactory::default().build(&settings);
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].name(), "openai");
        assert_eq!(providers[1].name(), "anthropic");
        for provider in providers {
            let err = provider.check_availability().await.unwrap_err();
            assert!(matches!(err, ProviderError::NotConfigured(_)));
        }
    }
}
