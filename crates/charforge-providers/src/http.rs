//! Generic JSON-over-HTTP image provider.
//!
//! The provider POSTs `{"prompt", "negativePrompt", "parametersHash"}` to its
//! endpoint and expects `{"imageUrl": "..."}` back. HTTP status codes are
//! mapped onto [`ProviderErrorKind`] so that retry and failover decisions
//! work the same for every backend.

use std::time::Duration;

use async_trait::async_trait;
use charforge_prompt::AssembledPrompt;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::provider::{FetchedAsset, GenerationOutput, ImageProvider};
use crate::{ProviderError, ProviderErrorKind};

/// Connection settings for an [`HttpImageProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProviderConfig {
    /// Generation endpoint.
    pub endpoint: String,
    /// Optional GET endpoint used by availability probes.
    pub health_endpoint: Option<String>,
    /// Bearer token sent with every request.
    pub api_key: Option<String>,
    /// Per-request client timeout.
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    parameters_hash: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(alias = "url")]
    image_url: String,
    #[serde(default, alias = "id")]
    request_id: Option<String>,
}

/// An image provider reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpImageProvider {
    name: String,
    config: HttpProviderConfig,
    client: Client,
}

impl HttpImageProvider {
    /// Creates a provider named `name`.
    pub fn new(name: impl Into<String>, config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let name = name.into();
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Unknown, &name, e.to_string()))?;
        Ok(Self {
            name,
            config,
            client,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> ProviderError {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_connect() {
            ProviderErrorKind::ServiceUnavailable
        } else {
            ProviderErrorKind::Unknown
        };
        ProviderError::new(kind, &self.name, err.to_string())
    }

    async fn status_error(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        let kind = classify_status(status, &body);

        let mut error = ProviderError::new(
            kind,
            &self.name,
            format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)),
        );
        if let Some(delay) = retry_after {
            error = error.with_retry_after(delay);
        }
        error
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, prompt), fields(provider = %self.name, hash = %prompt.parameters_hash))]
    async fn generate(&self, prompt: &AssembledPrompt) -> Result<GenerationOutput, ProviderError> {
        let body = GenerateRequest {
            prompt: &prompt.positive,
            negative_prompt: &prompt.negative,
            parameters_hash: &prompt.parameters_hash,
        };
        let response = self
            .authorized(self.client.post(&self.config.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if !response.status().is_success() {
            let error = self.status_error(response).await;
            warn!(kind = %error.kind, "Provider rejected generation request");
            return Err(error);
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::Unknown,
                &self.name,
                format!("malformed response: {e}"),
            )
        })?;
        debug!(url = %parsed.image_url, "Provider returned asset");
        Ok(GenerationOutput {
            asset_url: parsed.image_url,
            request_id: parsed.request_id,
        })
    }

    async fn is_available(&self) -> bool {
        let Some(health) = &self.config.health_endpoint else {
            return true;
        };
        match self.authorized(self.client.get(health)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Health probe failed");
                false
            }
        }
    }

    #[instrument(skip(self), fields(provider = %self.name))]
    async fn fetch_asset(&self, url: &str) -> Result<FetchedAsset, ProviderError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&e))?;
        Ok(FetchedAsset {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Maps an HTTP error status (and body) to a failure kind.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Authentication,
        402 => ProviderErrorKind::QuotaExceeded,
        429 => ProviderErrorKind::RateLimited,
        400 | 422 => {
            let lower = body.to_ascii_lowercase();
            if lower.contains("content policy")
                || lower.contains("content_policy")
                || lower.contains("safety")
            {
                ProviderErrorKind::ContentPolicyViolation
            } else {
                ProviderErrorKind::InvalidPrompt
            }
        }
        408 | 504 => ProviderErrorKind::Timeout,
        500..=599 => ProviderErrorKind::ServiceUnavailable,
        _ => ProviderErrorKind::Unknown,
    }
}

/// Parses a `Retry-After` header given in whole seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
