//! Scripted in-process provider.
//!
//! Used for offline runs of the CLI and throughout the test suites. A
//! [`MockProvider`] replays a script of failure kinds before it starts
//! succeeding, so retry, breaker and failover paths can be driven exactly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use charforge_prompt::AssembledPrompt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::{FetchedAsset, GenerationOutput, ImageProvider};
use crate::{ProviderError, ProviderErrorKind};

/// A 1x1 transparent PNG returned by every successful mock fetch.
pub const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

const URL_SCHEME: &str = "mock://";

/// An in-process provider with scripted failures.
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    latency: Duration,
    script: Mutex<VecDeque<ProviderErrorKind>>,
    fallback: Option<ProviderErrorKind>,
    fetch_failure: Option<ProviderErrorKind>,
    available: AtomicBool,
    calls: AtomicU32,
}

impl MockProvider {
    /// Creates a provider that always succeeds immediately.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            fetch_failure: None,
            available: AtomicBool::new(true),
            calls: AtomicU32::new(0),
        }
    }

    /// Delays every generation by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails the first `count` generations with `kind`.
    #[must_use]
    pub fn fail_first(mut self, count: u32, kind: ProviderErrorKind) -> Self {
        let script = self.script.get_mut();
        for _ in 0..count {
            script.push_back(kind);
        }
        self
    }

    /// Appends an explicit sequence of failures to the script.
    #[must_use]
    pub fn with_failures(mut self, kinds: impl IntoIterator<Item = ProviderErrorKind>) -> Self {
        self.script.get_mut().extend(kinds);
        self
    }

    /// Fails every generation after the script runs out.
    #[must_use]
    pub const fn always_failing(mut self, kind: ProviderErrorKind) -> Self {
        self.fallback = Some(kind);
        self
    }

    /// Fails every asset fetch with `kind`.
    #[must_use]
    pub const fn with_fetch_failure(mut self, kind: ProviderErrorKind) -> Self {
        self.fetch_failure = Some(kind);
        self
    }

    /// Sets the result of availability probes.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `generate` calls made so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn error(&self, kind: ProviderErrorKind) -> ProviderError {
        let error = ProviderError::new(kind, &self.name, format!("scripted {kind}"));
        if kind == ProviderErrorKind::RateLimited {
            error.with_retry_after(Duration::from_millis(1))
        } else {
            error
        }
    }
}

#[async_trait]
impl ImageProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &AssembledPrompt) -> Result<GenerationOutput, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().await.pop_front();
        if let Some(kind) = scripted.or(self.fallback) {
            debug!(provider = %self.name, call, kind = %kind, "Mock generation failing");
            return Err(self.error(kind));
        }

        let short_hash: String = prompt.parameters_hash.chars().take(12).collect();
        Ok(GenerationOutput {
            asset_url: format!("{URL_SCHEME}{}/{short_hash}-{call}.png", self.name),
            request_id: Some(format!("{}-{call}", self.name)),
        })
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn fetch_asset(&self, url: &str) -> Result<FetchedAsset, ProviderError> {
        if let Some(kind) = self.fetch_failure {
            return Err(self.error(kind));
        }
        if !url.starts_with(URL_SCHEME) {
            return Err(ProviderError::new(
                ProviderErrorKind::Unknown,
                &self.name,
                format!("not a mock asset url: {url}"),
            ));
        }
        Ok(FetchedAsset {
            bytes: PLACEHOLDER_PNG.to_vec(),
            content_type: "image/png".to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn prompt() -> AssembledPrompt {
        AssembledPrompt {
            positive: "p".to_string(),
            negative: "n".to_string(),
            parameters_hash: "abcdef0123456789".to_string(),
        }
    }

    #[tokio::test]
    async fn test_script_replays_then_succeeds() {
        let provider = MockProvider::new("mock-a").fail_first(2, ProviderErrorKind::Timeout);

        assert_eq!(
            provider.generate(&prompt()).await.unwrap_err().kind,
            ProviderErrorKind::Timeout
        );
        assert!(provider.generate(&prompt()).await.is_err());
        let output = provider.generate(&prompt()).await.unwrap();

        assert_eq!(output.asset_url, "mock://mock-a/abcdef012345-3.png");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_always_failing() {
        let provider =
            MockProvider::new("down").always_failing(ProviderErrorKind::ServiceUnavailable);
        for _ in 0..3 {
            assert!(provider.generate(&prompt()).await.unwrap_err().is_retryable());
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_placeholder() {
        let provider = MockProvider::new("mock-a");
        let output = provider.generate(&prompt()).await.unwrap();
        let asset = provider.fetch_asset(&output.asset_url).await.unwrap();

        assert_eq!(asset.content_type, "image/png");
        assert_eq!(&asset.bytes[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn test_fetch_rejects_foreign_url() {
        let provider = MockProvider::new("mock-a");
        assert!(provider.fetch_asset("https://example.com/x.png").await.is_err());
    }

    #[tokio::test]
    async fn test_availability_toggle() {
        let provider = MockProvider::new("mock-a");
        assert!(provider.is_available().await);
        provider.set_available(false);
        assert!(!provider.is_available().await);
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let provider = MockProvider::new("mock-a");
        let err = provider.error(ProviderErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_millis(1)));
    }
}
