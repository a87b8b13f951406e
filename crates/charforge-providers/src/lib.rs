//! Charforge Providers
//!
//! Adapters for external image-generation services and the object storage
//! that generated images are written to.
//!
//! Every provider implements [`ImageProvider`] and reports failures as a
//! [`ProviderError`] tagged with a [`ProviderErrorKind`]. The kind alone
//! decides whether a failure is worth retrying.

pub mod http;
pub mod mock;
pub mod provider;
pub mod storage;

pub use http::{HttpImageProvider, HttpProviderConfig};
pub use mock::{MockProvider, PLACEHOLDER_PNG};
pub use provider::{FetchedAsset, GenerationOutput, ImageProvider};
pub use storage::{
    FsStorage, MemoryObject, MemoryStorage, ObjectStorage, StorageError, StoredObject,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Error Types
// ============================================================================

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderErrorKind {
    /// Credentials were rejected.
    Authentication,
    /// The provider throttled the request.
    RateLimited,
    /// The call did not complete in time.
    Timeout,
    /// The provider is down or overloaded.
    ServiceUnavailable,
    /// The account ran out of quota.
    QuotaExceeded,
    /// The prompt was refused by the provider's safety filter.
    ContentPolicyViolation,
    /// The provider rejected the request as malformed.
    InvalidPrompt,
    /// Anything else.
    Unknown,
}

impl ProviderErrorKind {
    /// Returns `true` if the same call may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::ServiceUnavailable | Self::Unknown
        )
    }

    /// Returns `true` if the failure reflects on the provider's health.
    ///
    /// Request defects (invalid prompt, content policy) are the caller's
    /// fault and must not trip breakers or degrade health.
    #[must_use]
    pub const fn counts_against_provider(&self) -> bool {
        !matches!(self, Self::InvalidPrompt | Self::ContentPolicyViolation)
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::RateLimited => write!(f, "rate-limited"),
            Self::Timeout => write!(f, "timeout"),
            Self::ServiceUnavailable => write!(f, "service-unavailable"),
            Self::QuotaExceeded => write!(f, "quota-exceeded"),
            Self::ContentPolicyViolation => write!(f, "content-policy-violation"),
            Self::InvalidPrompt => write!(f, "invalid-prompt"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A failure reported by (or on behalf of) a provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{provider}: {kind}: {message}")]
pub struct ProviderError {
    /// Failure classification.
    pub kind: ProviderErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Name of the provider that failed.
    pub provider: String,
    /// Provider-requested wait before the next attempt.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    /// Creates a new provider error.
    #[must_use]
    pub fn new(
        kind: ProviderErrorKind,
        provider: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: provider.into(),
            retry_after: None,
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            provider,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// Creates a service-unavailable error.
    #[must_use]
    pub fn unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ServiceUnavailable, provider, message)
    }

    /// Attaches a provider-requested retry delay.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Returns `true` if the call may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns `true` if the failure should count against provider health.
    #[must_use]
    pub const fn counts_against_provider(&self) -> bool {
        self.kind.counts_against_provider()
    }
}
