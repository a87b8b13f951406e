//! The provider abstraction.

use async_trait::async_trait;
use charforge_prompt::AssembledPrompt;
use serde::{Deserialize, Serialize};

use crate::ProviderError;

/// What a provider returns for a successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutput {
    /// Where the generated image can be fetched from.
    pub asset_url: String,
    /// Provider-side request id, if one was returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Raw image bytes fetched from a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    /// Image payload.
    pub bytes: Vec<u8>,
    /// MIME type reported by the provider.
    pub content_type: String,
}

/// An external image-generation service.
///
/// Implementations must be cheap to share across tasks; the orchestrator
/// holds them behind `Arc<dyn ImageProvider>`.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Unique provider name, used in logs and records.
    fn name(&self) -> &str;

    /// Requests one image for `prompt`.
    async fn generate(&self, prompt: &AssembledPrompt) -> Result<GenerationOutput, ProviderError>;

    /// Cheap availability probe. Never errors; unreachable means `false`.
    async fn is_available(&self) -> bool;

    /// Downloads an asset previously returned by [`generate`](Self::generate).
    async fn fetch_asset(&self, url: &str) -> Result<FetchedAsset, ProviderError>;
}
