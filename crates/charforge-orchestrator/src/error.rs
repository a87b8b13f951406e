//! Error types for the Charforge orchestrator.
//!
//! This module defines the error hierarchy for orchestration: configuration
//! loading, persistence of generation records, provider failures that
//! escaped retry and failover, and storage of generated images.

use std::path::PathBuf;
use std::time::Duration;

use charforge_prompt::PromptError;
use charforge_providers::{ProviderError, ProviderErrorKind, StorageError};

use crate::retry::RetryAttempt;

/// A specialized `Result` type for orchestrator operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Errors that can occur during orchestration.
///
/// Variants are organized by subsystem and include actionable suggestions
/// where the user can do something about them.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in the configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your charforge.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Prompt Errors
    // ========================================================================
    /// Catalog loading or prompt assembly failed.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    // ========================================================================
    // Provider Errors
    // ========================================================================
    /// A provider call failed with a non-retryable error or after failover.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A provider kept failing until the retry budget ran out.
    #[error("Provider '{provider}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Provider name.
        provider: String,
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: ProviderError,
        /// Per-attempt history.
        history: Vec<RetryAttempt>,
    },

    /// No registered provider is enabled, healthy and reachable.
    #[error("No image provider is available\n\nSuggestion: Check provider health with 'charforge providers' or re-enable a disabled provider")]
    NoProviderAvailable,

    /// Provider generation, across retries and failover, exceeded the operation timeout.
    #[error("Generation timed out after {}s", timeout.as_secs())]
    OperationTimeout {
        /// The configured operation timeout.
        timeout: Duration,
    },

    // ========================================================================
    // Storage & Persistence Errors
    // ========================================================================
    /// Writing or deleting the image blob failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The records file could not be read or written.
    #[error("Failed to persist records to '{path}': {message}\n\nSuggestion: Check write permissions for the 'recordsFile' location")]
    PersistenceError {
        /// Path to the records file.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// The records file contains malformed JSON.
    #[error("Corrupted records file '{path}': {message}\n\nSuggestion: Remove the records file to start fresh, or restore from backup")]
    RecordsFileCorrupted {
        /// Path to the corrupted file.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    /// No record exists for the given image id.
    #[error("Generation record not found: '{image_id}'")]
    RecordNotFound {
        /// The image id that was looked up.
        image_id: String,
    },

    /// An image id was inserted twice.
    #[error("Generation record already exists: '{image_id}'")]
    DuplicateRecord {
        /// The conflicting image id.
        image_id: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForgeError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `PersistenceError`.
    #[must_use]
    pub fn persistence(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::PersistenceError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `RecordsFileCorrupted` error.
    #[must_use]
    pub fn records_corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::RecordsFileCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `RecordNotFound` error.
    #[must_use]
    pub fn record_not_found(image_id: impl Into<String>) -> Self {
        Self::RecordNotFound {
            image_id: image_id.into(),
        }
    }

    /// Returns the provider error at the root of this failure, if any.
    #[must_use]
    pub const fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Provider(e) | Self::RetryExhausted { last_error: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if this error is transient and a later attempt may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Provider(e) | Self::RetryExhausted { last_error: e, .. } => e.is_retryable(),
            Self::NoProviderAvailable | Self::OperationTimeout { .. } | Self::Storage(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if this error is fatal and requires operator action.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::ConfigParseError { .. }
            | Self::ConfigValidationError { .. }
            | Self::Prompt(_)
            | Self::RecordsFileCorrupted { .. } => true,
            Self::Provider(e) => matches!(
                e.kind,
                ProviderErrorKind::Authentication | ProviderErrorKind::QuotaExceeded
            ),
            _ => false,
        }
    }
}
