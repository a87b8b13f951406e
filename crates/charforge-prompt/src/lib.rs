//! Charforge Prompt Construction
//!
//! This crate turns a small set of discrete, user-chosen character attributes
//! into a fully specified text prompt for an image-generation provider.
//!
//! # Types
//!
//! - [`Catalog`] - The static set of poses, outfits, footwear, accessories and frames
//! - [`ParameterSet`] - One requested attribute combination
//! - [`ValidationOutcome`] - Result of checking a parameter set against the catalog
//! - [`AssembledPrompt`] - The canonical positive/negative prompt pair
//!
//! # Pipeline
//!
//! - [`validate`] - Compatibility checks over the catalog adjacency
//! - [`PromptAssembler`] - Deterministic rendering of a validated parameter set
//!
//! # Example
//!
//! ```rust
//! use charforge_prompt::{validate, Catalog, ParameterSet, PromptAssembler};
//!
//! let catalog = Catalog::builtin();
//! let params = ParameterSet::new("pointing-forward", "hoodie-sweatpants", "air-jordan-1-chicago");
//!
//! let outcome = validate(&params, &catalog);
//! assert!(outcome.is_valid);
//!
//! let prompt = PromptAssembler::new(&catalog).assemble(&params).unwrap();
//! assert!(prompt.positive.contains("Air Jordan 1"));
//! ```

pub mod assembler;
pub mod catalog;
pub mod params;
pub mod validator;

pub use assembler::{AssembledPrompt, PromptAssembler, SECTION_SEPARATOR};
pub use catalog::{
    AccessoryEntry, Catalog, CatalogFile, FootwearEntry, FrameDetails, FrameEntry, OutfitEntry,
    PoseEntry,
};
pub use params::{FrameType, ParameterSet};
pub use validator::{
    validate, AlternativeOptions, Field, Severity, ValidationIssue, ValidationOutcome,
};

use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading the catalog or assembling prompts.
#[derive(Debug, Error)]
pub enum PromptError {
    /// The catalog file could not be read.
    #[error("Failed to read catalog '{path}': {message}\n\nSuggestion: Check the 'catalog' path in charforge.json")]
    CatalogRead {
        /// Path to the catalog file.
        path: PathBuf,
        /// Description of the read failure.
        message: String,
    },

    /// The catalog file contained invalid JSON.
    #[error("Invalid JSON in catalog '{path}': {message}\n\nSuggestion: Validate the catalog file with a JSON linter")]
    CatalogParse {
        /// Path to the catalog file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// The catalog references an id that does not exist.
    #[error("Catalog integrity error: {0}")]
    CatalogIntegrity(String),

    /// A parameter set referenced an unknown catalog entry.
    #[error("unknown {kind} '{id}'")]
    UnknownEntry {
        /// Kind of catalog entry (pose, outfit, ...).
        kind: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for prompt operations.
pub type Result<T> = std::result::Result<T, PromptError>;

impl PromptError {
    /// Creates a new `UnknownEntry` error.
    #[must_use]
    pub fn unknown(kind: &'static str, id: impl Into<String>) -> Self {
        Self::UnknownEntry {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_entry_display() {
        let err = PromptError::unknown("pose", "moonwalk");
        assert_eq!(err.to_string(), "unknown pose 'moonwalk'");
    }

    #[test]
    fn test_catalog_parse_display_has_suggestion() {
        let err = PromptError::CatalogParse {
            path: PathBuf::from("catalog.json"),
            message: "expected value".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("catalog.json"));
        assert!(msg.contains("Suggestion"));
    }
}
