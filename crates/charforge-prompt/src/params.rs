//! Parameter sets identifying a requested character image.
//!
//! A [`ParameterSet`] is an immutable value object. Two parameter sets that
//! differ only in optional fields being absent, empty, or `null` normalize to
//! the same canonical form and therefore hash to the same key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// FrameType
// ============================================================================

/// The narrative frame a generation belongs to.
///
/// An absent frame type means [`FrameType::Standard`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// A free-standing character render.
    #[default]
    Standard,
    /// A frame from the onboarding narrative.
    Onboarding,
    /// A frame that belongs to a multi-image sequence.
    Sequence,
}

impl FrameType {
    /// Returns `true` if this frame type requires a `frameId`.
    #[must_use]
    pub const fn requires_frame(&self) -> bool {
        matches!(self, Self::Onboarding | Self::Sequence)
    }

    /// Returns the wire name of the frame type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Onboarding => "onboarding",
            Self::Sequence => "sequence",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ParameterSet
// ============================================================================

/// The discrete attribute combination identifying a requested image.
///
/// Required fields default to the empty string when deserialized so that
/// missing values are reported by the validator instead of failing parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSet {
    /// Pose id.
    #[serde(default)]
    pub pose: String,

    /// Outfit id.
    #[serde(default)]
    pub outfit: String,

    /// Footwear id.
    #[serde(default)]
    pub footwear: String,

    /// Optional accessory id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessory: Option<String>,

    /// Optional frame type; absent means standard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_type: Option<FrameType>,

    /// Frame id, required for onboarding and sequence frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
}

impl ParameterSet {
    /// Creates a standard parameter set from the three required fields.
    #[must_use]
    pub fn new(
        pose: impl Into<String>,
        outfit: impl Into<String>,
        footwear: impl Into<String>,
    ) -> Self {
        Self {
            pose: pose.into(),
            outfit: outfit.into(),
            footwear: footwear.into(),
            accessory: None,
            frame_type: None,
            frame_id: None,
        }
    }

    /// Sets the accessory.
    #[must_use]
    pub fn with_accessory(mut self, accessory: impl Into<String>) -> Self {
        self.accessory = Some(accessory.into());
        self
    }

    /// Sets the frame type and frame id.
    #[must_use]
    pub fn with_frame(mut self, frame_type: FrameType, frame_id: impl Into<String>) -> Self {
        self.frame_type = Some(frame_type);
        self.frame_id = Some(frame_id.into());
        self
    }

    /// Returns the effective frame type (absent means standard).
    #[must_use]
    pub fn effective_frame_type(&self) -> FrameType {
        self.frame_type.unwrap_or_default()
    }

    /// Returns the canonical form of this parameter set.
    ///
    /// Strings are trimmed, empty optional strings collapse to `None`, and a
    /// standard frame type collapses to `None`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            pose: self.pose.trim().to_string(),
            outfit: self.outfit.trim().to_string(),
            footwear: self.footwear.trim().to_string(),
            accessory: collapse(self.accessory.as_deref()),
            frame_type: self.frame_type.filter(|t| *t != FrameType::Standard),
            frame_id: collapse(self.frame_id.as_deref()),
        }
    }

    /// Serializes the normalized parameter set as JSON with sorted keys.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        let normalized = self.normalized();
        let mut fields: BTreeMap<&'static str, String> = BTreeMap::new();
        fields.insert("pose", normalized.pose);
        fields.insert("outfit", normalized.outfit);
        fields.insert("footwear", normalized.footwear);
        if let Some(accessory) = normalized.accessory {
            fields.insert("accessory", accessory);
        }
        if let Some(frame_type) = normalized.frame_type {
            fields.insert("frameType", frame_type.as_str().to_string());
        }
        if let Some(frame_id) = normalized.frame_id {
            fields.insert("frameId", frame_id);
        }
        // A map of strings always serializes.
        serde_json::to_string(&fields).unwrap_or_default()
    }

    /// Returns the lowercase hex SHA-256 of [`canonical_json`](Self::canonical_json).
    #[must_use]
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        hex::encode(digest)
    }
}

fn collapse(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
