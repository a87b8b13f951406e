//! Compatibility validation of parameter sets against the catalog.
//!
//! Checks run in a fixed order:
//!
//! 1. required fields (`pose`, `outfit`, `footwear`) are present
//! 2. onboarding/sequence frame types carry a `frameId`
//! 3. every referenced id exists in the catalog
//! 4. pose/outfit and outfit/footwear adjacency (a missing forward link is an
//!    error, a missing reverse link is a warning)
//! 5. the accessory is in the pose's compatible-accessory set
//! 6. the selected frame's required accessories are present
//!
//! When a field fails, alternatives are computed from the adjacency of the
//! last valid field before it. Validation is pure: identical inputs always
//! produce identical outcomes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, FrameEntry, OutfitEntry, PoseEntry};
use crate::params::ParameterSet;

// ============================================================================
// Outcome Types
// ============================================================================

/// Severity of a validation issue. Only `Error` blocks generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks generation.
    Error,
    /// Reported but does not block.
    Warning,
    /// Informational note.
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// The parameter field an issue refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    /// `pose`
    Pose,
    /// `outfit`
    Outfit,
    /// `footwear`
    Footwear,
    /// `accessory`
    Accessory,
    /// `frameType`
    FrameType,
    /// `frameId`
    FrameId,
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pose => write!(f, "pose"),
            Self::Outfit => write!(f, "outfit"),
            Self::Footwear => write!(f, "footwear"),
            Self::Accessory => write!(f, "accessory"),
            Self::FrameType => write!(f, "frameType"),
            Self::FrameId => write!(f, "frameId"),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// How serious the issue is.
    pub severity: Severity,
    /// Which field it concerns.
    pub field: Field,
    /// Human-readable description.
    pub message: String,
    /// Actionable hint, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Catalog ids that would make a failing field valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternativeOptions {
    /// The field the options apply to.
    pub field: Field,
    /// Candidate ids, sorted.
    pub options: Vec<String>,
}

/// Result of validating a parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    /// `true` when no issue has `Error` severity.
    pub is_valid: bool,
    /// All findings in check order.
    pub errors: Vec<ValidationIssue>,
    /// Alternatives for failing fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_options: Vec<AlternativeOptions>,
}

impl ValidationOutcome {
    /// Returns the blocking issues.
    pub fn blocking(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.errors.iter().filter(|i| i.severity == Severity::Error)
    }

    /// Returns the warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.errors.iter().filter(|i| i.severity == Severity::Warning)
    }

    /// Returns the alternatives offered for `field`, if any.
    #[must_use]
    pub fn alternatives_for(&self, field: Field) -> Option<&[String]> {
        self.alternative_options
            .iter()
            .find(|a| a.field == field)
            .map(|a| a.options.as_slice())
    }

    /// Joins the blocking messages into one line.
    #[must_use]
    pub fn summary(&self) -> String {
        self.blocking()
            .map(|i| format!("{}: {}", i.field, i.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validates `params` against `catalog`.
///
/// # Examples
///
/// ```
/// use charforge_prompt::{validate, Catalog, ParameterSet};
///
/// let catalog = Catalog::builtin();
/// let params = ParameterSet::new("arms-crossed", "hoodie-sweatpants", "air-jordan-1-chicago")
///     .with_accessory("cave-map");
///
/// let outcome = validate(&params, &catalog);
/// assert!(!outcome.is_valid);
/// ```
#[must_use]
pub fn validate(params: &ParameterSet, catalog: &Catalog) -> ValidationOutcome {
    let params = params.normalized();
    let mut run = Run::new(catalog);

    // (a) required fields
    for (field, value) in [
        (Field::Pose, &params.pose),
        (Field::Outfit, &params.outfit),
        (Field::Footwear, &params.footwear),
    ] {
        if value.is_empty() {
            run.issue(
                Severity::Error,
                field,
                format!("{field} is required"),
                None,
            );
        }
    }

    // (b) frame id required by narrative frame types
    let frame_type = params.effective_frame_type();
    if frame_type.requires_frame() && params.frame_id.is_none() {
        run.issue(
            Severity::Error,
            Field::FrameId,
            format!("frameId is required for {frame_type} frames"),
            Some("Pick a frame for the chosen frameType".to_string()),
        );
        run.alternatives(
            Field::FrameId,
            catalog
                .frames()
                .filter(|f| f.frame_type == frame_type)
                .map(|f| f.id.clone()),
        );
    }

    // (c) referenced ids exist
    let pose = run.resolve_pose(&params.pose);
    let outfit = run.resolve_outfit(&params.outfit, pose);
    let footwear_ok = run.resolve_footwear(&params.footwear, outfit);
    let accessory_ok = params
        .accessory
        .as_deref()
        .map(|id| run.resolve_accessory(id, pose));
    let frame = params
        .frame_id
        .as_deref()
        .and_then(|id| run.resolve_frame(id, frame_type));

    // (d) pose <-> outfit <-> footwear adjacency
    if let (Some(pose), Some(outfit)) = (pose, outfit) {
        if !pose.compatible_outfits.contains(&outfit.id) {
            run.issue(
                Severity::Error,
                Field::Outfit,
                format!(
                    "outfit '{}' is not compatible with pose '{}'",
                    outfit.id, pose.id
                ),
                Some(choose_from(&pose.compatible_outfits)),
            );
            run.alternatives(Field::Outfit, pose.compatible_outfits.iter().cloned());
        } else if !outfit.compatible_poses.contains(&pose.id) {
            run.issue(
                Severity::Warning,
                Field::Outfit,
                format!(
                    "outfit '{}' does not list pose '{}' as compatible",
                    outfit.id, pose.id
                ),
                None,
            );
        }
    }
    if let (Some(outfit), Some(footwear)) = (outfit, footwear_ok) {
        if !footwear.compatible_outfits.contains(&outfit.id) {
            run.issue(
                Severity::Error,
                Field::Footwear,
                format!(
                    "footwear '{}' is not compatible with outfit '{}'",
                    footwear.id, outfit.id
                ),
                Some(choose_from(&footwear_for(catalog, outfit))),
            );
            run.alternatives(Field::Footwear, footwear_for(catalog, outfit));
        } else if !outfit.compatible_footwear.contains(&footwear.id) {
            run.issue(
                Severity::Warning,
                Field::Footwear,
                format!(
                    "outfit '{}' does not list footwear '{}' as compatible",
                    outfit.id, footwear.id
                ),
                None,
            );
        }
    }

    // (e) accessory must be supported by the pose
    if let (Some(pose), Some(Some(accessory))) = (pose, accessory_ok) {
        if !pose.compatible_accessories.contains(&accessory.id) {
            let suggestion = if pose.compatible_accessories.is_empty() {
                format!("Remove the accessory; pose '{}' cannot hold or wear one", pose.id)
            } else {
                choose_from(&pose.compatible_accessories)
            };
            run.issue(
                Severity::Error,
                Field::Accessory,
                format!(
                    "pose '{}' cannot carry accessory '{}'",
                    pose.id, accessory.id
                ),
                Some(suggestion),
            );
            run.alternatives(Field::Accessory, pose.compatible_accessories.iter().cloned());
        } else if !accessory.compatible_poses.contains(&pose.id) {
            run.issue(
                Severity::Warning,
                Field::Accessory,
                format!(
                    "accessory '{}' does not list pose '{}' as compatible",
                    accessory.id, pose.id
                ),
                None,
            );
        }
    }

    // (f) frame required accessories
    if let Some(frame) = frame {
        for required in &frame.required_accessories {
            if params.accessory.as_deref() != Some(required.as_str()) {
                run.issue(
                    Severity::Error,
                    Field::Accessory,
                    format!("frame '{}' requires accessory '{}'", frame.id, required),
                    Some(format!("Set accessory to '{required}'")),
                );
                run.alternatives(Field::Accessory, std::iter::once(required.clone()));
            }
        }
        if frame.frame_type == crate::FrameType::Sequence {
            run.issue(
                Severity::Info,
                Field::FrameId,
                "keep pose, outfit and footwear identical across every frame of a sequence"
                    .to_string(),
                None,
            );
        }
    }

    run.finish()
}

/// Footwear whose forward link accepts `outfit`.
fn footwear_for(catalog: &Catalog, outfit: &OutfitEntry) -> BTreeSet<String> {
    catalog
        .all_footwear()
        .filter(|f| f.compatible_outfits.contains(&outfit.id))
        .map(|f| f.id.clone())
        .collect()
}

fn choose_from(options: &BTreeSet<String>) -> String {
    if options.is_empty() {
        return "No compatible options are available".to_string();
    }
    let list: Vec<&str> = options.iter().map(String::as_str).collect();
    format!("Choose one of: {}", list.join(", "))
}

/// Accumulates issues and alternatives for one validation run.
struct Run<'a> {
    catalog: &'a Catalog,
    issues: Vec<ValidationIssue>,
    alternatives: Vec<AlternativeOptions>,
}

impl<'a> Run<'a> {
    const fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            issues: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    fn issue(&mut self, severity: Severity, field: Field, message: String, suggestion: Option<String>) {
        self.issues.push(ValidationIssue {
            severity,
            field,
            message,
            suggestion,
        });
    }

    /// Records alternatives for `field`; the first non-empty list wins.
    fn alternatives(&mut self, field: Field, options: impl IntoIterator<Item = String>) {
        if self.alternatives.iter().any(|a| a.field == field) {
            return;
        }
        let options: BTreeSet<String> = options.into_iter().collect();
        if options.is_empty() {
            return;
        }
        self.alternatives.push(AlternativeOptions {
            field,
            options: options.into_iter().collect(),
        });
    }

    fn resolve_pose(&mut self, id: &str) -> Option<&'a PoseEntry> {
        if id.is_empty() {
            return None;
        }
        let catalog = self.catalog;
        let found = catalog.pose(id);
        if found.is_none() {
            self.unknown(Field::Pose, id);
            self.alternatives(Field::Pose, catalog.poses().map(|p| p.id.clone()));
        }
        found
    }

    fn resolve_outfit(&mut self, id: &str, pose: Option<&PoseEntry>) -> Option<&'a OutfitEntry> {
        if id.is_empty() {
            return None;
        }
        let catalog = self.catalog;
        let found = catalog.outfit(id);
        if found.is_none() {
            self.unknown(Field::Outfit, id);
            match pose {
                Some(pose) => self.alternatives(Field::Outfit, pose.compatible_outfits.iter().cloned()),
                None => self.alternatives(Field::Outfit, catalog.outfits().map(|o| o.id.clone())),
            }
        }
        found
    }

    fn resolve_footwear(
        &mut self,
        id: &str,
        outfit: Option<&OutfitEntry>,
    ) -> Option<&'a crate::catalog::FootwearEntry> {
        if id.is_empty() {
            return None;
        }
        let catalog = self.catalog;
        let found = catalog.footwear(id);
        if found.is_none() {
            self.unknown(Field::Footwear, id);
            match outfit {
                Some(outfit) => self.alternatives(Field::Footwear, footwear_for(catalog, outfit)),
                None => self.alternatives(
                    Field::Footwear,
                    catalog.all_footwear().map(|f| f.id.clone()),
                ),
            }
        }
        found
    }

    fn resolve_accessory(
        &mut self,
        id: &str,
        pose: Option<&PoseEntry>,
    ) -> Option<&'a crate::catalog::AccessoryEntry> {
        let catalog = self.catalog;
        let found = catalog.accessory(id);
        if found.is_none() {
            self.unknown(Field::Accessory, id);
            match pose {
                Some(pose) => self.alternatives(
                    Field::Accessory,
                    pose.compatible_accessories.iter().cloned(),
                ),
                None => self.alternatives(
                    Field::Accessory,
                    catalog.accessories().map(|a| a.id.clone()),
                ),
            }
        }
        found
    }

    fn resolve_frame(&mut self, id: &str, frame_type: crate::FrameType) -> Option<&'a FrameEntry> {
        let catalog = self.catalog;
        let Some(frame) = catalog.frame(id) else {
            self.unknown(Field::FrameId, id);
            self.alternatives(
                Field::FrameId,
                catalog
                    .frames()
                    .filter(|f| f.frame_type == frame_type)
                    .map(|f| f.id.clone()),
            );
            return None;
        };
        if frame.frame_type != frame_type {
            self.issue(
                Severity::Error,
                Field::FrameType,
                format!(
                    "frame '{}' is a {} frame but frameType is {}",
                    frame.id, frame.frame_type, frame_type
                ),
                Some(format!("Set frameType to '{}'", frame.frame_type)),
            );
            return None;
        }
        Some(frame)
    }

    fn unknown(&mut self, field: Field, id: &str) {
        self.issue(
            Severity::Error,
            field,
            format!("unknown {field} '{id}'"),
            Some(format!("Run 'charforge catalog' to list valid {field} ids")),
        );
    }

    fn finish(self) -> ValidationOutcome {
        let is_valid = !self.issues.iter().any(|i| i.severity == Severity::Error);
        ValidationOutcome {
            is_valid,
            errors: self.issues,
            alternative_options: self.alternatives,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::FrameType;

    fn catalog() -> Catalog {
        Catalog::builtin()
    }

    fn base() -> ParameterSet {
        ParameterSet::new("pointing-forward", "hoodie-sweatpants", "air-jordan-1-chicago")
    }

    #[test]
    fn test_minimal_valid_set() {
        let outcome = validate(&base(), &catalog());
        assert!(outcome.is_valid);
        assert!(outcome.errors.is_empty());
        assert!(outcome.alternative_options.is_empty());
    }

    #[test]
    fn test_arms_crossed_cannot_hold_cave_map() {
        let params = ParameterSet::new("arms-crossed", "hoodie-sweatpants", "air-jordan-1-chicago")
            .with_accessory("cave-map");
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        let blocking: Vec<_> = outcome.blocking().collect();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].field, Field::Accessory);
        assert!(blocking[0]
            .suggestion
            .as_deref()
            .unwrap()
            .contains("Remove the accessory"));
    }

    #[test]
    fn test_holding_cave_map_with_cave_map_is_valid() {
        let params =
            ParameterSet::new("holding-cave-map", "hoodie-sweatpants", "air-jordan-1-chicago")
                .with_accessory("cave-map");
        let outcome = validate(&params, &catalog());
        assert!(outcome.is_valid, "{:?}", outcome.errors);
    }

    #[test]
    fn test_missing_required_fields() {
        let params = ParameterSet::default();
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        let fields: Vec<Field> = outcome.blocking().map(|i| i.field).collect();
        assert_eq!(fields, vec![Field::Pose, Field::Outfit, Field::Footwear]);
    }

    #[test]
    fn test_onboarding_requires_frame_id() {
        let mut params = base();
        params.frame_type = Some(FrameType::Onboarding);
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        assert_eq!(outcome.errors[0].field, Field::FrameId);
        assert_eq!(
            outcome.alternatives_for(Field::FrameId).unwrap(),
            ["onboarding-cave-entrance", "onboarding-welcome"]
        );
    }

    #[test]
    fn test_unknown_pose_suggests_all_poses() {
        let mut params = base();
        params.pose = "moonwalk".to_string();
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        assert_eq!(outcome.errors[0].message, "unknown pose 'moonwalk'");
        assert_eq!(outcome.alternatives_for(Field::Pose).unwrap().len(), 5);
    }

    #[test]
    fn test_incompatible_outfit_suggests_from_pose() {
        let params =
            ParameterSet::new("holding-flashlight", "hoodie-sweatpants", "air-jordan-1-chicago");
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        assert_eq!(
            outcome.alternatives_for(Field::Outfit).unwrap(),
            ["explorer-vest-cargo"]
        );
    }

    #[test]
    fn test_missing_reverse_link_is_warning() {
        // arms-crossed lists tracksuit, tracksuit does not list arms-crossed
        let params = ParameterSet::new("arms-crossed", "tracksuit", "air-jordan-1-chicago");
        let outcome = validate(&params, &catalog());

        assert!(outcome.is_valid);
        let warnings: Vec<_> = outcome.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, Field::Outfit);
    }

    #[test]
    fn test_incompatible_footwear_suggests_from_outfit() {
        let params = ParameterSet::new("pointing-forward", "hoodie-sweatpants", "hiking-boots");
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        assert_eq!(
            outcome.alternatives_for(Field::Footwear).unwrap(),
            ["air-jordan-1-chicago", "white-canvas-sneakers"]
        );
    }

    #[test]
    fn test_frame_requires_accessory() {
        let params =
            ParameterSet::new("holding-cave-map", "explorer-vest-cargo", "hiking-boots")
                .with_frame(FrameType::Onboarding, "onboarding-cave-entrance");
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        let blocking: Vec<_> = outcome.blocking().collect();
        assert_eq!(blocking.len(), 1);
        assert!(blocking[0].message.contains("requires accessory 'cave-map'"));
        assert_eq!(
            outcome.alternatives_for(Field::Accessory).unwrap(),
            ["cave-map"]
        );
    }

    #[test]
    fn test_frame_type_mismatch() {
        let params = base()
            .with_accessory("backpack")
            .with_frame(FrameType::Onboarding, "sequence-trail-01");
        let outcome = validate(&params, &catalog());

        assert!(!outcome.is_valid);
        assert!(outcome
            .blocking()
            .any(|i| i.field == Field::FrameType));
    }

    #[test]
    fn test_sequence_frame_adds_info() {
        let params = base()
            .with_accessory("backpack")
            .with_frame(FrameType::Sequence, "sequence-trail-01");
        let outcome = validate(&params, &catalog());

        assert!(outcome.is_valid, "{:?}", outcome.errors);
        assert!(outcome.errors.iter().any(|i| i.severity == Severity::Info));
    }

    #[test]
    fn test_validation_is_deterministic() {
        let params = ParameterSet::new("arms-crossed", "hiking-boots", "nope").with_accessory("x");
        let first = validate(&params, &catalog());
        let second = validate(&params, &catalog());
        assert_eq!(first, second);
    }

    #[test]
    fn test_outcome_serialization() {
        let params = ParameterSet::new("arms-crossed", "hoodie-sweatpants", "air-jordan-1-chicago")
            .with_accessory("cave-map");
        let outcome = validate(&params, &catalog());
        let json = serde_json::to_string(&outcome).unwrap();

        assert!(json.contains(r#""isValid":false"#));
        assert!(json.contains(r#""severity":"error""#));
        assert!(json.contains(r#""field":"accessory""#));
        // arms-crossed has no accessory options, so no alternatives are emitted
        assert!(!json.contains("alternativeOptions"));
    }
}
