//! Deterministic prompt assembly.
//!
//! A parameter set renders into exactly one positive prompt and one negative
//! prompt. Sections are emitted in a fixed order and joined by
//! [`SECTION_SEPARATOR`]; the same inputs always produce byte-identical
//! output, which is what makes prompt caching sound.

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, FrameEntry};
use crate::params::{FrameType, ParameterSet};
use crate::{PromptError, Result};

/// Separator placed between positive-prompt sections.
pub const SECTION_SEPARATOR: &str = "\n\n";

/// Separator placed between negative-prompt blocks.
const NEGATIVE_SEPARATOR: &str = ", ";

// ============================================================================
// Boilerplate
// ============================================================================

const CHARACTER_FOUNDATION: &str = "Character: a friendly young adult explorer mascot with warm brown skin, short curly black hair, expressive dark eyes and a confident smile. Consistent facial features, proportions and skin tone across every image. Full body visible from head to toe.";

const ENVIRONMENT_FOUNDATION: &str = "Environment: clean, softly lit setting that keeps the character as the clear focal point. No other people, no text, no logos other than on the footwear.";

const TECHNICAL_STANDARD: &str = "Technical: portrait orientation, 3:4 aspect ratio, centered subject, plain light-grey studio backdrop, even three-point studio lighting, sharp focus on the full figure.";

const TECHNICAL_ONBOARDING: &str = "Technical: landscape orientation, 16:9 aspect ratio, character placed on the rule-of-thirds line, cinematic depth of field, narrative illustration framing with room for overlay copy.";

const TECHNICAL_SEQUENCE: &str = "Technical: landscape orientation, 16:9 aspect ratio, identical character scale and camera height to the other shots in the sequence, matching color grade, continuity-locked wardrobe.";

const BRAND_ACCURACY: &str = "Brand accuracy: footwear must match the real product exactly, including panel layout, colors, stitching, logo placement and sole shape. Do not invent colorways.";

const RENDER_BOOST: &str = "Rendering: ultra high resolution, 4k detail, physically based materials, crisp fabric texture, professional color grading, masterpiece quality.";

const GLOBAL_NEGATIVE: &str = "blurry, low resolution, deformed hands, extra fingers, missing limbs, distorted face, asymmetrical eyes, watermark, text, signature, cropped feet, nsfw, violence, off-brand footwear, incorrect logo";

const SEQUENCE_NEGATIVE: &str = "inconsistent outfit, changed hairstyle, different character, mismatched lighting between shots, camera height change";

const ONBOARDING_NEGATIVE: &str = "cluttered composition, busy background, frightening imagery, dark mood, character facing away";

// ============================================================================
// Output
// ============================================================================

/// The canonical prompt pair for one parameter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledPrompt {
    /// Positive prompt sent to the provider.
    pub positive: String,
    /// Negative prompt sent to the provider.
    pub negative: String,
    /// Hash of the normalized parameter set this prompt was rendered from.
    pub parameters_hash: String,
}

// ============================================================================
// Assembler
// ============================================================================

/// Renders parameter sets against a catalog.
#[derive(Debug, Clone, Copy)]
pub struct PromptAssembler<'a> {
    catalog: &'a Catalog,
}

impl<'a> PromptAssembler<'a> {
    /// Creates an assembler over `catalog`.
    #[must_use]
    pub const fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Assembles the prompt pair for `params`.
    ///
    /// The parameter set should already have passed validation; unknown ids
    /// are still reported as [`PromptError::UnknownEntry`] rather than
    /// rendered as blanks.
    pub fn assemble(&self, params: &ParameterSet) -> Result<AssembledPrompt> {
        let params = params.normalized();
        let frame_type = params.effective_frame_type();

        let pose = self
            .catalog
            .pose(&params.pose)
            .ok_or_else(|| PromptError::unknown("pose", &params.pose))?;
        let outfit = self
            .catalog
            .outfit(&params.outfit)
            .ok_or_else(|| PromptError::unknown("outfit", &params.outfit))?;
        let footwear = self
            .catalog
            .footwear(&params.footwear)
            .ok_or_else(|| PromptError::unknown("footwear", &params.footwear))?;
        let accessory = params
            .accessory
            .as_deref()
            .map(|id| {
                self.catalog
                    .accessory(id)
                    .ok_or_else(|| PromptError::unknown("accessory", id))
            })
            .transpose()?;
        let frame = params
            .frame_id
            .as_deref()
            .map(|id| {
                self.catalog
                    .frame(id)
                    .ok_or_else(|| PromptError::unknown("frame", id))
            })
            .transpose()?;

        let mut sections: Vec<String> = Vec::with_capacity(10);
        sections.push(CHARACTER_FOUNDATION.to_string());
        sections.push(format!("Pose: {}.", pose.prompt_fragment));
        sections.push(format!("Outfit: {}.", outfit.prompt_fragment));
        sections.push(format!("Footwear: {}.", footwear.prompt_fragment));
        if let Some(accessory) = accessory {
            sections.push(format!("Accessory: {}.", accessory.prompt_fragment));
        }
        if let Some(frame) = frame {
            sections.push(frame_block(frame));
        }
        sections.push(ENVIRONMENT_FOUNDATION.to_string());
        sections.push(technical_block(frame_type).to_string());
        sections.push(BRAND_ACCURACY.to_string());
        sections.push(RENDER_BOOST.to_string());

        Ok(AssembledPrompt {
            positive: sections.join(SECTION_SEPARATOR),
            negative: negative_prompt(frame_type),
            parameters_hash: params.hash(),
        })
    }
}

fn frame_block(frame: &FrameEntry) -> String {
    let d = &frame.details;
    [
        format!("Scene: {}.", frame.prompt_fragment),
        format!("Location: {}.", d.location),
        format!("Positioning: {}.", d.positioning),
        format!("Limb metrics: {}.", d.limb_metrics),
        format!("Expression: {}.", d.expression),
        format!("Lighting: {}.", d.lighting),
        format!("Camera: {}.", d.camera),
        format!("Environment notes: {}.", d.environment),
    ]
    .join("\n")
}

const fn technical_block(frame_type: FrameType) -> &'static str {
    match frame_type {
        FrameType::Standard => TECHNICAL_STANDARD,
        FrameType::Onboarding => TECHNICAL_ONBOARDING,
        FrameType::Sequence => TECHNICAL_SEQUENCE,
    }
}

fn negative_prompt(frame_type: FrameType) -> String {
    let mut blocks = vec![GLOBAL_NEGATIVE];
    match frame_type {
        FrameType::Sequence => blocks.push(SEQUENCE_NEGATIVE),
        FrameType::Onboarding => blocks.push(ONBOARDING_NEGATIVE),
        FrameType::Standard => {}
    }
    blocks.join(NEGATIVE_SEPARATOR)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base() -> ParameterSet {
        ParameterSet::new("pointing-forward", "hoodie-sweatpants", "air-jordan-1-chicago")
    }

    #[test]
    fn test_assembly_is_byte_identical() {
        let catalog = Catalog::builtin();
        let assembler = PromptAssembler::new(&catalog);
        let params = base().with_accessory("backpack");

        let first = assembler.assemble(&params).unwrap();
        let second = assembler.assemble(&params).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sections_in_fixed_order() {
        let catalog = Catalog::builtin();
        let prompt = PromptAssembler::new(&catalog)
            .assemble(&base().with_accessory("baseball-cap"))
            .unwrap();

        let sections: Vec<&str> = prompt.positive.split(SECTION_SEPARATOR).collect();
        assert_eq!(sections.len(), 9);
        assert!(sections[0].starts_with("Character:"));
        assert!(sections[1].starts_with("Pose:"));
        assert!(sections[2].starts_with("Outfit:"));
        assert!(sections[3].starts_with("Footwear:"));
        assert!(sections[4].starts_with("Accessory:"));
        assert!(sections[5].starts_with("Environment:"));
        assert_eq!(sections[6], TECHNICAL_STANDARD);
        assert!(sections[7].starts_with("Brand accuracy:"));
        assert!(sections[8].starts_with("Rendering:"));
    }

    #[test]
    fn test_accessory_section_omitted_when_absent() {
        let catalog = Catalog::builtin();
        let prompt = PromptAssembler::new(&catalog).assemble(&base()).unwrap();
        assert!(!prompt.positive.contains("Accessory:"));
        assert_eq!(prompt.positive.split(SECTION_SEPARATOR).count(), 8);
    }

    #[test]
    fn test_standard_negative_prompt() {
        let catalog = Catalog::builtin();
        let prompt = PromptAssembler::new(&catalog).assemble(&base()).unwrap();
        insta::assert_snapshot!(prompt.negative, @"blurry, low resolution, deformed hands, extra fingers, missing limbs, distorted face, asymmetrical eyes, watermark, text, signature, cropped feet, nsfw, violence, off-brand footwear, incorrect logo");
    }

    #[test]
    fn test_onboarding_frame_block_and_negative() {
        let catalog = Catalog::builtin();
        let params = ParameterSet::new("holding-cave-map", "explorer-vest-cargo", "hiking-boots")
            .with_accessory("cave-map")
            .with_frame(FrameType::Onboarding, "onboarding-cave-entrance");
        let prompt = PromptAssembler::new(&catalog).assemble(&params).unwrap();

        assert!(prompt.positive.contains("Scene: the character stands at the mouth of a cave"));
        assert!(prompt.positive.contains("Limb metrics:"));
        assert!(prompt.positive.contains(TECHNICAL_ONBOARDING));
        assert!(prompt.negative.starts_with(GLOBAL_NEGATIVE));
        assert!(prompt.negative.ends_with(ONBOARDING_NEGATIVE));
        assert!(!prompt.negative.contains(SEQUENCE_NEGATIVE));
    }

    #[test]
    fn test_sequence_negative_adds_continuity_terms() {
        let catalog = Catalog::builtin();
        let params = base()
            .with_accessory("backpack")
            .with_frame(FrameType::Sequence, "sequence-trail-02");
        let prompt = PromptAssembler::new(&catalog).assemble(&params).unwrap();

        assert!(prompt.positive.contains(TECHNICAL_SEQUENCE));
        assert_eq!(
            prompt.negative,
            format!("{GLOBAL_NEGATIVE}, {SEQUENCE_NEGATIVE}")
        );
    }

    #[test]
    fn test_explicit_standard_matches_absent() {
        let catalog = Catalog::builtin();
        let assembler = PromptAssembler::new(&catalog);
        let mut explicit = base();
        explicit.frame_type = Some(FrameType::Standard);

        assert_eq!(
            assembler.assemble(&explicit).unwrap(),
            assembler.assemble(&base()).unwrap()
        );
    }

    #[test]
    fn test_hash_matches_parameter_hash() {
        let catalog = Catalog::builtin();
        let prompt = PromptAssembler::new(&catalog).assemble(&base()).unwrap();
        assert_eq!(prompt.parameters_hash, base().hash());
    }

    #[test]
    fn test_unknown_entry_is_an_error() {
        let catalog = Catalog::builtin();
        let params = ParameterSet::new("moonwalk", "hoodie-sweatpants", "air-jordan-1-chicago");
        let err = PromptAssembler::new(&catalog).assemble(&params).unwrap_err();
        assert!(matches!(err, PromptError::UnknownEntry { kind: "pose", .. }));
    }
}
