//! The static character catalog.
//!
//! The catalog is loaded once at process start and is read-only thereafter.
//! Compatibility is expressed as directed adjacency between entries (a pose
//! lists the outfits it works with, an outfit lists the poses and footwear it
//! works with, and so on). Nothing is inferred transitively.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::params::FrameType;
use crate::{PromptError, Result};

// ============================================================================
// Entries
// ============================================================================

/// A body pose for the character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseEntry {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping used by pickers.
    pub category: String,
    /// Text rendered into the prompt.
    pub prompt_fragment: String,
    /// Outfits this pose can be combined with.
    #[serde(default)]
    pub compatible_outfits: BTreeSet<String>,
    /// Accessories the character can hold or wear in this pose.
    #[serde(default)]
    pub compatible_accessories: BTreeSet<String>,
}

/// An outfit worn by the character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutfitEntry {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping used by pickers.
    pub category: String,
    /// Text rendered into the prompt.
    pub prompt_fragment: String,
    /// Poses that list this outfit back.
    #[serde(default)]
    pub compatible_poses: BTreeSet<String>,
    /// Footwear that pairs with this outfit.
    #[serde(default)]
    pub compatible_footwear: BTreeSet<String>,
}

/// A pair of shoes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FootwearEntry {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping used by pickers.
    pub category: String,
    /// Text rendered into the prompt.
    pub prompt_fragment: String,
    /// Outfits these shoes can be worn with.
    #[serde(default)]
    pub compatible_outfits: BTreeSet<String>,
}

/// A held or worn accessory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessoryEntry {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping used by pickers.
    pub category: String,
    /// Text rendered into the prompt.
    pub prompt_fragment: String,
    /// Poses that can carry this accessory.
    #[serde(default)]
    pub compatible_poses: BTreeSet<String>,
}

/// Exact staging details for a narrative frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDetails {
    /// Where the scene takes place.
    pub location: String,
    /// Where the character stands in the frame.
    pub positioning: String,
    /// Limb angles and proportions.
    pub limb_metrics: String,
    /// Facial expression.
    pub expression: String,
    /// Lighting setup.
    pub lighting: String,
    /// Camera angle and lens.
    pub camera: String,
    /// Background and environment notes.
    pub environment: String,
}

/// A narrative frame (onboarding step or sequence shot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameEntry {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Grouping used by pickers.
    pub category: String,
    /// The frame type this frame belongs to.
    pub frame_type: FrameType,
    /// One-line scene summary rendered into the prompt.
    pub prompt_fragment: String,
    /// Accessories that must be present in the parameter set.
    #[serde(default)]
    pub required_accessories: BTreeSet<String>,
    /// Staging details.
    pub details: FrameDetails,
}

// ============================================================================
// Catalog
// ============================================================================

/// On-disk shape of a catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFile {
    /// All poses.
    #[serde(default)]
    pub poses: Vec<PoseEntry>,
    /// All outfits.
    #[serde(default)]
    pub outfits: Vec<OutfitEntry>,
    /// All footwear.
    #[serde(default)]
    pub footwear: Vec<FootwearEntry>,
    /// All accessories.
    #[serde(default)]
    pub accessories: Vec<AccessoryEntry>,
    /// All frames.
    #[serde(default)]
    pub frames: Vec<FrameEntry>,
}

/// The in-memory catalog, keyed by id.
///
/// Maps are ordered so that every walk over the catalog is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    poses: BTreeMap<String, PoseEntry>,
    outfits: BTreeMap<String, OutfitEntry>,
    footwear: BTreeMap<String, FootwearEntry>,
    accessories: BTreeMap<String, AccessoryEntry>,
    frames: BTreeMap<String, FrameEntry>,
}

impl Catalog {
    /// Builds a catalog from file data and checks referential integrity.
    pub fn from_file_data(file: CatalogFile) -> Result<Self> {
        let catalog = Self {
            poses: file.poses.into_iter().map(|e| (e.id.clone(), e)).collect(),
            outfits: file.outfits.into_iter().map(|e| (e.id.clone(), e)).collect(),
            footwear: file.footwear.into_iter().map(|e| (e.id.clone(), e)).collect(),
            accessories: file
                .accessories
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
            frames: file.frames.into_iter().map(|e| (e.id.clone(), e)).collect(),
        };
        catalog.check_integrity()?;
        Ok(catalog)
    }

    /// Parses a catalog from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(json)?;
        Self::from_file_data(file)
    }

    /// Loads a catalog from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| PromptError::CatalogRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let file: CatalogFile =
            serde_json::from_str(&contents).map_err(|e| PromptError::CatalogParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::from_file_data(file)
    }

    /// Returns the catalog in its on-disk shape.
    #[must_use]
    pub fn to_file_data(&self) -> CatalogFile {
        CatalogFile {
            poses: self.poses.values().cloned().collect(),
            outfits: self.outfits.values().cloned().collect(),
            footwear: self.footwear.values().cloned().collect(),
            accessories: self.accessories.values().cloned().collect(),
            frames: self.frames.values().cloned().collect(),
        }
    }

    /// Looks up a pose.
    #[must_use]
    pub fn pose(&self, id: &str) -> Option<&PoseEntry> {
        self.poses.get(id)
    }

    /// Looks up an outfit.
    #[must_use]
    pub fn outfit(&self, id: &str) -> Option<&OutfitEntry> {
        self.outfits.get(id)
    }

    /// Looks up footwear.
    #[must_use]
    pub fn footwear(&self, id: &str) -> Option<&FootwearEntry> {
        self.footwear.get(id)
    }

    /// Looks up an accessory.
    #[must_use]
    pub fn accessory(&self, id: &str) -> Option<&AccessoryEntry> {
        self.accessories.get(id)
    }

    /// Looks up a frame.
    #[must_use]
    pub fn frame(&self, id: &str) -> Option<&FrameEntry> {
        self.frames.get(id)
    }

    /// Iterates over all poses in id order.
    pub fn poses(&self) -> impl Iterator<Item = &PoseEntry> {
        self.poses.values()
    }

    /// Iterates over all outfits in id order.
    pub fn outfits(&self) -> impl Iterator<Item = &OutfitEntry> {
        self.outfits.values()
    }

    /// Iterates over all footwear in id order.
    pub fn all_footwear(&self) -> impl Iterator<Item = &FootwearEntry> {
        self.footwear.values()
    }

    /// Iterates over all accessories in id order.
    pub fn accessories(&self) -> impl Iterator<Item = &AccessoryEntry> {
        self.accessories.values()
    }

    /// Iterates over all frames in id order.
    pub fn frames(&self) -> impl Iterator<Item = &FrameEntry> {
        self.frames.values()
    }

    /// Verifies that every adjacency id refers to an existing entry.
    pub fn check_integrity(&self) -> Result<()> {
        for pose in self.poses.values() {
            check_refs(&pose.id, "outfit", &pose.compatible_outfits, &self.outfits)?;
            check_refs(
                &pose.id,
                "accessory",
                &pose.compatible_accessories,
                &self.accessories,
            )?;
        }
        for outfit in self.outfits.values() {
            check_refs(&outfit.id, "pose", &outfit.compatible_poses, &self.poses)?;
            check_refs(
                &outfit.id,
                "footwear",
                &outfit.compatible_footwear,
                &self.footwear,
            )?;
        }
        for shoe in self.footwear.values() {
            check_refs(&shoe.id, "outfit", &shoe.compatible_outfits, &self.outfits)?;
        }
        for accessory in self.accessories.values() {
            check_refs(
                &accessory.id,
                "pose",
                &accessory.compatible_poses,
                &self.poses,
            )?;
        }
        for frame in self.frames.values() {
            if frame.frame_type == FrameType::Standard {
                return Err(PromptError::CatalogIntegrity(format!(
                    "frame '{}' must be an onboarding or sequence frame",
                    frame.id
                )));
            }
            check_refs(
                &frame.id,
                "accessory",
                &frame.required_accessories,
                &self.accessories,
            )?;
        }
        Ok(())
    }

    /// Returns the built-in catalog.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn builtin() -> Self {
        let poses = vec![
            PoseEntry {
                id: "pointing-forward".to_string(),
                name: "Pointing Forward".to_string(),
                category: "action".to_string(),
                prompt_fragment: "standing tall with weight balanced, right arm fully extended pointing straight toward the viewer, index finger forward, left hand relaxed at the side".to_string(),
                compatible_outfits: set(&["denim-jacket-jeans", "explorer-vest-cargo", "hoodie-sweatpants", "tracksuit"]),
                compatible_accessories: set(&["backpack", "baseball-cap"]),
            },
            PoseEntry {
                id: "arms-crossed".to_string(),
                name: "Arms Crossed".to_string(),
                category: "attitude".to_string(),
                prompt_fragment: "standing with both arms folded across the chest, hands tucked, weight shifted onto the back foot, chin slightly raised".to_string(),
                compatible_outfits: set(&["denim-jacket-jeans", "hoodie-sweatpants", "tracksuit"]),
                compatible_accessories: BTreeSet::new(),
            },
            PoseEntry {
                id: "holding-cave-map".to_string(),
                name: "Holding Cave Map".to_string(),
                category: "prop".to_string(),
                prompt_fragment: "holding an unfolded map open with both hands at chest height, elbows bent, head tilted down studying the map".to_string(),
                compatible_outfits: set(&["explorer-vest-cargo", "hoodie-sweatpants"]),
                compatible_accessories: set(&["backpack", "cave-map"]),
            },
            PoseEntry {
                id: "waving-hello".to_string(),
                name: "Waving Hello".to_string(),
                category: "greeting".to_string(),
                prompt_fragment: "right hand raised beside the head in a friendly open-palm wave, left hand resting in a pocket, relaxed stance".to_string(),
                compatible_outfits: set(&["denim-jacket-jeans", "hoodie-sweatpants", "tracksuit"]),
                compatible_accessories: set(&["backpack", "baseball-cap"]),
            },
            PoseEntry {
                id: "holding-flashlight".to_string(),
                name: "Holding Flashlight".to_string(),
                category: "prop".to_string(),
                prompt_fragment: "right hand gripping a flashlight at shoulder height aimed ahead, left arm bent forward for balance, leaning into a cautious step".to_string(),
                compatible_outfits: set(&["explorer-vest-cargo"]),
                compatible_accessories: set(&["backpack", "flashlight"]),
            },
        ];

        let outfits = vec![
            OutfitEntry {
                id: "hoodie-sweatpants".to_string(),
                name: "Hoodie and Sweatpants".to_string(),
                category: "casual".to_string(),
                prompt_fragment: "heather grey pullover hoodie with kangaroo pocket and drawstrings, matching tapered grey sweatpants with ribbed cuffs".to_string(),
                compatible_poses: set(&["arms-crossed", "holding-cave-map", "pointing-forward", "waving-hello"]),
                compatible_footwear: set(&["air-jordan-1-chicago", "white-canvas-sneakers"]),
            },
            OutfitEntry {
                id: "denim-jacket-jeans".to_string(),
                name: "Denim Jacket and Jeans".to_string(),
                category: "casual".to_string(),
                prompt_fragment: "mid-wash denim trucker jacket over a plain white t-shirt, slim dark indigo jeans cuffed once at the ankle".to_string(),
                compatible_poses: set(&["arms-crossed", "pointing-forward", "waving-hello"]),
                compatible_footwear: set(&["air-jordan-1-chicago", "white-canvas-sneakers"]),
            },
            OutfitEntry {
                id: "explorer-vest-cargo".to_string(),
                name: "Explorer Vest and Cargo Pants".to_string(),
                category: "adventure".to_string(),
                prompt_fragment: "olive utility vest with four flap pockets over a rolled-sleeve khaki shirt, sand-colored cargo pants".to_string(),
                compatible_poses: set(&["holding-cave-map", "holding-flashlight", "pointing-forward"]),
                compatible_footwear: set(&["air-jordan-1-chicago", "hiking-boots"]),
            },
            OutfitEntry {
                id: "tracksuit".to_string(),
                name: "Tracksuit".to_string(),
                category: "sport".to_string(),
                prompt_fragment: "black zip-up track jacket with white side stripes, matching track pants with elastic ankles".to_string(),
                compatible_poses: set(&["pointing-forward", "waving-hello"]),
                compatible_footwear: set(&["air-jordan-1-chicago", "white-canvas-sneakers"]),
            },
        ];

        let footwear = vec![
            FootwearEntry {
                id: "air-jordan-1-chicago".to_string(),
                name: "Air Jordan 1 Chicago".to_string(),
                category: "sneaker".to_string(),
                prompt_fragment: "Air Jordan 1 High in the Chicago colorway: white leather base, varsity red overlays and heel, black Swoosh and collar, red outsole, Wings logo on the ankle".to_string(),
                compatible_outfits: set(&["denim-jacket-jeans", "explorer-vest-cargo", "hoodie-sweatpants", "tracksuit"]),
            },
            FootwearEntry {
                id: "white-canvas-sneakers".to_string(),
                name: "White Canvas Sneakers".to_string(),
                category: "sneaker".to_string(),
                prompt_fragment: "clean white low-top canvas sneakers with white rubber toe caps and flat white laces".to_string(),
                compatible_outfits: set(&["denim-jacket-jeans", "hoodie-sweatpants", "tracksuit"]),
            },
            FootwearEntry {
                id: "hiking-boots".to_string(),
                name: "Hiking Boots".to_string(),
                category: "boot".to_string(),
                prompt_fragment: "brown suede mid-cut hiking boots with red laces and chunky lugged soles".to_string(),
                compatible_outfits: set(&["explorer-vest-cargo"]),
            },
        ];

        let accessories = vec![
            AccessoryEntry {
                id: "cave-map".to_string(),
                name: "Cave Map".to_string(),
                category: "held".to_string(),
                prompt_fragment: "a weathered parchment cave map with hand-drawn tunnels and a red X marking the destination".to_string(),
                compatible_poses: set(&["holding-cave-map"]),
            },
            AccessoryEntry {
                id: "flashlight".to_string(),
                name: "Flashlight".to_string(),
                category: "held".to_string(),
                prompt_fragment: "a matte black aluminum flashlight casting a soft cone of warm light".to_string(),
                compatible_poses: set(&["holding-flashlight"]),
            },
            AccessoryEntry {
                id: "backpack".to_string(),
                name: "Backpack".to_string(),
                category: "worn".to_string(),
                prompt_fragment: "a compact orange daypack worn on both shoulders with the straps snug".to_string(),
                compatible_poses: set(&["holding-cave-map", "holding-flashlight", "pointing-forward", "waving-hello"]),
            },
            AccessoryEntry {
                id: "baseball-cap".to_string(),
                name: "Baseball Cap".to_string(),
                category: "worn".to_string(),
                prompt_fragment: "a navy baseball cap worn forward with a curved brim".to_string(),
                compatible_poses: set(&["pointing-forward", "waving-hello"]),
            },
        ];

        let frames = vec![
            FrameEntry {
                id: "onboarding-welcome".to_string(),
                name: "Welcome".to_string(),
                category: "onboarding".to_string(),
                frame_type: FrameType::Onboarding,
                prompt_fragment: "the character greets a new visitor at the start of the journey".to_string(),
                required_accessories: BTreeSet::new(),
                details: FrameDetails {
                    location: "a sunlit trailhead clearing with a wooden signpost".to_string(),
                    positioning: "character centered, full body visible, feet on the lower third line".to_string(),
                    limb_metrics: "shoulders level, arms within 30 degrees of the torso unless the pose extends them".to_string(),
                    expression: "warm open smile, eyebrows lifted, eyes on the viewer".to_string(),
                    lighting: "soft late-morning key light from camera left, gentle fill".to_string(),
                    camera: "eye-level, 50mm equivalent, slight three-quarter angle".to_string(),
                    environment: "blurred pine trees behind, no other characters, no text on the signpost".to_string(),
                },
            },
            FrameEntry {
                id: "onboarding-cave-entrance".to_string(),
                name: "Cave Entrance".to_string(),
                category: "onboarding".to_string(),
                frame_type: FrameType::Onboarding,
                prompt_fragment: "the character stands at the mouth of a cave, ready to lead the way inside".to_string(),
                required_accessories: set(&["cave-map"]),
                details: FrameDetails {
                    location: "the arched entrance of a limestone cave".to_string(),
                    positioning: "character on the right third, cave opening filling the left two thirds".to_string(),
                    limb_metrics: "elbows bent at roughly 90 degrees, map held 30cm in front of the chest".to_string(),
                    expression: "focused and curious, slight grin".to_string(),
                    lighting: "cool daylight outside with warm bounce light spilling from the cave".to_string(),
                    camera: "slightly low angle, 35mm equivalent".to_string(),
                    environment: "moss on the rocks, faint dust in the air, darkness receding into the cave".to_string(),
                },
            },
            FrameEntry {
                id: "sequence-trail-01".to_string(),
                name: "Trail Shot 1".to_string(),
                category: "sequence".to_string(),
                frame_type: FrameType::Sequence,
                prompt_fragment: "first shot of the trail sequence, the character sets off along the path".to_string(),
                required_accessories: set(&["backpack"]),
                details: FrameDetails {
                    location: "a dirt trail winding through low hills".to_string(),
                    positioning: "character on the left third walking toward frame right".to_string(),
                    limb_metrics: "stride length about one shoulder width, arms swinging naturally".to_string(),
                    expression: "determined, mouth closed, eyes ahead".to_string(),
                    lighting: "golden-hour sun behind camera right".to_string(),
                    camera: "eye-level side view, 50mm equivalent, locked-off".to_string(),
                    environment: "dry grass, scattered rocks, distant ridge line".to_string(),
                },
            },
            FrameEntry {
                id: "sequence-trail-02".to_string(),
                name: "Trail Shot 2".to_string(),
                category: "sequence".to_string(),
                frame_type: FrameType::Sequence,
                prompt_fragment: "second shot of the trail sequence, the character pauses at a fork in the path".to_string(),
                required_accessories: set(&["backpack"]),
                details: FrameDetails {
                    location: "a fork in the same dirt trail beside a leaning trail marker".to_string(),
                    positioning: "character centered, facing three-quarters toward camera".to_string(),
                    limb_metrics: "feet shoulder-width apart, weight even".to_string(),
                    expression: "thoughtful, eyebrows slightly drawn together".to_string(),
                    lighting: "golden-hour sun behind camera right, matching shot 1".to_string(),
                    camera: "eye-level, 50mm equivalent, same height as shot 1".to_string(),
                    environment: "same hills and ridge line as shot 1, path splitting left and right".to_string(),
                },
            },
        ];

        Self {
            poses: poses.into_iter().map(|e| (e.id.clone(), e)).collect(),
            outfits: outfits.into_iter().map(|e| (e.id.clone(), e)).collect(),
            footwear: footwear.into_iter().map(|e| (e.id.clone(), e)).collect(),
            accessories: accessories.into_iter().map(|e| (e.id.clone(), e)).collect(),
            frames: frames.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }
}

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|id| (*id).to_string()).collect()
}

fn check_refs<T>(
    owner: &str,
    kind: &str,
    refs: &BTreeSet<String>,
    targets: &BTreeMap<String, T>,
) -> Result<()> {
    match refs.iter().find(|id| !targets.contains_key(*id)) {
        Some(missing) => Err(PromptError::CatalogIntegrity(format!(
            "'{owner}' references unknown {kind} '{missing}'"
        ))),
        None => Ok(()),
    }
}
