// src/landmarks.rs
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LANDMARK_COUNT: usize = 21;
pub const BONE_COUNT: usize = 20;

// MediaPipe hand landmark indices
pub const WRIST: usize = 0;
pub const THUMB_CMC: usize = 1;
pub const THUMB_MCP: usize = 2;
pub const INDEX_FINGER_MCP: usize = 5;
pub const INDEX_FINGER_TIP: usize = 8;
pub const MIDDLE_FINGER_MCP: usize = 9;
pub const RING_FINGER_MCP: usize = 13;
pub const PINKY_MCP: usize = 17;

/// Bone segments as landmark index pairs, finger by finger from the wrist.
pub const BONES: [(usize, usize); BONE_COUNT] = [
    (0, 1), (1, 2), (2, 3), (3, 4),         // thumb
    (0, 5), (5, 6), (6, 7), (7, 8),         // index
    (0, 9), (9, 10), (10, 11), (11, 12),    // middle
    (0, 13), (13, 14), (14, 15), (15, 16),  // ring
    (0, 17), (17, 18), (18, 19), (19, 20),  // pinky
];

/// Outline of the palm polygon, walked wrist -> thumb base -> knuckles.
pub const PALM_OUTLINE: [usize; 7] = [
    WRIST,
    THUMB_CMC,
    THUMB_MCP,
    INDEX_FINGER_MCP,
    MIDDLE_FINGER_MCP,
    RING_FINGER_MCP,
    PINKY_MCP,
];

/// A single landmark as reported by the model: `x`/`y` normalized to the
/// image (0..1), `z` depth relative to the wrist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    pub const BOTH: [Handedness; 2] = [Handedness::Left, Handedness::Right];

    /// Anything that is not exactly `"Left"` is drawn as the right hand,
    /// including a label the model did not send.
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            Some("Left") => Handedness::Left,
            _ => Handedness::Right,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Handedness::Left => "Left",
            Handedness::Right => "Right",
        }
    }
}

impl fmt::Display for Handedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One value per hand, indexed by [`Handedness`].
#[derive(Debug, Clone, Default)]
pub struct PerHand<T> {
    pub left: T,
    pub right: T,
}

impl<T> PerHand<T> {
    pub fn new(mut make: impl FnMut(Handedness) -> T) -> Self {
        Self {
            left: make(Handedness::Left),
            right: make(Handedness::Right),
        }
    }

    pub fn get(&self, hand: Handedness) -> &T {
        match hand {
            Handedness::Left => &self.left,
            Handedness::Right => &self.right,
        }
    }
}

/// Linear map from normalized model coordinates into visualization space.
///
/// The image is mirrored horizontally and flipped vertically so the hand
/// faces the viewer, then lifted by `vertical_offset` so it floats above the
/// scene origin. Depth is negated so points closer to the camera come
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneMapping {
    pub scale: f32,
    pub vertical_offset: f32,
}

impl Default for SceneMapping {
    fn default() -> Self {
        Self {
            scale: 4.0,
            vertical_offset: 2.0,
        }
    }
}

impl SceneMapping {
    pub fn to_scene(&self, lm: &Landmark) -> Vector3<f32> {
        self.to_scene_with_offset(lm, self.vertical_offset)
    }

    /// Same mapping with a caller-chosen vertical lift, used by overlays
    /// that sit above the landmark they annotate.
    pub fn to_scene_with_offset(&self, lm: &Landmark, vertical_offset: f32) -> Vector3<f32> {
        Vector3::new(
            -(lm.x - 0.5) * self.scale,
            -(lm.y - 0.5) * self.scale + vertical_offset,
            -lm.z * self.scale,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn image_center_maps_to_lifted_origin() {
        let mapping = SceneMapping::default();
        let p = mapping.to_scene(&Landmark::new(0.5, 0.5, 0.0));
        assert_relative_eq!(p, Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn mapping_mirrors_flips_and_scales() {
        let mapping = SceneMapping::default();
        let p = mapping.to_scene(&Landmark::new(0.0, 0.0, 0.25));
        assert_relative_eq!(p.x, 2.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 4.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, -1.0, epsilon = 1e-6);

        let p = mapping.to_scene(&Landmark::new(1.0, 1.0, -0.5));
        assert_relative_eq!(p, Vector3::new(-2.0, 0.0, 2.0), epsilon = 1e-6);
    }

    #[test]
    fn custom_vertical_offset() {
        let mapping = SceneMapping::default();
        let p = mapping.to_scene_with_offset(&Landmark::new(0.5, 0.5, 0.0), 2.4);
        assert_relative_eq!(p.y, 2.4, epsilon = 1e-6);
    }

    #[test]
    fn handedness_defaults_to_right() {
        assert_eq!(Handedness::from_label(Some("Left")), Handedness::Left);
        assert_eq!(Handedness::from_label(Some("Right")), Handedness::Right);
        assert_eq!(Handedness::from_label(Some("left")), Handedness::Right);
        assert_eq!(Handedness::from_label(Some("")), Handedness::Right);
        assert_eq!(Handedness::from_label(None), Handedness::Right);
    }

    #[test]
    fn bones_cover_every_landmark_once_as_child() {
        let mut children: Vec<usize> = BONES.iter().map(|&(_, b)| b).collect();
        children.sort_unstable();
        assert_eq!(children, (1..LANDMARK_COUNT).collect::<Vec<_>>());
        assert!(BONES.iter().all(|&(a, b)| a < LANDMARK_COUNT && b < LANDMARK_COUNT));
    }
}
