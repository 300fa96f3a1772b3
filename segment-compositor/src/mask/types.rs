//! Mask wire types
//!
//! Field names follow the mask service's JSON: a batch is
//! `{"frameIndex": 3, "results": [{"objectId": 1, "mask": {"size": [h, w], "counts": "..."}}]}`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tracklet identity assigned by the mask service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lengths, either as the compact string form or as raw integers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    Compressed(String),
    Runs(Vec<u32>),
}

/// Column-major run-length mask. `size` is `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RleMask {
    pub size: [u32; 2],
    pub counts: RleCounts,
}

impl RleMask {
    pub fn height(&self) -> u32 {
        self.size[0]
    }

    pub fn width(&self) -> u32 {
        self.size[1]
    }
}

/// Axis-aligned box in coordinates normalized to the full frame (0..1)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// The whole frame
    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Whether the normalized point lies inside (right/bottom edges exclusive).
    pub fn contains(&self, u: f32, v: f32) -> bool {
        u >= self.x && u < self.x + self.width && v >= self.y && v < self.y + self.height
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

/// One object's mask on one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mask {
    pub object_id: ObjectId,
    #[serde(rename = "mask")]
    pub rle: RleMask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// Masks produced for a single frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskBatch {
    pub frame_index: usize,
    #[serde(rename = "results")]
    pub masks: Vec<Mask>,
}

const PALETTE: [[f32; 4]; 8] = [
    [0.118, 0.565, 1.000, 1.0],
    [1.000, 0.392, 0.278, 1.0],
    [0.196, 0.804, 0.196, 1.0],
    [1.000, 0.843, 0.000, 1.0],
    [0.729, 0.333, 0.827, 1.0],
    [0.000, 0.808, 0.820, 1.0],
    [1.000, 0.412, 0.706, 1.0],
    [0.957, 0.643, 0.376, 1.0],
];

/// Tracked object and the color it is highlighted with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tracklet {
    pub id: ObjectId,
    pub color: [f32; 4],
}

impl Tracklet {
    /// Tracklet with its palette color
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            color: PALETTE[id.0 as usize % PALETTE.len()],
        }
    }
}
