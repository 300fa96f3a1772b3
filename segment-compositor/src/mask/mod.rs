//! Per-object segmentation masks: wire types, run-length codec and the
//! frame-indexed store the worker renders from.

pub mod rle;
mod store;
mod types;

pub use rle::{DenseMask, MaskDecodeError};
pub use store::{ClearScope, MaskStore};
pub use types::{BoundingBox, Mask, MaskBatch, ObjectId, RleCounts, RleMask, Tracklet};
