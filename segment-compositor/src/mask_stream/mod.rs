//! Client side of the segmentation service
//!
//! [`MaskServiceClient`] manages sessions and tracklets and opens mask
//! streams; [`forward_masks`] feeds a stream into the worker so rendering
//! never waits on inference.

mod bridge;
mod client;
pub mod multipart;

pub use bridge::{forward_masks, ForwardSummary, MaskStreamTask};
pub use client::{parse_mask_stream, MaskServiceClient, MaskSession, MaskStream, MaskStreamError, PointsUpdate};
