//! Segment Compositor Library
//!
//! Decodes MP4 video on a dedicated worker thread and composites each frame
//! with segmentation masks through pluggable effects, such as replacing
//! everything outside the masked objects with frames of a background video.

pub mod effects;
pub mod error;
pub mod mask;
pub mod mask_stream;
pub mod render;
pub mod settings;
pub mod telemetry;
pub mod video;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ErrorKind, ErrorPayload, PipelineError};
pub use settings::PipelineSettings;
pub use worker::{Command, Event, PipelineHandle};
