//! Effects drawn per frame onto the canvas
//!
//! # Architecture
//!
//! - **Traits** (`traits.rs`): `EffectDefinition` factories and the `Effect`
//!   instance contract {update, apply, cleanup}
//! - **Registry** (`registry.rs`): effect identifiers mapped to definitions
//! - **Slots** (`slots.rs`): the active effect per slot, torn down before a
//!   replacement is activated
//! - **Textures** (`textures.rs`): lazily sized frame and mask textures
//! - **Builtin** (`builtin/`): `original`, `overlay`, `background_video`
//!
//! Slot 0 draws the base image (background replacement or the plain
//! frame); slot 1 draws highlights on top of it.

pub mod builtin;
mod registry;
mod slots;
mod textures;
mod traits;
mod variant;

pub use registry::EffectRegistry;
pub use slots::{EffectSlots, BACKGROUND_SLOT, HIGHLIGHT_SLOT, SLOT_COUNT};
pub use textures::{FrameTexture, MaskTextures};
pub use traits::{
    BackgroundUpdate, Effect, EffectDefinition, EffectError, EffectOptions, EffectSettings,
    FrameContext, MismatchedLengthError,
};
pub use variant::{wrap_variant, VariantTable};
