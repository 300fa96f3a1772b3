//! Built-in effects

mod background_video;
mod original;
mod overlay;

pub use background_video::{
    BackgroundBinding, BackgroundFrameSet, BackgroundVideoDefinition, BackgroundVideoEffect,
};
pub use original::{OriginalDefinition, OriginalEffect};
pub use overlay::{OverlayDefinition, OverlayEffect};

use super::EffectRegistry;

/// Register all built-in effects with the registry
pub fn register_builtin_effects(registry: &mut EffectRegistry) {
    registry.register(BackgroundVideoDefinition);
    registry.register(OriginalDefinition);
    registry.register(OverlayDefinition);
}
