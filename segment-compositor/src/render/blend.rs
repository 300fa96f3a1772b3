//! Per-pixel compositing math. `shaders/composite.wgsl` mirrors these
//! functions; keep them in step.

/// Foreground wins wherever any mask covers the pixel. Elsewhere the frame
/// is mixed toward the background by `background.a * strength`, so a fully
/// transparent background leaves the frame untouched.
pub fn background_blend(frame: [f32; 4], background: [f32; 4], coverage: f32, strength: f32) -> [f32; 4] {
    if coverage > 0.0 {
        return frame;
    }
    let t = (background[3] * strength).clamp(0.0, 1.0);
    std::array::from_fn(|i| frame[i] * (1.0 - t) + background[i] * t)
}

/// Source-over of `color` (alpha scaled by `opacity`) onto `dst`.
pub fn mask_overlay(dst: [f32; 4], color: [f32; 4], opacity: f32) -> [f32; 4] {
    let a = (color[3] * opacity).clamp(0.0, 1.0);
    [
        color[0] * a + dst[0] * (1.0 - a),
        color[1] * a + dst[1] * (1.0 - a),
        color[2] * a + dst[2] * (1.0 - a),
        a + dst[3] * (1.0 - a),
    ]
}

pub(crate) fn to_unorm(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub(crate) fn from_unorm(value: u8) -> f32 {
    value as f32 / 255.0
}
