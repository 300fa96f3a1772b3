//! Thumbnail strip of evenly spaced frames

use image::imageops::{self, FilterType};
use image::RgbaImage;

use super::bitmap::{Bitmap, BitmapTracker};
use super::frame::DecodedVideo;

/// Render a `width x height` strip of thumbnails.
///
/// Thumbnails keep the video aspect ratio at the strip height; as many as
/// needed to cover the width are laid out left to right, sampled evenly
/// across the decoded frames. Returns `None` when nothing is decoded yet or
/// the requested size is empty.
pub fn generate_filmstrip(
    video: &DecodedVideo,
    width: u32,
    height: u32,
    tracker: &BitmapTracker,
) -> Option<Bitmap> {
    if video.is_empty() || width == 0 || height == 0 || video.width == 0 || video.height == 0 {
        return None;
    }

    let aspect = video.width as f64 / video.height as f64;
    let thumb_width = ((height as f64 * aspect).round() as u32).max(1);
    let slots = width.div_ceil(thumb_width) as usize;
    let decoded = video.len();

    let mut strip = RgbaImage::new(width, height);
    for slot in 0..slots {
        let index = if slots == 1 {
            0
        } else {
            (slot * (decoded - 1)) / (slots - 1)
        };
        let Some(frame) = video.frame(index) else {
            continue;
        };
        let thumb = imageops::resize(&frame.bitmap.to_image(), thumb_width, height, FilterType::Triangle);
        imageops::replace(&mut strip, &thumb, (slot as u32 * thumb_width) as i64, 0);
    }

    Bitmap::from_image(strip).ok().map(|bitmap| tracker.adopt(bitmap))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::video::{DecodedFrame, Timestamp};

    fn video(tracker: &BitmapTracker, shades: &[u8]) -> DecodedVideo {
        let mut video = DecodedVideo::new(4, 2, shades.len(), 25.0);
        for (i, shade) in shades.iter().enumerate() {
            video.insert(DecodedFrame {
                bitmap: tracker.adopt(Bitmap::solid(4, 2, [*shade, 0, 0, 255]).unwrap()),
                timestamp: Timestamp::from_micros(i as i64 * 40_000),
                duration: Duration::from_millis(40),
                fps: 25.0,
            });
        }
        video
    }

    #[test]
    fn test_strip_samples_first_and_last_frame() {
        let tracker = BitmapTracker::new();
        let video = video(&tracker, &[10, 20, 30, 40, 50]);

        // 2:1 aspect at height 4 gives 8 px thumbs, three of them
        let strip = generate_filmstrip(&video, 24, 4, &tracker).unwrap();
        assert_eq!(strip.dimensions(), (24, 4));
        assert_eq!(strip.pixel(0, 0).unwrap()[0], 10);
        assert_eq!(strip.pixel(12, 2).unwrap()[0], 30);
        assert_eq!(strip.pixel(23, 3).unwrap()[0], 50);
        assert!(strip.is_tracked());
    }

    #[test]
    fn test_partial_last_thumbnail_is_clipped() {
        let tracker = BitmapTracker::new();
        let video = video(&tracker, &[10, 20]);
        let strip = generate_filmstrip(&video, 12, 4, &tracker).unwrap();
        assert_eq!(strip.pixel(11, 0).unwrap()[0], 20);
    }

    #[test]
    fn test_empty_video() {
        let tracker = BitmapTracker::new();
        let video = DecodedVideo::new(4, 2, 3, 25.0);
        assert!(generate_filmstrip(&video, 24, 4, &tracker).is_none());
        assert!(generate_filmstrip(&self::video(&tracker, &[1]), 0, 4, &tracker).is_none());
    }
}
