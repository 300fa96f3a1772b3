//! Owned RGBA8 bitmaps with leak accounting
//!
//! Decoded and background frames are large and must be released explicitly.
//! Every bitmap created through a [`BitmapTracker`] holds a lease that is
//! returned when the bitmap is dropped or [`Bitmap::release`]d, so tests and
//! diagnostics can observe how many are still alive.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitmapError {
    #[error("pixel buffer holds {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("bitmap dimensions must be non-zero (got {width}x{height})")]
    Empty { width: u32, height: u32 },
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    released: AtomicUsize,
}

/// Counts bitmaps allocated for one pipeline that have not been released yet
#[derive(Debug, Clone, Default)]
pub struct BitmapTracker {
    counters: Arc<Counters>,
}

impl BitmapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmaps currently alive.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    /// Bitmaps released over the tracker's lifetime.
    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::Acquire)
    }

    /// Allocate a tracked bitmap from tightly packed RGBA rows.
    pub fn allocate(&self, width: u32, height: u32, pixels: Vec<u8>) -> Result<Bitmap, BitmapError> {
        Ok(self.adopt(Bitmap::new(width, height, pixels)?))
    }

    /// Attach a lease to an untracked bitmap. Already-tracked bitmaps keep their lease.
    pub fn adopt(&self, mut bitmap: Bitmap) -> Bitmap {
        if bitmap.lease.is_none() {
            self.counters.live.fetch_add(1, Ordering::AcqRel);
            bitmap.lease = Some(Lease {
                counters: Arc::clone(&self.counters),
            });
        }
        bitmap
    }
}

struct Lease {
    counters: Arc<Counters>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::AcqRel);
        self.counters.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// An RGBA8 image, row-major and tightly packed
///
/// Not `Clone`: a copy has to be requested with [`Bitmap::deep_copy`] so that
/// every pixel buffer has exactly one owner.
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    lease: Option<Lease>,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("tracked", &self.lease.is_some())
            .finish()
    }
}

impl Bitmap {
    pub fn expected_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    /// Wrap an RGBA buffer. The buffer length must be `width * height * 4`.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, BitmapError> {
        if width == 0 || height == 0 {
            return Err(BitmapError::Empty { width, height });
        }
        let expected = Self::expected_size(width, height);
        if pixels.len() != expected {
            return Err(BitmapError::SizeMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
            lease: None,
        })
    }

    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, BitmapError> {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(Self::expected_size(width, height))
            .collect();
        Self::new(width, height, pixels)
    }

    pub fn from_image(image: RgbaImage) -> Result<Self, BitmapError> {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ])
    }

    pub fn is_tracked(&self) -> bool {
        self.lease.is_some()
    }

    /// Copy pixels into a standalone image.
    pub fn to_image(&self) -> RgbaImage {
        // Dimensions were validated on construction
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    /// Copy into a new bitmap charged to the same tracker.
    pub fn deep_copy(&self) -> Bitmap {
        Bitmap {
            width: self.width,
            height: self.height,
            pixels: self.pixels.clone(),
            lease: self.lease.as_ref().map(|lease| {
                lease.counters.live.fetch_add(1, Ordering::AcqRel);
                Lease {
                    counters: Arc::clone(&lease.counters),
                }
            }),
        }
    }

    /// Release the pixel buffer now. Equivalent to dropping the bitmap.
    pub fn release(self) {}
}
