//! Run-length mask codec
//!
//! Runs are laid out column-major and alternate starting with a run of
//! zeros (which may be empty). The compressed string form packs each count
//! into 6-bit characters offset by `'0'`: five payload bits, a continuation
//! bit, and sign extension from the top payload bit of the last character.
//! From the third count on, the value stored is the difference to the count
//! two positions back.

use thiserror::Error;

use super::types::{BoundingBox, RleCounts, RleMask};

/// Largest mask accepted for decoding, 8192x8192
pub const MAX_MASK_PIXELS: u64 = 1 << 26;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaskDecodeError {
    #[error("mask size {height}x{width} is empty")]
    EmptySize { width: u32, height: u32 },
    #[error("mask size {height}x{width} exceeds {MAX_MASK_PIXELS} pixels")]
    TooLarge { width: u32, height: u32 },
    #[error("invalid counts character {character:?} at byte {position}")]
    InvalidCharacter { character: char, position: usize },
    #[error("counts string ends in the middle of a value")]
    UnterminatedValue,
    #[error("counts value at byte {position} is too large")]
    ValueTooLarge { position: usize },
    #[error("run {index} has invalid length {value}")]
    InvalidRun { index: usize, value: i64 },
    #[error("runs cover {covered} pixels, mask has {expected}")]
    LengthMismatch { covered: u64, expected: u64 },
}

/// Row-major single channel mask, 0 or 255 per pixel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseMask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl DenseMask {
    /// All-background mask
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.data[self.index(x, y)] != 0
    }

    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        if x < self.width && y < self.height {
            let i = self.index(x, y);
            self.data[i] = if on { 255 } else { 0 };
        }
    }

    /// Number of foreground pixels
    pub fn coverage(&self) -> u64 {
        self.data.iter().filter(|&&v| v != 0).count() as u64
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

/// Parse the compressed counts string.
pub fn decode_counts_string(counts: &str) -> Result<Vec<u32>, MaskDecodeError> {
    let bytes = counts.as_bytes();
    let mut runs: Vec<u32> = Vec::new();
    let mut p = 0;

    while p < bytes.len() {
        let start = p;
        let mut value: i64 = 0;
        let mut k = 0u32;
        loop {
            let Some(&byte) = bytes.get(p) else {
                return Err(MaskDecodeError::UnterminatedValue);
            };
            if !(48..48 + 64).contains(&byte) {
                return Err(MaskDecodeError::InvalidCharacter {
                    character: byte as char,
                    position: p,
                });
            }
            if k >= 12 {
                return Err(MaskDecodeError::ValueTooLarge { position: start });
            }
            let c = i64::from(byte - 48);
            value |= (c & 0x1f) << (5 * k);
            p += 1;
            k += 1;
            if c & 0x20 == 0 {
                if c & 0x10 != 0 {
                    value |= -1i64 << (5 * k);
                }
                break;
            }
        }

        let m = runs.len();
        if m > 2 {
            value += i64::from(runs[m - 2]);
        }
        if !(0..=i64::from(u32::MAX)).contains(&value) {
            return Err(MaskDecodeError::InvalidRun { index: m, value });
        }
        runs.push(value as u32);
    }
    Ok(runs)
}

/// Pack raw counts into the compressed string form.
pub fn encode_counts_string(runs: &[u32]) -> String {
    let mut out = String::with_capacity(runs.len() * 2);
    for (i, &run) in runs.iter().enumerate() {
        let mut x = i64::from(run);
        if i > 2 {
            x -= i64::from(runs[i - 2]);
        }
        loop {
            let mut c = x & 0x1f;
            x >>= 5;
            let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
            if more {
                c |= 0x20;
            }
            out.push(char::from((c + 48) as u8));
            if !more {
                break;
            }
        }
    }
    out
}

/// Raw run lengths of a mask in either encoding.
pub fn runs(rle: &RleMask) -> Result<Vec<u32>, MaskDecodeError> {
    match &rle.counts {
        RleCounts::Compressed(s) => decode_counts_string(s),
        RleCounts::Runs(runs) => Ok(runs.clone()),
    }
}

fn checked_runs(rle: &RleMask) -> Result<Vec<u32>, MaskDecodeError> {
    let (width, height) = (rle.width(), rle.height());
    if width == 0 || height == 0 {
        return Err(MaskDecodeError::EmptySize { width, height });
    }
    let expected = u64::from(width) * u64::from(height);
    if expected > MAX_MASK_PIXELS {
        return Err(MaskDecodeError::TooLarge { width, height });
    }
    let runs = runs(rle)?;
    let covered: u64 = runs.iter().map(|&r| u64::from(r)).sum();
    if covered != expected {
        return Err(MaskDecodeError::LengthMismatch { covered, expected });
    }
    Ok(runs)
}

/// Expand to a dense mask with the dimensions carried in the payload.
pub fn decode(rle: &RleMask) -> Result<DenseMask, MaskDecodeError> {
    let runs = checked_runs(rle)?;
    let height = rle.height() as usize;
    let mut mask = DenseMask::new(rle.width(), rle.height());

    let mut position = 0usize;
    for (i, &run) in runs.iter().enumerate() {
        let run = run as usize;
        if i % 2 == 1 {
            for p in position..position + run {
                let (x, y) = (p / height, p % height);
                let index = y * mask.width as usize + x;
                mask.data[index] = 255;
            }
        }
        position += run;
    }
    Ok(mask)
}

/// Compress a dense mask into string counts.
pub fn encode(mask: &DenseMask) -> RleMask {
    let (width, height) = (mask.width as usize, mask.height as usize);
    let mut runs = Vec::new();
    let mut current = false;
    let mut run = 0u32;
    for x in 0..width {
        for y in 0..height {
            let on = mask.data[y * width + x] != 0;
            if on != current {
                runs.push(run);
                run = 0;
                current = on;
            }
            run += 1;
        }
    }
    runs.push(run);

    RleMask {
        size: [mask.height, mask.width],
        counts: RleCounts::Compressed(encode_counts_string(&runs)),
    }
}

/// Foreground pixel count
pub fn area(rle: &RleMask) -> Result<u64, MaskDecodeError> {
    let runs = checked_runs(rle)?;
    Ok(runs.iter().skip(1).step_by(2).map(|&r| u64::from(r)).sum())
}

/// Tight box around the foreground, normalized to the mask size.
/// `None` for an empty mask.
pub fn bounding_box(rle: &RleMask) -> Result<Option<BoundingBox>, MaskDecodeError> {
    let runs = checked_runs(rle)?;
    let h = u64::from(rle.height());

    let (mut x0, mut y0) = (u64::MAX, u64::MAX);
    let (mut x1, mut y1) = (0u64, 0u64);
    let mut position = 0u64;
    let mut any = false;

    for (i, &run) in runs.iter().enumerate() {
        let run = u64::from(run);
        if i % 2 == 1 && run > 0 {
            let (first, last) = (position, position + run - 1);
            let (xs, ys) = (first / h, first % h);
            let (xe, ye) = (last / h, last % h);
            x0 = x0.min(xs);
            x1 = x1.max(xe);
            if xs == xe {
                y0 = y0.min(ys);
                y1 = y1.max(ye);
            } else {
                // Spans a column boundary, so both the top and bottom rows are hit
                y0 = 0;
                y1 = h - 1;
            }
            any = true;
        }
        position += run;
    }

    if !any {
        return Ok(None);
    }
    let (w, h) = (f64::from(rle.width()), h as f64);
    Ok(Some(BoundingBox::new(
        (x0 as f64 / w) as f32,
        (y0 as f64 / h) as f32,
        ((x1 - x0 + 1) as f64 / w) as f32,
        ((y1 - y0 + 1) as f64 / h) as f32,
    )))
}
