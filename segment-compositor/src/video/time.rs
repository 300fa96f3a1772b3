//! Presentation time in microseconds
//!
//! The decode pipeline counts in microseconds while background frames are
//! stamped in seconds. Conversions between the two go through the explicit
//! constructors here rather than bare arithmetic at call sites.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A presentation timestamp in microseconds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Convert a value counted in `timescale` units per second.
    pub fn from_media_units(value: i64, timescale: u32) -> Self {
        if timescale == 0 {
            return Self::ZERO;
        }
        let micros = (value as i128 * 1_000_000) / timescale as i128;
        Self(micros.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1_000_000.0).round() as i64)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Distance to `later`, zero when `later` is not after `self`.
    pub fn until(self, later: Timestamp) -> Duration {
        Duration::from_micros(later.0.saturating_sub(self.0).max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Duration of `units` media-time ticks at `timescale` per second.
pub fn media_duration(units: u64, timescale: u32) -> Duration {
    if timescale == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(((units as u128 * 1_000_000) / timescale as u128) as u64)
}
