//! Render timing statistics
//!
//! The worker records how long each composited frame took and periodically
//! reports percentiles when statistics are enabled.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Render timing statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderStats {
    /// Average render time in milliseconds
    pub avg_ms: f64,
    /// Minimum render time in milliseconds
    pub min_ms: f64,
    /// Maximum render time in milliseconds
    pub max_ms: f64,
    /// 50th percentile (median) render time
    pub p50_ms: f64,
    /// 95th percentile render time
    pub p95_ms: f64,
    /// 99th percentile render time
    pub p99_ms: f64,
    /// Number of samples in the statistics
    pub sample_count: usize,
    /// Frames rendered since the profiler was created or reset
    pub frames_rendered: u64,
    /// Render rate over the sample window
    pub fps: f64,
}

/// Rolling profiler for render passes
pub struct RenderProfiler {
    durations: VecDeque<Duration>,
    finished_at: VecDeque<Instant>,
    max_samples: usize,
    frames_rendered: u64,
}

impl Default for RenderProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderProfiler {
    /// Keeps the last 300 renders (10 seconds at 30fps)
    pub fn new() -> Self {
        Self::with_capacity(300)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            durations: VecDeque::with_capacity(max_samples),
            finished_at: VecDeque::with_capacity(max_samples),
            max_samples,
            frames_rendered: 0,
        }
    }

    /// Start timing a render; call [`RenderTimer::finish`] when it completes.
    pub fn start(&self) -> RenderTimer {
        RenderTimer {
            started: Instant::now(),
        }
    }

    /// Record one completed render.
    pub fn record(&mut self, duration: Duration) {
        self.durations.push_back(duration);
        if self.durations.len() > self.max_samples {
            self.durations.pop_front();
        }
        self.finished_at.push_back(Instant::now());
        if self.finished_at.len() > self.max_samples {
            self.finished_at.pop_front();
        }
        self.frames_rendered += 1;
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn reset(&mut self) {
        self.durations.clear();
        self.finished_at.clear();
        self.frames_rendered = 0;
    }

    pub fn stats(&self) -> RenderStats {
        if self.durations.is_empty() {
            return RenderStats {
                frames_rendered: self.frames_rendered,
                ..RenderStats::default()
            };
        }

        let mut times: Vec<f64> = self
            .durations
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        times.sort_by(|a, b| a.total_cmp(b));

        let sum: f64 = times.iter().sum();

        RenderStats {
            avg_ms: sum / times.len() as f64,
            min_ms: times.first().copied().unwrap_or(0.0),
            max_ms: times.last().copied().unwrap_or(0.0),
            p50_ms: percentile(&times, 0.50),
            p95_ms: percentile(&times, 0.95),
            p99_ms: percentile(&times, 0.99),
            sample_count: times.len(),
            frames_rendered: self.frames_rendered,
            fps: self.fps(),
        }
    }

    fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.finished_at.front(), self.finished_at.back()) else {
            return 0.0;
        };
        let window = last.duration_since(*first).as_secs_f64();
        if window > 0.0 {
            (self.finished_at.len() - 1) as f64 / window
        } else {
            0.0
        }
    }
}

/// In-flight render measurement
pub struct RenderTimer {
    started: Instant,
}

impl RenderTimer {
    pub fn finish(self, profiler: &mut RenderProfiler) -> Duration {
        let elapsed = self.started.elapsed();
        profiler.record(elapsed);
        elapsed
    }
}

/// Percentile from a sorted slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[idx]
}
