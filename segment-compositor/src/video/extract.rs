//! Background-video frame extraction
//!
//! Decodes a second video on a blocking task and keeps a subset of its
//! frames evenly spaced in presentation order, stamped in seconds. The decode races a timer; if the
//! timer wins the decode is stopped and whatever was captured is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::imageops::{self, FilterType};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bitmap::{Bitmap, BitmapTracker};
use super::decoder::{decode_stream, DecodeContext, DecodeError, DecodeProgress, PlatformDecoder, StopToken};
use super::source::VideoSource;
use super::time::Timestamp;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction timed out after {timeout:?} with no frames captured")]
    Timeout { timeout: Duration, captured: usize },
    #[error("background video produced no frames")]
    NoFrames,
    #[error("background video could not be decoded")]
    Decode(#[source] DecodeError),
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// What to extract and how
#[derive(Debug)]
pub struct ExtractionRequest {
    pub source: VideoSource,
    /// Maximum frames kept
    pub frame_budget: usize,
    pub timeout: Duration,
    /// Resize every kept frame to this size
    pub target_size: Option<(u32, u32)>,
    pub read_chunk_bytes: usize,
}

impl ExtractionRequest {
    pub fn new(source: VideoSource, frame_budget: usize, timeout: Duration) -> Self {
        Self {
            source,
            frame_budget,
            timeout,
            target_size: None,
            read_chunk_bytes: 1024 * 1024,
        }
    }
}

/// Parallel timestamp/bitmap arrays, ready to hand to the worker
#[derive(Debug, Default)]
pub struct ExtractedFrames {
    /// Seconds
    pub timestamps: Vec<f64>,
    pub bitmaps: Vec<Bitmap>,
    /// The timer fired before decoding finished
    pub timed_out: bool,
}

impl ExtractedFrames {
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }
}

enum Resolution<T> {
    Finished(T),
    TimedOut(T),
}

/// A blocking job raced against a timer
///
/// Both sides share one stop token, and the `resolved` flag makes sure only
/// the first of them decides the outcome.
struct CancelableTask<T> {
    stop: StopToken,
    resolved: Arc<AtomicBool>,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> CancelableTask<T> {
    fn spawn<F>(job: F) -> Self
    where
        F: FnOnce(StopToken) -> T + Send + 'static,
    {
        let stop = StopToken::new();
        let job_stop = stop.clone();
        let resolved = Arc::new(AtomicBool::new(false));
        let job_resolved = Arc::clone(&resolved);
        Self {
            stop,
            resolved,
            handle: tokio::task::spawn_blocking(move || {
                let value = job(job_stop);
                job_resolved.store(true, Ordering::Release);
                value
            }),
        }
    }

    /// Claim the outcome for the timer. False if the job finished first.
    fn claim(&self) -> bool {
        !self.resolved.swap(true, Ordering::AcqRel)
    }

    async fn resolve_within(mut self, timeout: Duration) -> Result<Resolution<T>, ExtractionError> {
        tokio::select! {
            result = &mut self.handle => {
                let value = result.map_err(|e| ExtractionError::Task(e.to_string()))?;
                return Ok(Resolution::Finished(value));
            }
            _ = tokio::time::sleep(timeout) => {}
        }

        let timed_out = self.claim();
        self.stop.stop();
        let value = self
            .handle
            .await
            .map_err(|e| ExtractionError::Task(e.to_string()))?;
        Ok(if timed_out {
            Resolution::TimedOut(value)
        } else {
            Resolution::Finished(value)
        })
    }
}

struct Harvest {
    frames: Vec<(f64, Bitmap)>,
    error: Option<DecodeError>,
}

/// Decode `request.source` and keep up to `frame_budget` evenly spaced frames.
///
/// On timeout the frames captured so far are returned with `timed_out` set;
/// zero frames on timeout is [`ExtractionError::Timeout`].
pub async fn extract_background_frames<D>(
    request: ExtractionRequest,
    make_decoder: D,
    tracker: BitmapTracker,
) -> Result<ExtractedFrames, ExtractionError>
where
    D: FnOnce() -> Box<dyn PlatformDecoder> + Send + 'static,
{
    let ExtractionRequest {
        source,
        frame_budget,
        timeout,
        target_size,
        read_chunk_bytes,
    } = request;
    let budget = frame_budget.max(1);
    let captured: Arc<Mutex<Vec<(f64, Bitmap)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);

    let task = CancelableTask::spawn(move |stop| {
        let ctx = DecodeContext {
            tracker: tracker.clone(),
            stop,
            read_chunk_bytes,
        };
        let mut stride = 1usize;
        let mut seen = 0usize;
        // Sorted presentation times to keep; empty when the track did not declare them
        let mut wanted: Vec<Timestamp> = Vec::new();
        let result = decode_stream(&ctx, source, make_decoder(), |progress| {
            match progress {
                DecodeProgress::Ready(info) => {
                    if info.frame_count() > 0 {
                        stride = info.frame_count().div_ceil(budget).max(1);
                        wanted = info.presentation_times.iter().step_by(stride).copied().collect();
                    } else {
                        stride = info.sample_count.div_ceil(budget).max(1);
                    }
                    debug!(frames = info.frame_count(), budget, stride, "sampling background video");
                }
                DecodeProgress::Frame(frame) => {
                    let index = seen;
                    seen += 1;
                    let keep = if wanted.is_empty() {
                        index % stride == 0
                    } else {
                        wanted.binary_search(&frame.timestamp).is_ok()
                    };
                    let mut frames = sink.lock();
                    if !keep || frames.len() >= budget {
                        return !ctx.stop.is_stopped();
                    }
                    let bitmap = match target_size {
                        Some((w, h)) if (w, h) != frame.bitmap.dimensions() => {
                            match resize(&frame.bitmap, w, h, &tracker) {
                                Ok(bitmap) => bitmap,
                                Err(e) => {
                                    warn!(frame = index, error = %e, "skipping background frame");
                                    return !ctx.stop.is_stopped();
                                }
                            }
                        }
                        _ => frame.bitmap,
                    };
                    frames.push((frame.timestamp.as_secs_f64(), bitmap));
                }
            }
            !ctx.stop.is_stopped()
        });
        result.err()
    });

    let (error, timed_out) = match task.resolve_within(timeout).await? {
        Resolution::Finished(error) => (error, false),
        Resolution::TimedOut(error) => (error, true),
    };

    let frames = std::mem::take(&mut *captured.lock());
    finish(Harvest { frames, error }, timed_out, timeout)
}

fn resize(bitmap: &Bitmap, width: u32, height: u32, tracker: &BitmapTracker) -> Result<Bitmap, super::BitmapError> {
    let resized = imageops::resize(&bitmap.to_image(), width, height, FilterType::Triangle);
    Ok(tracker.adopt(Bitmap::from_image(resized)?))
}

fn finish(mut harvest: Harvest, timed_out: bool, timeout: Duration) -> Result<ExtractedFrames, ExtractionError> {
    harvest.frames.sort_by(|a, b| a.0.total_cmp(&b.0));

    if harvest.frames.is_empty() {
        return Err(match (timed_out, harvest.error) {
            (true, _) => ExtractionError::Timeout {
                timeout,
                captured: 0,
            },
            (false, Some(error)) => ExtractionError::Decode(error),
            (false, None) => ExtractionError::NoFrames,
        });
    }

    if let Some(error) = &harvest.error {
        warn!(error = %error, kept = harvest.frames.len(), "background decode failed part way, keeping captured frames");
    }
    if timed_out {
        warn!(kept = harvest.frames.len(), ?timeout, "background extraction timed out, keeping captured frames");
    } else {
        info!(frames = harvest.frames.len(), "background frames extracted");
    }

    let (timestamps, bitmaps) = harvest.frames.into_iter().unzip();
    Ok(ExtractedFrames {
        timestamps,
        bitmaps,
        timed_out,
    })
}
