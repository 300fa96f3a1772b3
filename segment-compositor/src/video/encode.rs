//! Sinks for rendered output frames
//!
//! Frames arrive in strictly increasing index order between `begin` and
//! `end`. The ffmpeg sink streams raw RGBA into a spawned `ffmpeg` process;
//! the PNG sink writes one numbered file per frame.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),
    #[error("ffmpeg is required for video output but was not found on PATH")]
    FfmpegMissing,
    #[error("failed to spawn ffmpeg")]
    Spawn(#[source] std::io::Error),
    #[error("ffmpeg exited with {status}: {stderr}")]
    FfmpegFailed { status: String, stderr: String },
    #[error("frame {index} pushed after frame {last}")]
    OutOfOrder { index: usize, last: usize },
    #[error("frame is {actual:?}, sink expects {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("sink was not started")]
    NotStarted,
    #[error("I/O error while encoding")]
    Io(#[from] std::io::Error),
    #[error("failed to write image")]
    Image(#[from] image::ImageError),
}

/// Passed to [`FrameSink::begin`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: usize,
}

/// Consumer of rendered frames
pub trait FrameSink: Send {
    fn begin(&mut self, config: SinkConfig) -> Result<(), EncodeError>;
    fn push_frame(&mut self, index: usize, frame: &RgbaImage) -> Result<(), EncodeError>;
    fn end(&mut self) -> Result<(), EncodeError>;
}

/// Checks shared by every sink
#[derive(Debug, Default)]
struct Sequencer {
    config: Option<SinkConfig>,
    last: Option<usize>,
}

impl Sequencer {
    fn begin(&mut self, config: SinkConfig) -> Result<(), EncodeError> {
        if config.width == 0 || config.height == 0 {
            return Err(EncodeError::InvalidConfig("width/height must be non-zero".into()));
        }
        if !(config.fps.is_finite() && config.fps > 0.0) {
            return Err(EncodeError::InvalidConfig(format!("fps must be positive (got {})", config.fps)));
        }
        self.config = Some(config);
        self.last = None;
        Ok(())
    }

    fn admit(&mut self, index: usize, frame: &RgbaImage) -> Result<SinkConfig, EncodeError> {
        let config = self.config.ok_or(EncodeError::NotStarted)?;
        if let Some(last) = self.last {
            if index <= last {
                return Err(EncodeError::OutOfOrder { index, last });
            }
        }
        if frame.dimensions() != (config.width, config.height) {
            return Err(EncodeError::SizeMismatch {
                expected: (config.width, config.height),
                actual: frame.dimensions(),
            });
        }
        self.last = Some(index);
        Ok(config)
    }
}

/// Options for [`FfmpegSink`]
#[derive(Debug, Clone)]
pub struct FfmpegSinkOpts {
    pub out_path: PathBuf,
    pub overwrite: bool,
}

impl FfmpegSinkOpts {
    pub fn new(out_path: impl Into<PathBuf>) -> Self {
        Self {
            out_path: out_path.into(),
            overwrite: true,
        }
    }
}

/// Streams frames into `ffmpeg` for H.264 MP4 output
pub struct FfmpegSink {
    opts: FfmpegSinkOpts,
    sequencer: Sequencer,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<std::thread::JoinHandle<std::io::Result<Vec<u8>>>>,
}

impl FfmpegSink {
    pub fn new(opts: FfmpegSinkOpts) -> Self {
        Self {
            opts,
            sequencer: Sequencer::default(),
            child: None,
            stdin: None,
            stderr_drain: None,
        }
    }
}

pub fn is_ffmpeg_on_path() -> bool {
    which::which("ffmpeg").is_ok()
}

impl FrameSink for FfmpegSink {
    fn begin(&mut self, config: SinkConfig) -> Result<(), EncodeError> {
        if config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(EncodeError::InvalidConfig(
                "width/height must be even for yuv420p output".into(),
            ));
        }
        self.sequencer.begin(config)?;
        ensure_parent_dir(&self.opts.out_path)?;
        let ffmpeg = which::which("ffmpeg").map_err(|_| EncodeError::FfmpegMissing)?;

        let mut cmd = Command::new(ffmpeg);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .arg(if self.opts.overwrite { "-y" } else { "-n" })
            .args([
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", config.width, config.height),
                "-framerate",
                &format!("{:.6}", config.fps),
                "-i",
                "pipe:0",
                "-an",
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ])
            .arg(&self.opts.out_path);

        let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
        let stdin = child.stdin.take().ok_or(EncodeError::NotStarted)?;
        let mut stderr = child.stderr.take().ok_or(EncodeError::NotStarted)?;
        self.stderr_drain = Some(std::thread::spawn(move || {
            let mut bytes = Vec::new();
            stderr.read_to_end(&mut bytes)?;
            Ok(bytes)
        }));
        self.child = Some(child);
        self.stdin = Some(stdin);
        info!(path = %self.opts.out_path.display(), width = config.width, height = config.height, "ffmpeg encode started");
        Ok(())
    }

    fn push_frame(&mut self, index: usize, frame: &RgbaImage) -> Result<(), EncodeError> {
        self.sequencer.admit(index, frame)?;
        let stdin = self.stdin.as_mut().ok_or(EncodeError::NotStarted)?;
        stdin.write_all(frame.as_raw())?;
        Ok(())
    }

    fn end(&mut self) -> Result<(), EncodeError> {
        // Closing stdin tells ffmpeg the input is complete
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Err(EncodeError::NotStarted);
        };
        let status = child.wait()?;
        let stderr = match self.stderr_drain.take() {
            Some(handle) => handle
                .join()
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => Vec::new(),
        };
        if !status.success() {
            return Err(EncodeError::FfmpegFailed {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        info!(path = %self.opts.out_path.display(), "ffmpeg encode finished");
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Writes `frame_00000.png`, `frame_00001.png`, ... into a directory
pub struct PngSequenceSink {
    dir: PathBuf,
    sequencer: Sequencer,
    written: usize,
}

impl PngSequenceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequencer: Sequencer::default(),
            written: 0,
        }
    }

    pub fn frame_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("frame_{index:05}.png"))
    }
}

impl FrameSink for PngSequenceSink {
    fn begin(&mut self, config: SinkConfig) -> Result<(), EncodeError> {
        self.sequencer.begin(config)?;
        std::fs::create_dir_all(&self.dir)?;
        self.written = 0;
        Ok(())
    }

    fn push_frame(&mut self, index: usize, frame: &RgbaImage) -> Result<(), EncodeError> {
        self.sequencer.admit(index, frame)?;
        frame.save(self.frame_path(index))?;
        self.written += 1;
        Ok(())
    }

    fn end(&mut self) -> Result<(), EncodeError> {
        debug!(dir = %self.dir.display(), frames = self.written, "png sequence written");
        Ok(())
    }
}

/// Frames captured by a [`MemorySink`]
#[derive(Debug, Default)]
pub struct CapturedFrames {
    pub config: Option<SinkConfig>,
    pub frames: Vec<(usize, RgbaImage)>,
    pub finished: bool,
}

/// Keeps frames in memory; clones share the same capture
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    captured: Arc<Mutex<CapturedFrames>>,
    sequencer: Arc<Mutex<Sequencer>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> parking_lot::MutexGuard<'_, CapturedFrames> {
        self.captured.lock()
    }
}

impl FrameSink for MemorySink {
    fn begin(&mut self, config: SinkConfig) -> Result<(), EncodeError> {
        self.sequencer.lock().begin(config)?;
        let mut captured = self.captured.lock();
        *captured = CapturedFrames {
            config: Some(config),
            ..CapturedFrames::default()
        };
        Ok(())
    }

    fn push_frame(&mut self, index: usize, frame: &RgbaImage) -> Result<(), EncodeError> {
        self.sequencer.lock().admit(index, frame)?;
        self.captured.lock().frames.push((index, frame.clone()));
        Ok(())
    }

    fn end(&mut self) -> Result<(), EncodeError> {
        self.captured.lock().finished = true;
        Ok(())
    }
}

/// `.mp4`/`.mov`/`.mkv` go through ffmpeg, anything else is a PNG directory.
pub fn sink_for_path(path: &Path) -> Box<dyn FrameSink> {
    let is_video = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "mp4" | "mov" | "mkv"));
    if is_video {
        Box::new(FfmpegSink::new(FfmpegSinkOpts::new(path)))
    } else {
        Box::new(PngSequenceSink::new(path))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), EncodeError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SinkConfig {
        SinkConfig {
            width: 2,
            height: 2,
            fps: 25.0,
            frame_count: 2,
        }
    }

    #[test]
    fn test_memory_sink_captures_in_order() {
        let mut sink = MemorySink::new();
        let observer = sink.clone();
        sink.begin(config()).unwrap();
        sink.push_frame(0, &RgbaImage::new(2, 2)).unwrap();
        sink.push_frame(1, &RgbaImage::new(2, 2)).unwrap();
        sink.end().unwrap();

        let captured = observer.captured();
        assert_eq!(captured.frames.len(), 2);
        assert!(captured.finished);
    }

    #[test]
    fn test_rejects_out_of_order_and_wrong_size() {
        let mut sink = MemorySink::new();
        sink.begin(config()).unwrap();
        sink.push_frame(1, &RgbaImage::new(2, 2)).unwrap();
        assert!(matches!(
            sink.push_frame(1, &RgbaImage::new(2, 2)),
            Err(EncodeError::OutOfOrder { index: 1, last: 1 })
        ));
        assert!(matches!(
            sink.push_frame(2, &RgbaImage::new(3, 2)),
            Err(EncodeError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_push_before_begin() {
        let mut sink = MemorySink::new();
        assert!(matches!(
            sink.push_frame(0, &RgbaImage::new(2, 2)),
            Err(EncodeError::NotStarted)
        ));
    }

    #[test]
    fn test_png_sequence_sink() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");
        let mut sink = PngSequenceSink::new(&out);
        sink.begin(config()).unwrap();
        sink.push_frame(0, &RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255])))
            .unwrap();
        sink.end().unwrap();

        let written = image::open(out.join("frame_00000.png")).unwrap().to_rgba8();
        assert_eq!(written.get_pixel(1, 1).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_ffmpeg_sink_requires_even_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FfmpegSink::new(FfmpegSinkOpts::new(dir.path().join("out.mp4")));
        let err = sink
            .begin(SinkConfig {
                width: 3,
                height: 2,
                fps: 30.0,
                frame_count: 1,
            })
            .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidConfig(_)));
    }

    #[test]
    fn test_sink_for_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut png = sink_for_path(&dir.path().join("frames"));
        png.begin(config()).unwrap();
        assert!(dir.path().join("frames").is_dir());
    }
}
