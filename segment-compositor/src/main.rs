//! segment-compositor command line
//!
//! `render` decodes a video, composites it with masks (and optionally a
//! background video) through the worker, and encodes the result.
//! `probe` prints the video track of a file.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use segment_compositor::effects::{EffectOptions, BACKGROUND_SLOT, HIGHLIGHT_SLOT};
use segment_compositor::mask::MaskBatch;
use segment_compositor::render::create_canvas;
use segment_compositor::settings::{CanvasBackend, PipelineSettings};
use segment_compositor::telemetry::init_logging;
use segment_compositor::video::encode::sink_for_path;
use segment_compositor::video::{
    default_decoder, extract_background_frames, ByteRange, DemuxEvent, ExtractionRequest, Mp4Demuxer, VideoSource,
};
use segment_compositor::worker::{Command, Event, PipelineHandle};

/// No event for this long while rendering means the worker is stuck
const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "segment-compositor", version, about)]
struct Cli {
    /// Pipeline settings JSON
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Canvas backend, overriding the settings file
    #[arg(long, value_enum, global = true)]
    canvas: Option<CanvasChoice>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Composite masks over a video and encode the result.
    Render(RenderArgs),
    /// Print the video track of an MP4 file.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Input MP4.
    input: PathBuf,

    /// Mask batches as a JSON array of `{frameIndex, results}`.
    #[arg(long)]
    masks: PathBuf,

    /// Background video shown behind the masked objects.
    #[arg(long)]
    background: Option<PathBuf>,

    /// Effect to apply; defaults to `background_video` with a background, `overlay` otherwise.
    #[arg(long)]
    effect: Option<String>,

    /// Effect variant; wraps around the effect's variant count.
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    variant: i64,

    /// Output: `.mp4`/`.mov`/`.mkv` (requires `ffmpeg` on PATH) or a directory of PNGs.
    #[arg(long)]
    out: PathBuf,

    /// Log render timing statistics.
    #[arg(long)]
    stats: bool,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Input MP4.
    input: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CanvasChoice {
    Cpu,
    Gpu,
}

impl From<CanvasChoice> for CanvasBackend {
    fn from(choice: CanvasChoice) -> Self {
        match choice {
            CanvasChoice::Cpu => CanvasBackend::Cpu,
            CanvasChoice::Gpu => CanvasBackend::Gpu,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => PipelineSettings::load(path).with_context(|| format!("load settings '{}'", path.display()))?,
        None => PipelineSettings::default(),
    };
    if let Some(choice) = cli.canvas {
        settings.canvas = choice.into();
    }
    settings.sanitize();

    // Keep the guard alive for the program duration
    let _log_guard = match init_logging(&settings.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    match cli.cmd {
        Cmd::Render(args) => cmd_render(settings, args),
        Cmd::Probe(args) => cmd_probe(&settings, args),
    }
}

fn read_masks(path: &Path) -> anyhow::Result<Vec<MaskBatch>> {
    let file = File::open(path).with_context(|| format!("open masks '{}'", path.display()))?;
    let batches: Vec<MaskBatch> =
        serde_json::from_reader(BufReader::new(file)).with_context(|| "parse mask batches JSON")?;
    Ok(batches)
}

fn slot_for(effect: &str) -> usize {
    if effect == "overlay" {
        HIGHLIGHT_SLOT
    } else {
        BACKGROUND_SLOT
    }
}

fn cmd_render(settings: PipelineSettings, args: RenderArgs) -> anyhow::Result<()> {
    let batches = read_masks(&args.masks)?;
    info!(batches = batches.len(), "masks loaded");

    let handle = PipelineHandle::spawn(settings.clone())?;
    let canvas = create_canvas(settings.canvas, 1, 1).context("create canvas")?;
    handle.send(Command::SetCanvas(canvas))?;
    if args.stats {
        handle.send(Command::EnableStats(true))?;
    }

    let effect = args.effect.clone().unwrap_or_else(|| {
        if args.background.is_some() {
            "background_video".to_string()
        } else {
            "overlay".to_string()
        }
    });
    handle.send(Command::SetEffect {
        slot: slot_for(&effect),
        name: Some(effect.clone()),
        options: EffectOptions::variant(args.variant),
    })?;

    if let Some(background) = &args.background {
        // A background that fails to load leaves the foreground untouched
        match extract_background(&settings, background, &handle) {
            Ok((timestamps, bitmaps)) => handle.send(Command::SetBackgroundFrames { timestamps, bitmaps })?,
            Err(e) => warn!(error = format!("{e:#}"), "background video unavailable, continuing without it"),
        }
    }

    // A new source clears the mask store, so masks follow it
    handle.send(Command::SetSource(VideoSource::File(args.input.clone())))?;
    for batch in batches {
        handle.send(Command::SetMasks(batch))?;
    }

    let mut encoding = false;
    loop {
        let event = handle
            .events()
            .recv_timeout(EVENT_TIMEOUT)
            .context("worker stopped responding")?;
        match event {
            Event::Ready(snapshot) => {
                info!(
                    width = snapshot.width,
                    height = snapshot.height,
                    frames = snapshot.frame_count,
                    fps = snapshot.fps,
                    "video ready"
                );
            }
            Event::DecodeCompleted(snapshot) if !encoding => {
                info!(frames = snapshot.decoded_frames, out = %args.out.display(), "encoding");
                handle.send(Command::Encode {
                    sink: sink_for_path(&args.out),
                })?;
                encoding = true;
            }
            Event::EncodeProgress { frame_index, total } => {
                if frame_index % 30 == 0 || frame_index + 1 == total {
                    info!(frame = frame_index + 1, total, "encoded");
                }
            }
            Event::EncodeCompleted { frames } => {
                info!(frames, out = %args.out.display(), "done");
                break;
            }
            Event::Stats(stats) => {
                info!(
                    avg_ms = stats.avg_ms,
                    p95_ms = stats.p95_ms,
                    fps = stats.fps,
                    frames = stats.frames_rendered,
                    "render stats"
                );
            }
            Event::Error { payload, fatal } => {
                if fatal || encoding {
                    bail!("{payload}");
                }
                warn!(kind = ?payload.kind, "{payload}");
            }
            _ => {}
        }
    }

    handle.shutdown();
    Ok(())
}

fn extract_background(
    settings: &PipelineSettings,
    path: &Path,
    handle: &PipelineHandle,
) -> anyhow::Result<(Vec<f64>, Vec<segment_compositor::video::Bitmap>)> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    let mut request = ExtractionRequest::new(
        VideoSource::File(path.to_path_buf()),
        settings.background_frame_budget,
        settings.extraction_timeout(),
    );
    request.read_chunk_bytes = settings.file_read_chunk_bytes;

    let extracted = runtime
        .block_on(extract_background_frames(request, default_decoder, handle.tracker().clone()))
        .with_context(|| format!("extract frames from '{}'", path.display()))?;
    if extracted.timed_out {
        warn!(frames = extracted.len(), "background extraction timed out, using frames captured so far");
    }
    info!(frames = extracted.len(), "background frames extracted");
    Ok((extracted.timestamps, extracted.bitmaps))
}

fn cmd_probe(settings: &PipelineSettings, args: ProbeArgs) -> anyhow::Result<()> {
    let mut file = File::open(&args.input).with_context(|| format!("open '{}'", args.input.display()))?;
    let mut demuxer = Mp4Demuxer::new();
    let mut buf = vec![0u8; settings.file_read_chunk_bytes];
    let mut offset = 0u64;

    loop {
        let read = file.read(&mut buf).context("read input")?;
        if read == 0 {
            demuxer.finish().context("parse container")?;
            bail!("'{}' has no readable video track", args.input.display());
        }
        let events = demuxer
            .push(ByteRange::new(offset, buf[..read].to_vec()))
            .context("parse container")?;
        offset += read as u64;

        for event in events {
            if let DemuxEvent::Ready(track) = event {
                println!("{}", serde_json::to_string_pretty(&track)?);
                return Ok(());
            }
        }
    }
}
