//! Video ingest: container demuxing, decoding, background-frame extraction,
//! thumbnails and encoding of rendered output.

mod bitmap;
mod decoder;
mod demux;
pub mod encode;
mod extract;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod filmstrip;
mod frame;
pub mod mp4;
mod sample;
mod source;
mod time;

pub use bitmap::{Bitmap, BitmapError, BitmapTracker};
pub use decoder::{
    decode_stream, decode_video, default_decoder, default_decoder_factory, DecodeContext,
    DecodeError, DecodeOutcome, DecodeProgress, DecodeSummary, DecoderConfig, DecoderFactory,
    DecoderHandle, EncodedChunk, FramePixels, PlatformDecoder, PlatformFrame, StopToken,
    UnavailableDecoder,
};
pub use demux::{ByteRange, DemuxError, DemuxEvent, Mp4Demuxer, SparseBuffer, TrackInfo};
pub use extract::{extract_background_frames, ExtractedFrames, ExtractionError, ExtractionRequest};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegDecoder;
pub use filmstrip::generate_filmstrip;
pub use frame::{DecodedFrame, DecodedVideo, VideoSnapshot};
pub use sample::{Sample, SampleList, SampleTiming};
pub use source::VideoSource;
pub use time::{media_duration, Timestamp};
