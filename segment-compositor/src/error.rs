//! Error taxonomy shared across the worker boundary
//!
//! Each concern keeps its own `thiserror` enum. [`PipelineError`] gathers the
//! ones that end a session, and [`ErrorPayload`] is the plain-data form every
//! error takes when it leaves the worker thread.

use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::effects::{EffectError, MismatchedLengthError};
use crate::mask::MaskDecodeError;
use crate::mask_stream::MaskStreamError;
use crate::render::CanvasError;
use crate::video::encode::EncodeError;
use crate::video::{BitmapError, DecodeError, DemuxError, ExtractionError};
use crate::worker::StateError;

/// Stable classification of an error for callers that branch on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoVideoTrack,
    UnsupportedConfig,
    DecoderRuntime,
    Demux,
    MismatchedLength,
    MaskDecode,
    ExtractionTimeout,
    Extraction,
    Canvas,
    Effect,
    Encode,
    MaskStream,
    InvalidState,
    Io,
    Internal,
}

impl ErrorKind {
    /// Classify by concrete type, falling back to [`ErrorKind::Internal`].
    pub fn classify(error: &(dyn StdError + 'static)) -> Self {
        if let Some(err) = error.downcast_ref::<PipelineError>() {
            return err.kind();
        }
        if let Some(err) = error.downcast_ref::<DecodeError>() {
            return match err {
                DecodeError::NoVideoTrack => ErrorKind::NoVideoTrack,
                DecodeError::UnsupportedConfig { .. } => ErrorKind::UnsupportedConfig,
                DecodeError::Runtime(_) | DecodeError::FrameCountMismatch { .. } => ErrorKind::DecoderRuntime,
                DecodeError::Demux(_) => ErrorKind::Demux,
                DecodeError::Io(_) => ErrorKind::Io,
                DecodeError::Frame(_) => ErrorKind::DecoderRuntime,
            };
        }
        if let Some(err) = error.downcast_ref::<DemuxError>() {
            return match err {
                DemuxError::NoVideoTrack => ErrorKind::NoVideoTrack,
                _ => ErrorKind::Demux,
            };
        }
        if let Some(err) = error.downcast_ref::<ExtractionError>() {
            return match err {
                ExtractionError::Timeout { .. } => ErrorKind::ExtractionTimeout,
                _ => ErrorKind::Extraction,
            };
        }
        if let Some(err) = error.downcast_ref::<EffectError>() {
            return match err {
                EffectError::MismatchedLength(_) => ErrorKind::MismatchedLength,
                EffectError::Canvas(_) => ErrorKind::Canvas,
                _ => ErrorKind::Effect,
            };
        }
        if error.is::<MismatchedLengthError>() {
            return ErrorKind::MismatchedLength;
        }
        if error.is::<MaskDecodeError>() {
            return ErrorKind::MaskDecode;
        }
        if error.is::<CanvasError>() {
            return ErrorKind::Canvas;
        }
        if error.is::<EncodeError>() {
            return ErrorKind::Encode;
        }
        if error.is::<MaskStreamError>() {
            return ErrorKind::MaskStream;
        }
        if error.is::<StateError>() {
            return ErrorKind::InvalidState;
        }
        if error.is::<BitmapError>() {
            return ErrorKind::DecoderRuntime;
        }
        if error.is::<std::io::Error>() {
            return ErrorKind::Io;
        }
        ErrorKind::Internal
    }
}

/// Serializable error with its cause chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorPayload>>,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Walk `error` and its `source()` chain.
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        Self {
            kind: ErrorKind::classify(error),
            message: error.to_string(),
            cause: error.source().map(|source| Box::new(Self::from_error(source))),
        }
    }

    /// Depth of the cause chain, this payload included
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |cause| cause.depth())
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        let mut cause = self.cause.as_deref();
        while let Some(inner) = cause {
            write!(f, ": {}", inner.message)?;
            cause = inner.cause.as_deref();
        }
        Ok(())
    }
}

/// Errors that end the current session or command
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Effect(#[from] EffectError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    MaskStream(#[from] MaskStreamError),
    #[error("no render target has been set")]
    NoCanvas,
    #[error("no video is loaded")]
    NoVideo,
    #[error("no filmstrip for {width}x{height}: nothing decoded or empty size")]
    Filmstrip { width: u32, height: u32 },
    #[error("failed to spawn thread")]
    Thread(#[source] std::io::Error),
    #[error("worker thread has exited")]
    WorkerGone,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Decode(err) => ErrorKind::classify(err),
            PipelineError::Extraction(err) => ErrorKind::classify(err),
            PipelineError::Effect(err) => ErrorKind::classify(err),
            PipelineError::Canvas(_) => ErrorKind::Canvas,
            PipelineError::Encode(_) => ErrorKind::Encode,
            PipelineError::State(_)
            | PipelineError::NoCanvas
            | PipelineError::NoVideo
            | PipelineError::Filmstrip { .. } => ErrorKind::InvalidState,
            PipelineError::MaskStream(_) => ErrorKind::MaskStream,
            PipelineError::Thread(_) | PipelineError::WorkerGone => ErrorKind::Internal,
        }
    }

    /// Plain-data form for the event channel. Transparent wrappers are
    /// skipped so the payload starts at the concrete error.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            PipelineError::Decode(err) => ErrorPayload::from_error(err),
            PipelineError::Extraction(err) => ErrorPayload::from_error(err),
            PipelineError::Effect(err) => ErrorPayload::from_error(err),
            PipelineError::Canvas(err) => ErrorPayload::from_error(err),
            PipelineError::Encode(err) => ErrorPayload::from_error(err),
            PipelineError::State(err) => ErrorPayload::from_error(err),
            PipelineError::MaskStream(err) => ErrorPayload::from_error(err),
            other => ErrorPayload::from_error(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_keeps_cause_chain() {
        let err = PipelineError::Decode(DecodeError::Demux(DemuxError::MissingMovieHeader));
        let payload = err.to_payload();
        assert_eq!(payload.kind, ErrorKind::Demux);
        assert_eq!(payload.message, "container parsing failed");
        let cause = payload.cause.as_deref().unwrap();
        assert_eq!(cause.kind, ErrorKind::Demux);
        assert_eq!(cause.message, "stream ended before the movie header was found");
        assert_eq!(payload.depth(), 2);
    }

    #[test]
    fn test_classification() {
        let cases: Vec<(PipelineError, ErrorKind)> = vec![
            (DecodeError::NoVideoTrack.into(), ErrorKind::NoVideoTrack),
            (DecodeError::Runtime("boom".into()).into(), ErrorKind::DecoderRuntime),
            (
                DecodeError::UnsupportedConfig {
                    decoder: "fake".into(),
                    codec: "avc1".into(),
                    width: 4,
                    height: 2,
                }
                .into(),
                ErrorKind::UnsupportedConfig,
            ),
            (
                ExtractionError::Timeout {
                    timeout: std::time::Duration::from_secs(1),
                    captured: 0,
                }
                .into(),
                ErrorKind::ExtractionTimeout,
            ),
            (
                EffectError::from(MismatchedLengthError {
                    timestamps: 2,
                    bitmaps: 1,
                })
                .into(),
                ErrorKind::MismatchedLength,
            ),
            (PipelineError::NoCanvas, ErrorKind::InvalidState),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{err}");
            assert_eq!(err.to_payload().kind, kind, "{err}");
        }
    }

    #[test]
    fn test_payload_serializes_without_empty_cause() {
        let payload = ErrorPayload::from_error(&DecodeError::NoVideoTrack);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "no_video_track");
        assert_eq!(json["message"], "container has no video track");
        assert!(json.get("cause").is_none());

        let back: ErrorPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_display_joins_chain() {
        let payload = ErrorPayload {
            kind: ErrorKind::Demux,
            message: "container parsing failed".into(),
            cause: Some(Box::new(ErrorPayload::new(ErrorKind::Demux, "truncated box"))),
        };
        assert_eq!(payload.to_string(), "container parsing failed: truncated box");
    }
}
