//! FFmpeg decoder backend (feature `ffmpeg`)
//!
//! Configures a libavcodec decoder directly from the avcC/hvcC record, feeds
//! it demuxed samples and converts each output picture to RGBA.

use ffmpeg_next as ffmpeg;
use tracing::{debug, warn};

use super::decoder::{
    DecodeError, DecoderConfig, EncodedChunk, FramePixels, PlatformDecoder, PlatformFrame,
};

/// Largest frame dimension accepted by [`FfmpegDecoder::is_config_supported`]
const MAX_DIMENSION: u32 = 8192;

fn runtime(context: &str, err: ffmpeg::Error) -> DecodeError {
    DecodeError::Runtime(format!("{context}: {err}"))
}

pub struct FfmpegDecoder {
    decoder: Option<ffmpeg::decoder::Video>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    decoded: ffmpeg::frame::Video,
    rgba: ffmpeg::frame::Video,
    packed: Vec<u8>,
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            scaler: None,
            decoded: ffmpeg::frame::Video::empty(),
            rgba: ffmpeg::frame::Video::empty(),
            packed: Vec::new(),
        }
    }

    fn codec_id(config: &DecoderConfig) -> Option<ffmpeg::codec::Id> {
        if config.is_avc() {
            Some(ffmpeg::codec::Id::H264)
        } else if config.is_hevc() {
            Some(ffmpeg::codec::Id::HEVC)
        } else {
            None
        }
    }

    /// Pull every ready picture out of the decoder.
    fn drain(&mut self, output: &mut dyn FnMut(PlatformFrame<'_>)) -> Result<(), DecodeError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };

        loop {
            match decoder.receive_frame(&mut self.decoded) {
                Ok(()) => {}
                Err(ffmpeg::Error::Other {
                    errno: ffmpeg::error::EAGAIN,
                })
                | Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(e) => return Err(runtime("receive_frame", e)),
            }

            let width = self.decoded.width();
            let height = self.decoded.height();
            let format = self.decoded.format();
            let rebuild = match &self.scaler {
                Some(scaler) => {
                    scaler.input().format != format
                        || scaler.input().width != width
                        || scaler.input().height != height
                }
                None => true,
            };
            if rebuild {
                debug!(?format, width, height, "creating RGBA scaler");
                self.scaler = Some(
                    ffmpeg::software::scaling::Context::get(
                        format,
                        width,
                        height,
                        ffmpeg::format::Pixel::RGBA,
                        width,
                        height,
                        ffmpeg::software::scaling::Flags::BILINEAR,
                    )
                    .map_err(|e| runtime("scaler", e))?,
                );
            }
            if let Some(scaler) = self.scaler.as_mut() {
                scaler
                    .run(&self.decoded, &mut self.rgba)
                    .map_err(|e| runtime("scale", e))?;
            }

            let timestamp_us = self.decoded.timestamp().or(self.decoded.pts()).unwrap_or(0);
            let row = width as usize * 4;
            let stride = self.rgba.stride(0);
            let data = self.rgba.data(0);

            // The RGBA frame is reused for the next picture, so hand it out borrowed
            let pixels = if stride == row {
                FramePixels::Borrowed(&data[..row * height as usize])
            } else {
                self.packed.clear();
                for y in 0..height as usize {
                    self.packed.extend_from_slice(&data[y * stride..y * stride + row]);
                }
                FramePixels::Borrowed(&self.packed)
            };

            output(PlatformFrame {
                timestamp_us,
                width,
                height,
                pixels,
            });
        }
    }
}

impl PlatformDecoder for FfmpegDecoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn is_config_supported(&self, config: &DecoderConfig) -> bool {
        if ffmpeg::init().is_err() {
            return false;
        }
        config.coded_width > 0
            && config.coded_height > 0
            && config.coded_width <= MAX_DIMENSION
            && config.coded_height <= MAX_DIMENSION
            && Self::codec_id(config)
                .and_then(ffmpeg::decoder::find)
                .is_some()
    }

    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecodeError> {
        ffmpeg::init().map_err(|e| runtime("init", e))?;
        let codec = Self::codec_id(config)
            .and_then(ffmpeg::decoder::find)
            .ok_or_else(|| DecodeError::UnsupportedConfig {
                decoder: self.name().to_string(),
                codec: config.codec.clone(),
                width: config.coded_width,
                height: config.coded_height,
            })?;

        let mut context = ffmpeg::codec::context::Context::new_with_codec(codec);
        if let Some(record) = &config.description {
            let padding = ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
            // SAFETY: libavcodec takes ownership of an av_malloc'd extradata
            // buffer and frees it together with the context.
            unsafe {
                let extradata = ffmpeg::ffi::av_mallocz(record.len() + padding) as *mut u8;
                if extradata.is_null() {
                    return Err(DecodeError::Runtime("out of memory for extradata".into()));
                }
                std::ptr::copy_nonoverlapping(record.as_ptr(), extradata, record.len());
                let raw = context.as_mut_ptr();
                (*raw).extradata = extradata;
                (*raw).extradata_size = record.len() as i32;
                (*raw).width = config.coded_width as i32;
                (*raw).height = config.coded_height as i32;
                (*raw).pkt_timebase = ffmpeg::ffi::AVRational {
                    num: 1,
                    den: 1_000_000,
                };
            }
        }

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| runtime("open decoder", e))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    fn decode(
        &mut self,
        chunk: &EncodedChunk,
        output: &mut dyn FnMut(PlatformFrame<'_>),
    ) -> Result<(), DecodeError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| DecodeError::Runtime("decode before configure".into()))?;

        let mut packet = ffmpeg::Packet::copy(&chunk.data);
        packet.set_pts(Some(chunk.timestamp_us));
        packet.set_duration(chunk.duration_us);
        if chunk.key {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        decoder
            .send_packet(&packet)
            .map_err(|e| runtime("send_packet", e))?;
        self.drain(output)
    }

    fn flush(&mut self, output: &mut dyn FnMut(PlatformFrame<'_>)) -> Result<(), DecodeError> {
        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.send_eof() {
                warn!(error = %e, "send_eof failed");
            }
        }
        self.drain(output)
    }

    fn close(&mut self) {
        self.decoder = None;
        self.scaler = None;
    }
}
