//! Fixtures shared by unit tests: a synthetic MP4 writer and a scriptable decoder

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::video::{
    DecodeError, DecoderConfig, EncodedChunk, FramePixels, PlatformDecoder, PlatformFrame,
};

fn mp4_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    body.extend_from_slice(&((version as u32) << 24 | (flags & 0x00ff_ffff)).to_be_bytes());
    body.extend_from_slice(payload);
    mp4_box(kind, &body)
}

fn be32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Writes small but structurally valid MP4 files
pub struct Mp4Builder {
    samples: usize,
    timescale: u32,
    delta: u32,
    width: u16,
    height: u16,
    edit_start: Option<i64>,
    b_frames: bool,
    moov_at_end: bool,
    handler: [u8; 4],
    format: [u8; 4],
}

impl Mp4Builder {
    /// `samples` frames at 25fps (timescale 12800, 512 ticks each), 4x2 pixels.
    pub fn new(samples: usize) -> Self {
        Self {
            samples,
            timescale: 12_800,
            delta: 512,
            width: 4,
            height: 2,
            edit_start: None,
            b_frames: false,
            moov_at_end: false,
            handler: *b"vide",
            format: *b"avc1",
        }
    }

    pub fn edit_start(mut self, media_time: i64) -> Self {
        self.edit_start = Some(media_time);
        self
    }

    /// Use an I P B B pattern so decode order differs from presentation order.
    pub fn b_frames(mut self, enabled: bool) -> Self {
        self.b_frames = enabled;
        self
    }

    pub fn moov_at_end(mut self, enabled: bool) -> Self {
        self.moov_at_end = enabled;
        self
    }

    pub fn handler(mut self, handler: [u8; 4]) -> Self {
        self.handler = handler;
        self
    }

    pub fn format(mut self, format: [u8; 4]) -> Self {
        self.format = format;
        self
    }

    /// Bytes stored for sample `index`; the first byte doubles as its frame color.
    pub fn sample_payload(index: usize) -> Bytes {
        Bytes::from(vec![(index as u8).wrapping_add(1); 3 + index % 4])
    }

    /// Presentation position of each sample in decode order.
    fn presentation_order(&self) -> Vec<usize> {
        let n = self.samples;
        let mut order: Vec<usize> = (0..n).collect();
        if self.b_frames {
            let mut group = 1;
            while group + 2 < n {
                order[group] = group + 2;
                order[group + 1] = group;
                order[group + 2] = group + 1;
                group += 3;
            }
        }
        order
    }

    pub fn build(&self) -> Bytes {
        let ftyp = mp4_box(b"ftyp", &[b"isom".as_slice(), &512u32.to_be_bytes(), b"isom", b"avc1"].concat());
        let payload: Vec<u8> = (0..self.samples)
            .flat_map(|i| Self::sample_payload(i).to_vec())
            .collect();
        let mdat = mp4_box(b"mdat", &payload);

        let data_offset = if self.moov_at_end {
            ftyp.len() + 8
        } else {
            ftyp.len() + self.moov(0).len() + 8
        };
        let moov = self.moov(data_offset as u32);

        let parts = if self.moov_at_end {
            [ftyp, mdat, moov]
        } else {
            [ftyp, moov, mdat]
        };
        Bytes::from(parts.concat())
    }

    fn moov(&self, data_offset: u32) -> Vec<u8> {
        let n = self.samples as u32;
        let duration = n * self.delta;

        let mut tkhd = be32(&[0, 0, 1, 0, duration, 0, 0, 0, 0]);
        tkhd.extend_from_slice(&be32(&[0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000]));
        tkhd.extend_from_slice(&be32(&[(self.width as u32) << 16, (self.height as u32) << 16]));
        let mut trak = full_box(b"tkhd", 0, 3, &tkhd);

        if let Some(media_time) = self.edit_start {
            let elst = full_box(
                b"elst",
                0,
                0,
                &be32(&[1, duration, media_time as i32 as u32, 0x0001_0000]),
            );
            trak.extend_from_slice(&mp4_box(b"edts", &elst));
        }

        let mut mdia = full_box(b"mdhd", 0, 0, &[be32(&[0, 0, self.timescale, duration]), vec![0x55, 0xc4, 0, 0]].concat());
        let mut hdlr = vec![0u8; 4];
        hdlr.extend_from_slice(&self.handler);
        hdlr.extend_from_slice(&[0u8; 12]);
        hdlr.extend_from_slice(b"VideoHandler\0");
        mdia.extend_from_slice(&full_box(b"hdlr", 0, 0, &hdlr));

        let mut minf = full_box(b"vmhd", 0, 1, &[0u8; 8]);
        minf.extend_from_slice(&mp4_box(b"stbl", &self.stbl(data_offset)));
        mdia.extend_from_slice(&mp4_box(b"minf", &minf));
        trak.extend_from_slice(&mp4_box(b"mdia", &mdia));

        mp4_box(b"moov", &mp4_box(b"trak", &trak))
    }

    fn stbl(&self, data_offset: u32) -> Vec<u8> {
        let n = self.samples as u32;

        let mut entry = vec![0u8; 6];
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 16]);
        entry.extend_from_slice(&self.width.to_be_bytes());
        entry.extend_from_slice(&self.height.to_be_bytes());
        entry.extend_from_slice(&be32(&[0x0048_0000, 0x0048_0000, 0]));
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 32]);
        entry.extend_from_slice(&0x0018u16.to_be_bytes());
        entry.extend_from_slice(&0xffffu16.to_be_bytes());
        entry.extend_from_slice(&mp4_box(b"avcC", &[1, 0x64, 0x00, 0x1f, 0xff, 0xe0, 0x00]));

        let mut stsd_body = be32(&[1]);
        stsd_body.extend_from_slice(&mp4_box(&self.format, &entry));
        let mut stbl = full_box(b"stsd", 0, 0, &stsd_body);

        stbl.extend_from_slice(&full_box(b"stts", 0, 0, &be32(&[1, n, self.delta])));

        if self.b_frames {
            let order = self.presentation_order();
            let mut ctts = be32(&[n]);
            for (decode, presentation) in order.iter().enumerate() {
                let offset = (*presentation as i64 - decode as i64 + 1) * self.delta as i64;
                ctts.extend_from_slice(&be32(&[1, offset as u32]));
            }
            stbl.extend_from_slice(&full_box(b"ctts", 0, 0, &ctts));
        }

        stbl.extend_from_slice(&full_box(b"stss", 0, 0, &be32(&[1, 1])));

        let mut stsz = be32(&[0, n]);
        for i in 0..self.samples {
            stsz.extend_from_slice(&(Self::sample_payload(i).len() as u32).to_be_bytes());
        }
        stbl.extend_from_slice(&full_box(b"stsz", 0, 0, &stsz));
        stbl.extend_from_slice(&full_box(b"stsc", 0, 0, &be32(&[1, 1, n, 1])));
        stbl.extend_from_slice(&full_box(b"stco", 0, 0, &be32(&[1, data_offset])));
        stbl
    }
}

#[derive(Default)]
struct ProbeState {
    configures: usize,
    chunks: usize,
    closes: usize,
    emitted: Vec<i64>,
}

/// Observes a [`FakeDecoder`] after it has been boxed and moved away
#[derive(Clone, Default)]
pub struct FakeProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl FakeProbe {
    pub fn configures(&self) -> usize {
        self.state.lock().configures
    }

    pub fn chunks(&self) -> usize {
        self.state.lock().chunks
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn emitted(&self) -> Vec<i64> {
        self.state.lock().emitted.clone()
    }

    pub fn emitted_out_of_order(&self) -> bool {
        self.emitted().windows(2).any(|w| w[1] < w[0])
    }
}

/// Decoder that paints each frame with its sample's first byte
///
/// Frames leave in decode order after `latency` further chunks, like a
/// hardware decoder that does not reorder B-frames.
pub struct FakeDecoder {
    latency: usize,
    supported: bool,
    fail_at: Option<usize>,
    swallow_every: Option<usize>,
    borrowed: bool,
    width: u32,
    height: u32,
    queue: VecDeque<(i64, u8)>,
    scratch: Vec<u8>,
    probe: FakeProbe,
}

impl Default for FakeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDecoder {
    pub fn new() -> Self {
        Self {
            latency: 0,
            supported: true,
            fail_at: None,
            swallow_every: None,
            borrowed: false,
            width: 0,
            height: 0,
            queue: VecDeque::new(),
            scratch: Vec::new(),
            probe: FakeProbe::default(),
        }
    }

    pub fn latency(mut self, chunks: usize) -> Self {
        self.latency = chunks;
        self
    }

    pub fn supported(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }

    /// Fault on the chunk with this zero-based index.
    pub fn fail_at(mut self, chunk: usize) -> Self {
        self.fail_at = Some(chunk);
        self
    }

    /// Never emit a frame for every n-th chunk.
    pub fn swallow_every(mut self, n: usize) -> Self {
        self.swallow_every = Some(n);
        self
    }

    /// Emit frames from one reused buffer.
    pub fn borrowed_output(mut self, borrowed: bool) -> Self {
        self.borrowed = borrowed;
        self
    }

    pub fn probe(&self) -> FakeProbe {
        self.probe.clone()
    }

    fn emit(&mut self, timestamp_us: i64, color: u8, output: &mut dyn FnMut(PlatformFrame<'_>)) {
        self.probe.state.lock().emitted.push(timestamp_us);
        let size = self.width as usize * self.height as usize * 4;
        if self.borrowed {
            self.scratch.resize(size, 0);
            self.scratch.iter_mut().for_each(|b| *b = color);
            output(PlatformFrame {
                timestamp_us,
                width: self.width,
                height: self.height,
                pixels: FramePixels::Borrowed(&self.scratch),
            });
            // The platform scribbles over its buffer once the callback returns
            self.scratch.iter_mut().for_each(|b| *b = 0);
        } else {
            output(PlatformFrame {
                timestamp_us,
                width: self.width,
                height: self.height,
                pixels: FramePixels::Owned(vec![color; size]),
            });
        }
    }
}

impl PlatformDecoder for FakeDecoder {
    fn name(&self) -> &str {
        "fake"
    }

    fn is_config_supported(&self, _config: &DecoderConfig) -> bool {
        self.supported
    }

    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecodeError> {
        self.probe.state.lock().configures += 1;
        self.width = config.coded_width;
        self.height = config.coded_height;
        Ok(())
    }

    fn decode(
        &mut self,
        chunk: &EncodedChunk,
        output: &mut dyn FnMut(PlatformFrame<'_>),
    ) -> Result<(), DecodeError> {
        let index = {
            let mut state = self.probe.state.lock();
            state.chunks += 1;
            state.chunks - 1
        };
        if self.fail_at == Some(index) {
            return Err(DecodeError::Runtime(format!("fault injected at chunk {index}")));
        }
        if self.swallow_every.is_some_and(|n| (index + 1) % n == 0) {
            return Ok(());
        }

        let color = chunk.data.first().copied().unwrap_or(0);
        self.queue.push_back((chunk.timestamp_us, color));
        while self.queue.len() > self.latency {
            if let Some((ts, color)) = self.queue.pop_front() {
                self.emit(ts, color, output);
            }
        }
        Ok(())
    }

    fn flush(&mut self, output: &mut dyn FnMut(PlatformFrame<'_>)) -> Result<(), DecodeError> {
        while let Some((ts, color)) = self.queue.pop_front() {
            self.emit(ts, color, output);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.probe.state.lock().closes += 1;
        self.queue.clear();
    }
}
