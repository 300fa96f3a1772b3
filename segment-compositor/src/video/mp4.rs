//! ISO base media file format (MP4) box readers
//!
//! Only the boxes needed to locate a video track and its samples are parsed:
//! `moov/trak/{tkhd,edts/elst,mdia/{mdhd,hdlr,minf/stbl}}` plus the `avcC` and
//! `hvcC` decoder configuration records.

use std::fmt;

use bytes::Bytes;

use super::demux::DemuxError;

/// A four-character box or codec code
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: FourCc = FourCc(*b"ftyp");
    pub const MOOV: FourCc = FourCc(*b"moov");
    pub const MDAT: FourCc = FourCc(*b"mdat");
    pub const TRAK: FourCc = FourCc(*b"trak");
    pub const TKHD: FourCc = FourCc(*b"tkhd");
    pub const EDTS: FourCc = FourCc(*b"edts");
    pub const ELST: FourCc = FourCc(*b"elst");
    pub const MDIA: FourCc = FourCc(*b"mdia");
    pub const MDHD: FourCc = FourCc(*b"mdhd");
    pub const HDLR: FourCc = FourCc(*b"hdlr");
    pub const MINF: FourCc = FourCc(*b"minf");
    pub const STBL: FourCc = FourCc(*b"stbl");
    pub const STSD: FourCc = FourCc(*b"stsd");
    pub const STTS: FourCc = FourCc(*b"stts");
    pub const CTTS: FourCc = FourCc(*b"ctts");
    pub const STSS: FourCc = FourCc(*b"stss");
    pub const STSZ: FourCc = FourCc(*b"stsz");
    pub const STSC: FourCc = FourCc(*b"stsc");
    pub const STCO: FourCc = FourCc(*b"stco");
    pub const CO64: FourCc = FourCc(*b"co64");
    pub const AVC1: FourCc = FourCc(*b"avc1");
    pub const AVC3: FourCc = FourCc(*b"avc3");
    pub const HVC1: FourCc = FourCc(*b"hvc1");
    pub const HEV1: FourCc = FourCc(*b"hev1");
    pub const AVCC: FourCc = FourCc(*b"avcC");
    pub const HVCC: FourCc = FourCc(*b"hvcC");
    pub const VIDE: FourCc = FourCc(*b"vide");

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self.as_str())
    }
}

/// Parsed box header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCc,
    /// 8, or 16 with a 64-bit size
    pub header_len: u64,
    /// Total size including the header; `None` extends to the end of the parent
    pub size: Option<u64>,
}

/// Parse a box header. Returns `Ok(None)` when `data` is too short to tell.
pub fn parse_box_header(data: &[u8]) -> Result<Option<BoxHeader>, DemuxError> {
    if data.len() < 8 {
        return Ok(None);
    }
    let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let kind = FourCc([data[4], data[5], data[6], data[7]]);
    let (header_len, size) = match size32 {
        0 => (8, None),
        1 => {
            if data.len() < 16 {
                return Ok(None);
            }
            let mut large = [0u8; 8];
            large.copy_from_slice(&data[8..16]);
            (16, Some(u64::from_be_bytes(large)))
        }
        n => (8, Some(n as u64)),
    };
    if let Some(size) = size {
        if size < header_len {
            return Err(DemuxError::Malformed {
                kind,
                reason: format!("declared size {size} is smaller than its header"),
            });
        }
    }
    Ok(Some(BoxHeader {
        kind,
        header_len,
        size,
    }))
}

/// Iterates the child boxes of a fully loaded parent payload
pub struct Boxes<'a> {
    data: &'a [u8],
}

impl<'a> Boxes<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for Boxes<'a> {
    type Item = Result<(FourCc, &'a [u8]), DemuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let header = match parse_box_header(self.data) {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.data = &[];
                return Some(Err(DemuxError::Truncated(FourCc(*b"????"))));
            }
            Err(e) => {
                self.data = &[];
                return Some(Err(e));
            }
        };
        let total = header.size.unwrap_or(self.data.len() as u64);
        if total > self.data.len() as u64 {
            self.data = &[];
            return Some(Err(DemuxError::Truncated(header.kind)));
        }
        let payload = &self.data[header.header_len as usize..total as usize];
        self.data = &self.data[total as usize..];
        Some(Ok((header.kind, payload)))
    }
}

/// Big-endian cursor over one box payload
struct Reader<'a> {
    kind: FourCc,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(kind: FourCc, data: &'a [u8]) -> Self {
        Self { kind, data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DemuxError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(DemuxError::Truncated(self.kind))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), DemuxError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DemuxError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DemuxError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DemuxError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DemuxError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Version byte and 24-bit flags of a full box.
    fn full_box(&mut self) -> Result<u8, DemuxError> {
        let version = self.u8()?;
        self.skip(3)?;
        Ok(version)
    }

    /// Entry count, rejecting counts that cannot fit in the remaining payload.
    fn count(&mut self, entry_size: usize) -> Result<usize, DemuxError> {
        let count = self.u32()? as usize;
        let remaining = self.data.len() - self.pos;
        if entry_size > 0 && count > remaining / entry_size {
            return Err(DemuxError::Malformed {
                kind: self.kind,
                reason: format!("{count} entries do not fit in {remaining} bytes"),
            });
        }
        Ok(count)
    }
}

/// Codec configuration record carried by the sample entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecConfig {
    /// AVCDecoderConfigurationRecord
    Avc(Bytes),
    /// HEVCDecoderConfigurationRecord
    Hevc(Bytes),
}

impl CodecConfig {
    pub fn record(&self) -> &Bytes {
        match self {
            CodecConfig::Avc(record) | CodecConfig::Hevc(record) => record,
        }
    }
}

/// Visual sample entry from `stsd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualSampleEntry {
    pub format: FourCc,
    pub width: u16,
    pub height: u16,
    pub config: Option<CodecConfig>,
}

impl VisualSampleEntry {
    /// RFC 6381 codec string, e.g. `avc1.64001f` or `hvc1.1.6.L93.B0`.
    pub fn codec_string(&self) -> String {
        match &self.config {
            Some(CodecConfig::Avc(record)) if record.len() >= 4 => format!(
                "{}.{:02x}{:02x}{:02x}",
                self.format, record[1], record[2], record[3]
            ),
            Some(CodecConfig::Hevc(record)) if record.len() >= 13 => {
                hevc_codec_string(self.format, record)
            }
            _ => self.format.to_string(),
        }
    }
}

fn hevc_codec_string(format: FourCc, record: &[u8]) -> String {
    let profile_space = record[1] >> 6;
    let tier = (record[1] >> 5) & 1;
    let profile_idc = record[1] & 0x1f;
    let compatibility = u32::from_be_bytes([record[2], record[3], record[4], record[5]]);
    let level = record[12];

    let space = match profile_space {
        1 => "A",
        2 => "B",
        3 => "C",
        _ => "",
    };
    let mut codec = format!(
        "{format}.{space}{profile_idc}.{:x}.{}{level}",
        compatibility.reverse_bits(),
        if tier == 1 { 'H' } else { 'L' }
    );

    let constraints = &record[6..12];
    let used = constraints
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    for byte in &constraints[..used] {
        codec.push_str(&format!(".{byte:02X}"));
    }
    codec
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRun {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

/// Raw sample tables from `stbl`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleTable {
    /// (sample_count, sample_delta)
    pub time_to_sample: Vec<(u32, u32)>,
    /// (sample_count, composition offset)
    pub composition_offsets: Vec<(u32, i32)>,
    /// 1-based sync sample numbers; `None` means every sample is a key frame
    pub sync_samples: Option<Vec<u32>>,
    pub sample_sizes: Vec<u32>,
    pub sample_to_chunk: Vec<ChunkRun>,
    pub chunk_offsets: Vec<u64>,
}

/// Resolved position and timing of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    pub offset: u64,
    pub size: u32,
    pub decode_time: i64,
    pub composition_time: i64,
    pub duration: u32,
    pub is_sync: bool,
}

impl SampleTable {
    pub fn sample_count(&self) -> usize {
        self.sample_sizes.len()
    }

    /// Expand the run-length tables into one entry per sample, in decode order.
    pub fn layout(&self) -> Result<Vec<SampleLayout>, DemuxError> {
        let count = self.sample_count();
        if count > MAX_SAMPLES {
            return Err(DemuxError::Malformed {
                kind: FourCc::STSZ,
                reason: format!("{count} samples exceeds the limit of {MAX_SAMPLES}"),
            });
        }
        let mut samples = vec![
            SampleLayout {
                offset: 0,
                size: 0,
                decode_time: 0,
                composition_time: 0,
                duration: 0,
                is_sync: self.sync_samples.is_none(),
            };
            count
        ];

        for (sample, size) in samples.iter_mut().zip(&self.sample_sizes) {
            sample.size = *size;
        }

        let mut index = 0usize;
        let mut time = 0i64;
        for &(run, delta) in &self.time_to_sample {
            for _ in 0..run {
                let Some(sample) = samples.get_mut(index) else {
                    break;
                };
                sample.decode_time = time;
                sample.composition_time = time;
                sample.duration = delta;
                time += delta as i64;
                index += 1;
            }
        }
        // Samples past the end of stts reuse the last delta
        let last_delta = self.time_to_sample.last().map(|&(_, d)| d).unwrap_or(0);
        for sample in samples.iter_mut().skip(index) {
            sample.decode_time = time;
            sample.composition_time = time;
            sample.duration = last_delta;
            time += last_delta as i64;
        }

        let mut index = 0usize;
        for &(run, offset) in &self.composition_offsets {
            for _ in 0..run {
                let Some(sample) = samples.get_mut(index) else {
                    break;
                };
                sample.composition_time = sample.decode_time + offset as i64;
                index += 1;
            }
        }

        if let Some(sync) = &self.sync_samples {
            for number in sync {
                if let Some(sample) = (*number as usize).checked_sub(1).and_then(|i| samples.get_mut(i)) {
                    sample.is_sync = true;
                }
            }
        }

        let mut index = 0usize;
        for (i, run) in self.sample_to_chunk.iter().enumerate() {
            if run.first_chunk == 0 {
                return Err(DemuxError::Malformed {
                    kind: FourCc::STSC,
                    reason: "chunk numbers start at 1".into(),
                });
            }
            let first = run.first_chunk as usize - 1;
            let end = self
                .sample_to_chunk
                .get(i + 1)
                .map(|next| (next.first_chunk as usize).saturating_sub(1))
                .unwrap_or(self.chunk_offsets.len())
                .min(self.chunk_offsets.len());
            for chunk in first..end {
                let mut offset = self.chunk_offsets[chunk];
                for _ in 0..run.samples_per_chunk {
                    let Some(sample) = samples.get_mut(index) else {
                        break;
                    };
                    sample.offset = offset;
                    offset += sample.size as u64;
                    index += 1;
                }
            }
        }
        if index < count {
            return Err(DemuxError::Malformed {
                kind: FourCc::STSC,
                reason: format!("chunk tables place {index} of {count} samples"),
            });
        }

        Ok(samples)
    }
}

/// One `trak`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub id: u32,
    pub handler: FourCc,
    /// Display size from `tkhd`
    pub width: u32,
    pub height: u32,
    /// Media timescale from `mdhd`
    pub timescale: u32,
    pub duration: u64,
    /// Media time of the first non-empty edit
    pub edit_start: Option<i64>,
    pub entry: Option<VisualSampleEntry>,
    pub table: SampleTable,
}

impl Track {
    pub fn is_video(&self) -> bool {
        self.handler == FourCc::VIDE
    }
}

/// Parsed `moov`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movie {
    pub tracks: Vec<Track>,
}

/// Parse a complete `moov` payload.
pub fn parse_moov(payload: &[u8]) -> Result<Movie, DemuxError> {
    let mut tracks = Vec::new();
    for child in Boxes::new(payload) {
        let (kind, data) = child?;
        if kind == FourCc::TRAK {
            tracks.push(parse_trak(data)?);
        }
    }
    Ok(Movie { tracks })
}

fn parse_trak(payload: &[u8]) -> Result<Track, DemuxError> {
    let mut track = Track {
        id: 0,
        handler: FourCc(*b"\0\0\0\0"),
        width: 0,
        height: 0,
        timescale: 0,
        duration: 0,
        edit_start: None,
        entry: None,
        table: SampleTable::default(),
    };

    for child in Boxes::new(payload) {
        let (kind, data) = child?;
        match kind {
            FourCc::TKHD => parse_tkhd(data, &mut track)?,
            FourCc::EDTS => {
                for edts_child in Boxes::new(data) {
                    let (kind, data) = edts_child?;
                    if kind == FourCc::ELST {
                        track.edit_start = parse_elst(data)?;
                    }
                }
            }
            FourCc::MDIA => parse_mdia(data, &mut track)?,
            _ => {}
        }
    }
    Ok(track)
}

fn parse_tkhd(data: &[u8], track: &mut Track) -> Result<(), DemuxError> {
    let mut r = Reader::new(FourCc::TKHD, data);
    let version = r.full_box()?;
    if version == 1 {
        r.skip(16)?;
        track.id = r.u32()?;
        r.skip(4)?;
        r.u64()?;
    } else {
        r.skip(8)?;
        track.id = r.u32()?;
        r.skip(4)?;
        r.u32()?;
    }
    // reserved, layer, alternate group, volume, reserved, matrix
    r.skip(8 + 2 + 2 + 2 + 2 + 36)?;
    track.width = r.u32()? >> 16;
    track.height = r.u32()? >> 16;
    Ok(())
}

/// Returns the media time of the first edit that is not an empty (delay) edit.
fn parse_elst(data: &[u8]) -> Result<Option<i64>, DemuxError> {
    let mut r = Reader::new(FourCc::ELST, data);
    let version = r.full_box()?;
    let entry_size = if version == 1 { 20 } else { 12 };
    let count = r.count(entry_size)?;
    for _ in 0..count {
        let media_time = if version == 1 {
            r.u64()?;
            r.u64()? as i64
        } else {
            r.u32()?;
            r.u32()? as i32 as i64
        };
        r.skip(4)?; // media rate
        if media_time >= 0 {
            return Ok(Some(media_time));
        }
    }
    Ok(None)
}

fn parse_mdia(payload: &[u8], track: &mut Track) -> Result<(), DemuxError> {
    for child in Boxes::new(payload) {
        let (kind, data) = child?;
        match kind {
            FourCc::MDHD => {
                let mut r = Reader::new(kind, data);
                if r.full_box()? == 1 {
                    r.skip(16)?;
                    track.timescale = r.u32()?;
                    track.duration = r.u64()?;
                } else {
                    r.skip(8)?;
                    track.timescale = r.u32()?;
                    track.duration = r.u32()? as u64;
                }
            }
            FourCc::HDLR => {
                let mut r = Reader::new(kind, data);
                r.full_box()?;
                r.skip(4)?;
                let handler = r.take(4)?;
                track.handler = FourCc([handler[0], handler[1], handler[2], handler[3]]);
            }
            FourCc::MINF => {
                for minf_child in Boxes::new(data) {
                    let (kind, data) = minf_child?;
                    if kind == FourCc::STBL {
                        parse_stbl(data, track)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_stbl(payload: &[u8], track: &mut Track) -> Result<(), DemuxError> {
    let table = &mut track.table;
    for child in Boxes::new(payload) {
        let (kind, data) = child?;
        let mut r = Reader::new(kind, data);
        match kind {
            FourCc::STSD => {
                r.full_box()?;
                let count = r.u32()?;
                if count > 0 {
                    let rest = &data[r.pos..];
                    if let Some(entry) = Boxes::new(rest).next() {
                        let (format, entry_data) = entry?;
                        track.entry = Some(parse_visual_entry(format, entry_data)?);
                    }
                }
            }
            FourCc::STTS => {
                r.full_box()?;
                let count = r.count(8)?;
                table.time_to_sample = (0..count)
                    .map(|_| Ok((r.u32()?, r.u32()?)))
                    .collect::<Result<_, DemuxError>>()?;
            }
            FourCc::CTTS => {
                r.full_box()?;
                let count = r.count(8)?;
                table.composition_offsets = (0..count)
                    .map(|_| {
                        let run = r.u32()?;
                        // version 0 is nominally unsigned; muxers write negative offsets there anyway
                        let offset = r.u32()? as i32;
                        Ok((run, offset))
                    })
                    .collect::<Result<_, DemuxError>>()?;
            }
            FourCc::STSS => {
                r.full_box()?;
                let count = r.count(4)?;
                table.sync_samples = Some(
                    (0..count)
                        .map(|_| r.u32())
                        .collect::<Result<_, DemuxError>>()?,
                );
            }
            FourCc::STSZ => {
                r.full_box()?;
                let uniform = r.u32()?;
                let count = r.u32()? as usize;
                if count > MAX_SAMPLES {
                    return Err(DemuxError::Malformed {
                        kind,
                        reason: format!("{count} samples exceeds the limit of {MAX_SAMPLES}"),
                    });
                }
                table.sample_sizes = if uniform != 0 {
                    vec![uniform; count]
                } else {
                    if count > (data.len() - r.pos) / 4 {
                        return Err(DemuxError::Truncated(kind));
                    }
                    (0..count).map(|_| r.u32()).collect::<Result<_, DemuxError>>()?
                };
            }
            FourCc::STSC => {
                r.full_box()?;
                let count = r.count(12)?;
                table.sample_to_chunk = (0..count)
                    .map(|_| {
                        let first_chunk = r.u32()?;
                        let samples_per_chunk = r.u32()?;
                        r.u32()?; // sample description index
                        Ok(ChunkRun {
                            first_chunk,
                            samples_per_chunk,
                        })
                    })
                    .collect::<Result<_, DemuxError>>()?;
            }
            FourCc::STCO => {
                r.full_box()?;
                let count = r.count(4)?;
                table.chunk_offsets = (0..count)
                    .map(|_| r.u32().map(u64::from))
                    .collect::<Result<_, DemuxError>>()?;
            }
            FourCc::CO64 => {
                r.full_box()?;
                let count = r.count(8)?;
                table.chunk_offsets = (0..count).map(|_| r.u64()).collect::<Result<_, DemuxError>>()?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Size of the fixed part of a VisualSampleEntry
const VISUAL_ENTRY_HEADER: usize = 78;

/// Upper bound on samples per track; about 19 hours at 60 fps
pub const MAX_SAMPLES: usize = 1 << 22;

fn parse_visual_entry(format: FourCc, data: &[u8]) -> Result<VisualSampleEntry, DemuxError> {
    let mut r = Reader::new(format, data);
    r.skip(24)?;
    let width = r.u16()?;
    let height = r.u16()?;

    let mut config = None;
    if data.len() > VISUAL_ENTRY_HEADER {
        for child in Boxes::new(&data[VISUAL_ENTRY_HEADER..]) {
            let (kind, payload) = child?;
            match kind {
                FourCc::AVCC => config = Some(CodecConfig::Avc(Bytes::copy_from_slice(payload))),
                FourCc::HVCC => config = Some(CodecConfig::Hevc(Bytes::copy_from_slice(payload))),
                _ => {}
            }
        }
    }

    Ok(VisualSampleEntry {
        format,
        width,
        height,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_header_forms() {
        let compact = [0, 0, 0, 16, b'f', b'r', b'e', b'e'];
        let header = parse_box_header(&compact).unwrap().unwrap();
        assert_eq!(header.kind, FourCc(*b"free"));
        assert_eq!(header.size, Some(16));
        assert_eq!(header.header_len, 8);

        let mut large = vec![0, 0, 0, 1, b'm', b'd', b'a', b't'];
        large.extend_from_slice(&40u64.to_be_bytes());
        let header = parse_box_header(&large).unwrap().unwrap();
        assert_eq!(header.size, Some(40));
        assert_eq!(header.header_len, 16);

        let to_end = [0, 0, 0, 0, b'm', b'd', b'a', b't'];
        assert_eq!(parse_box_header(&to_end).unwrap().unwrap().size, None);

        assert!(parse_box_header(&compact[..6]).unwrap().is_none());
        assert!(parse_box_header(&[0, 0, 0, 4, b'b', b'a', b'd', b'!']).is_err());
    }

    #[test]
    fn test_child_truncation_is_reported() {
        let data = [0, 0, 0, 32, b't', b'r', b'a', b'k', 1, 2, 3];
        let err = Boxes::new(&data).next().unwrap().unwrap_err();
        assert_eq!(err, DemuxError::Truncated(FourCc::TRAK));
    }

    #[test]
    fn test_avc_codec_string() {
        let entry = VisualSampleEntry {
            format: FourCc::AVC1,
            width: 1280,
            height: 720,
            config: Some(CodecConfig::Avc(Bytes::from_static(&[1, 0x64, 0x00, 0x1f, 0xff]))),
        };
        assert_eq!(entry.codec_string(), "avc1.64001f");
    }

    #[test]
    fn test_hevc_codec_string() {
        let mut record = vec![0u8; 23];
        record[1] = 0x01; // main profile, tier L
        record[2..6].copy_from_slice(&0x6000_0000u32.to_be_bytes());
        record[6] = 0xb0;
        record[12] = 93;
        let entry = VisualSampleEntry {
            format: FourCc::HVC1,
            width: 1920,
            height: 1080,
            config: Some(CodecConfig::Hevc(Bytes::from(record))),
        };
        assert_eq!(entry.codec_string(), "hvc1.1.6.L93.B0");
    }

    #[test]
    fn test_layout_with_reordering_and_chunks() {
        let table = SampleTable {
            time_to_sample: vec![(4, 100)],
            composition_offsets: vec![(1, 100), (1, 300), (2, 0)],
            sync_samples: Some(vec![1]),
            sample_sizes: vec![10, 20, 30, 40],
            sample_to_chunk: vec![
                ChunkRun {
                    first_chunk: 1,
                    samples_per_chunk: 3,
                },
                ChunkRun {
                    first_chunk: 2,
                    samples_per_chunk: 1,
                },
            ],
            chunk_offsets: vec![1000, 5000],
        };

        let layout = table.layout().unwrap();
        let offsets: Vec<u64> = layout.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![1000, 1010, 1030, 5000]);
        let cts: Vec<i64> = layout.iter().map(|s| s.composition_time).collect();
        assert_eq!(cts, vec![100, 400, 200, 300]);
        assert!(layout[0].is_sync);
        assert!(!layout[1].is_sync);
    }

    #[test]
    fn test_layout_rejects_short_chunk_tables() {
        let table = SampleTable {
            time_to_sample: vec![(3, 1)],
            sample_sizes: vec![1, 1, 1],
            sample_to_chunk: vec![ChunkRun {
                first_chunk: 1,
                samples_per_chunk: 1,
            }],
            chunk_offsets: vec![0, 1],
            ..SampleTable::default()
        };
        assert!(matches!(table.layout(), Err(DemuxError::Malformed { .. })));
    }

    #[test]
    fn test_uniform_stsz_count_is_bounded() {
        let mut stsz = Vec::new();
        stsz.extend_from_slice(&20u32.to_be_bytes());
        stsz.extend_from_slice(b"stsz");
        stsz.extend_from_slice(&[0, 0, 0, 0]);
        stsz.extend_from_slice(&1000u32.to_be_bytes());
        stsz.extend_from_slice(&u32::MAX.to_be_bytes());

        let mut track = Track {
            id: 1,
            handler: FourCc::VIDE,
            width: 4,
            height: 2,
            timescale: 12800,
            duration: 0,
            edit_start: None,
            entry: None,
            table: SampleTable::default(),
        };
        let err = parse_stbl(&stsz, &mut track).unwrap_err();
        assert!(matches!(err, DemuxError::Malformed { kind: FourCc::STSZ, .. }));
        assert!(track.table.sample_sizes.is_empty());

        // At the limit the table is accepted
        let mut stsz = stsz[..16].to_vec();
        stsz.extend_from_slice(&(MAX_SAMPLES as u32).to_be_bytes());
        parse_stbl(&stsz, &mut track).unwrap();
        assert_eq!(track.table.sample_count(), MAX_SAMPLES);
    }

    #[test]
    fn test_elst_skips_empty_edits() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&500u32.to_be_bytes());
        data.extend_from_slice(&(-1i32).to_be_bytes());
        data.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        data.extend_from_slice(&1000u32.to_be_bytes());
        data.extend_from_slice(&1024i32.to_be_bytes());
        data.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        assert_eq!(parse_elst(&data).unwrap(), Some(1024));
    }
}
