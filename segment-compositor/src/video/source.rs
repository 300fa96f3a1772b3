//! Where encoded video bytes come from
//!
//! A source is either one complete buffer, a file read in chunks, or a
//! channel of offset-tagged ranges that may arrive in any order.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::decoder::StopToken;
use super::demux::ByteRange;

/// How often a blocked range reader re-checks its stop token
const RANGE_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub enum VideoSource {
    /// The whole container in memory
    Buffer(Bytes),
    /// A local file, read sequentially in chunks
    File(PathBuf),
    /// Ranges pushed by a downloader; the sender closing marks end of input
    Ranges(Receiver<ByteRange>),
}

impl fmt::Debug for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl VideoSource {
    /// A range-fed source and the sender that feeds it.
    pub fn channel() -> (Sender<ByteRange>, VideoSource) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (tx, VideoSource::Ranges(rx))
    }

    pub fn describe(&self) -> String {
        match self {
            VideoSource::Buffer(data) => format!("buffer ({} bytes)", data.len()),
            VideoSource::File(path) => format!("file {}", path.display()),
            VideoSource::Ranges(_) => "byte-range stream".to_string(),
        }
    }

    pub(crate) fn open(self, chunk_bytes: usize) -> io::Result<SourceReader> {
        let inner = match self {
            VideoSource::Buffer(data) => Inner::Buffer(Some(data)),
            VideoSource::File(path) => Inner::File {
                file: File::open(path)?,
                offset: 0,
                chunk: chunk_bytes.max(1),
            },
            VideoSource::Ranges(rx) => Inner::Ranges(rx),
        };
        Ok(SourceReader { inner })
    }
}

#[derive(Debug)]
enum Inner {
    Buffer(Option<Bytes>),
    File { file: File, offset: u64, chunk: usize },
    Ranges(Receiver<ByteRange>),
}

/// Pulls byte ranges out of a [`VideoSource`]
#[derive(Debug)]
pub(crate) struct SourceReader {
    inner: Inner,
}

impl SourceReader {
    /// Next range, or `None` at end of input or once `stop` is set.
    pub fn next_range(&mut self, stop: &StopToken) -> io::Result<Option<ByteRange>> {
        if stop.is_stopped() {
            return Ok(None);
        }
        match &mut self.inner {
            Inner::Buffer(data) => Ok(data.take().map(|data| ByteRange::new(0, data))),
            Inner::File {
                file,
                offset,
                chunk,
            } => {
                let mut buf = vec![0u8; *chunk];
                let mut filled = 0;
                while filled < buf.len() {
                    match file.read(&mut buf[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                if filled == 0 {
                    return Ok(None);
                }
                buf.truncate(filled);
                let range = ByteRange::new(*offset, buf);
                *offset += filled as u64;
                Ok(Some(range))
            }
            Inner::Ranges(rx) => loop {
                match rx.recv_timeout(RANGE_POLL_INTERVAL) {
                    Ok(range) => return Ok(Some(range)),
                    Err(RecvTimeoutError::Disconnected) => return Ok(None),
                    Err(RecvTimeoutError::Timeout) if stop.is_stopped() => return Ok(None),
                    Err(RecvTimeoutError::Timeout) => {}
                }
            },
        }
    }
}
