//! Incremental parser for `multipart/x-savi-stream` responses
//!
//! Parts look like
//!
//! ```text
//! --frame\r\n
//! Content-Type: application/json; charset=utf-8\r\n
//! Content-Length: 42\r\n
//! \r\n
//! {...}
//! ```
//!
//! Bytes arrive in arbitrary chunks. A part is returned once its body is
//! complete: `Content-Length` bytes when the header is present, otherwise
//! everything up to the next delimiter (or end of stream).

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("malformed part header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),
    #[error("part headers are not UTF-8")]
    NonUtf8Header,
}

/// One part of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Part {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Extract the `boundary` parameter of a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

pub struct MultipartParser {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    eof: bool,
    closed: bool,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            buffer: BytesMut::new(),
            eof: false,
            closed: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if !self.closed {
            self.buffer.extend_from_slice(data);
        }
    }

    /// No more input will arrive; a trailing part without length is
    /// completed by end of stream.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// The closing delimiter has been seen
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes received but not yet returned as part of a part
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete part, or `None` until more input arrives.
    pub fn next_part(&mut self) -> Result<Option<Part>, MultipartError> {
        if self.closed {
            return Ok(None);
        }
        let Some(start) = find(&self.buffer, &self.delimiter, 0) else {
            if self.eof {
                self.buffer.clear();
            }
            return Ok(None);
        };
        // Preamble or the CRLF ending the previous body
        self.buffer.advance(start);

        let after = self.delimiter.len();
        if self.buffer.len() < after + 2 {
            return Ok(None);
        }
        if &self.buffer[after..after + 2] == b"--" {
            self.closed = true;
            self.buffer.clear();
            return Ok(None);
        }

        let Some((header_end, body_start)) = header_block_end(&self.buffer, after) else {
            return Ok(None);
        };
        let headers = parse_headers(&self.buffer[after..header_end])?;
        let content_length = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
            .map(|(_, value)| {
                value
                    .parse::<usize>()
                    .map_err(|_| MultipartError::InvalidContentLength(value.clone()))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) if self.buffer.len() >= body_start + len => body_start + len,
            Some(_) => return Ok(None),
            None => match find(&self.buffer, &self.delimiter, body_start) {
                Some(next) => trim_line_end(&self.buffer, body_start, next),
                None if self.eof => trim_line_end(&self.buffer, body_start, self.buffer.len()),
                None => return Ok(None),
            },
        };

        let mut part = self.buffer.split_to(body_end);
        part.advance(body_start);
        Ok(Some(Part {
            headers,
            body: part.freeze(),
        }))
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// End of the header block starting at `from` (the delimiter line's end of
/// line included) and the body start.
fn header_block_end(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let crlf = find(buffer, b"\r\n\r\n", from).map(|pos| (pos, pos + 4));
    let lf = find(buffer, b"\n\n", from).map(|pos| (pos, pos + 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn trim_line_end(buffer: &[u8], start: usize, mut end: usize) -> usize {
    if end > start && buffer[end - 1] == b'\n' {
        end -= 1;
        if end > start && buffer[end - 1] == b'\r' {
            end -= 1;
        }
    }
    end
}

fn parse_headers(block: &[u8]) -> Result<Vec<(String, String)>, MultipartError> {
    let text = std::str::from_utf8(block).map_err(|_| MultipartError::NonUtf8Header)?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| MultipartError::MalformedHeader(line.to_string()))
        })
        .collect()
}
