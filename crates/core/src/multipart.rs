//! Incremental `multipart/form-data` decoder.
//!
//! The decoder is fed the request body chunk by chunk and forwards the first file part's
//! payload to a [`PartSink`] as it arrives, so memory use is bounded by the chunk size and the
//! delimiter length rather than by the upload.
//!
//! # States
//!
//! ```text
//! Preamble ──delimiter──▶ BoundaryLine ──CRLF──▶ Headers ──blank line──▶ Body
//!                              ▲                                         │
//!                              └──────────────── delimiter ──────────────┘
//!                         BoundaryLine ──"--"──▶ Epilogue
//! ```
//!
//! A part ends only at a full delimiter, `CRLF--boundary`, followed by `--`, optional
//! whitespace, or `CRLF`. Payload bytes that merely contain the boundary token are passed
//! through untouched. To let a body that starts directly with `--boundary` match the same
//! delimiter, the buffer is seeded with a virtual `CRLF`.

use crate::{LibraryError, LibraryResult};
use memchr::memmem;

/// Upper bound on one part's header block.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Upper bound on whitespace padding after a boundary token.
const MAX_BOUNDARY_PADDING: usize = 256;

/// Longest boundary accepted (RFC 2046 allows 70; some clients exceed it).
const MAX_BOUNDARY_LEN: usize = 200;

/// Receives the file part as it is decoded.
pub trait PartSink {
    /// Called once, when the file part's headers have been read and before any payload byte.
    ///
    /// Returning an error aborts decoding.
    fn begin_file(&mut self, filename: &str) -> LibraryResult<()>;

    /// Called with successive slices of the file payload.
    fn write_payload(&mut self, bytes: &[u8]) -> LibraryResult<()>;
}

/// Summary of the decoded file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPart {
    /// Filename exactly as sent in `Content-Disposition`
    pub filename: String,
    pub payload_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    BoundaryLine,
    Headers,
    Body { capture: bool },
    Epilogue,
}

enum Progress {
    Continue,
    NeedMore,
}

/// Streaming decoder for one multipart body.
#[derive(Debug)]
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    finder: memmem::Finder<'static>,
    buffer: Vec<u8>,
    state: State,
    file: Option<DecodedPart>,
    file_closed: bool,
}

impl MultipartDecoder {
    /// Creates a decoder for the given boundary token (without the leading `--`).
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        let finder = memmem::Finder::new(&delimiter).into_owned();

        Self {
            delimiter,
            finder,
            buffer: b"\r\n".to_vec(),
            state: State::Preamble,
            file: None,
            file_closed: false,
        }
    }

    /// Feeds the next chunk of the body.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::MalformedMultipart` on framing errors, or any error raised by
    /// the sink.
    pub fn feed(&mut self, chunk: &[u8], sink: &mut dyn PartSink) -> LibraryResult<()> {
        self.buffer.extend_from_slice(chunk);
        while let Progress::Continue = self.step(sink)? {}
        Ok(())
    }

    /// Completes decoding once the body has ended.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::MalformedMultipart` if no part carried a filename, the body ended
    /// before the file part's closing delimiter, or the payload was empty.
    pub fn finish(self) -> LibraryResult<DecodedPart> {
        let file = self.file.ok_or_else(|| {
            LibraryError::MalformedMultipart("no file part found in request".into())
        })?;
        if !self.file_closed {
            return Err(LibraryError::MalformedMultipart(
                "request body ended before the file part was complete".into(),
            ));
        }
        if file.payload_len == 0 {
            return Err(LibraryError::MalformedMultipart("uploaded file is empty".into()));
        }
        Ok(file)
    }

    fn step(&mut self, sink: &mut dyn PartSink) -> LibraryResult<Progress> {
        match self.state {
            State::Preamble => self.step_preamble(),
            State::BoundaryLine => self.step_boundary_line(),
            State::Headers => self.step_headers(sink),
            State::Body { capture } => self.step_body(capture, sink),
            State::Epilogue => {
                self.buffer.clear();
                Ok(Progress::NeedMore)
            }
        }
    }

    fn step_preamble(&mut self) -> LibraryResult<Progress> {
        match self.next_delimiter() {
            DelimiterSearch::Found(at) => {
                self.buffer.drain(..at + self.delimiter.len());
                self.state = State::BoundaryLine;
                Ok(Progress::Continue)
            }
            DelimiterSearch::FalseMatch(at) => {
                self.buffer.drain(..=at);
                Ok(Progress::Continue)
            }
            DelimiterSearch::Undecided(at) => {
                self.buffer.drain(..at);
                Ok(Progress::NeedMore)
            }
            DelimiterSearch::Absent => {
                let keep = self.delimiter.len() - 1;
                let discard = self.buffer.len().saturating_sub(keep);
                self.buffer.drain(..discard);
                Ok(Progress::NeedMore)
            }
        }
    }

    fn step_boundary_line(&mut self) -> LibraryResult<Progress> {
        if self.buffer.len() < 2 {
            return Ok(Progress::NeedMore);
        }
        if self.buffer.starts_with(b"--") {
            self.state = State::Epilogue;
            return Ok(Progress::Continue);
        }

        let Some(eol) = memmem::find(&self.buffer, b"\r\n") else {
            if self.buffer.len() > MAX_BOUNDARY_PADDING {
                return Err(LibraryError::MalformedMultipart(
                    "boundary line is not terminated".into(),
                ));
            }
            return Ok(Progress::NeedMore);
        };

        if !self.buffer[..eol].iter().all(|b| *b == b' ' || *b == b'\t') {
            return Err(LibraryError::MalformedMultipart(
                "unexpected data after boundary".into(),
            ));
        }
        self.buffer.drain(..eol + 2);
        self.state = State::Headers;
        Ok(Progress::Continue)
    }

    fn step_headers(&mut self, sink: &mut dyn PartSink) -> LibraryResult<Progress> {
        let (block_len, consumed) = if self.buffer.starts_with(b"\r\n") {
            (0, 2)
        } else {
            match memmem::find(&self.buffer, b"\r\n\r\n") {
                Some(end) => (end, end + 4),
                None => {
                    if self.buffer.len() > MAX_HEADER_BYTES {
                        return Err(LibraryError::MalformedMultipart(
                            "part headers too large".into(),
                        ));
                    }
                    return Ok(Progress::NeedMore);
                }
            }
        };
        if block_len > MAX_HEADER_BYTES {
            return Err(LibraryError::MalformedMultipart("part headers too large".into()));
        }

        let headers = String::from_utf8_lossy(&self.buffer[..block_len]).into_owned();
        self.buffer.drain(..consumed);

        let filename = filename_from_headers(&headers).filter(|f| !f.is_empty());
        let capture = match filename {
            Some(filename) if self.file.is_none() => {
                sink.begin_file(&filename)?;
                self.file = Some(DecodedPart {
                    filename,
                    payload_len: 0,
                });
                true
            }
            _ => false,
        };

        self.state = State::Body { capture };
        Ok(Progress::Continue)
    }

    fn step_body(&mut self, capture: bool, sink: &mut dyn PartSink) -> LibraryResult<Progress> {
        let (emit, consume, progress, closes) = match self.next_delimiter() {
            DelimiterSearch::Found(at) => (at, at + self.delimiter.len(), Progress::Continue, true),
            DelimiterSearch::FalseMatch(at) => (at + 1, at + 1, Progress::Continue, false),
            DelimiterSearch::Undecided(at) => (at, at, Progress::NeedMore, false),
            DelimiterSearch::Absent => {
                let safe = self.buffer.len().saturating_sub(self.delimiter.len() - 1);
                (safe, safe, Progress::NeedMore, false)
            }
        };

        if capture && emit > 0 {
            sink.write_payload(&self.buffer[..emit])?;
            if let Some(file) = self.file.as_mut() {
                file.payload_len += emit as u64;
            }
        }
        self.buffer.drain(..consume);

        if closes {
            if capture {
                self.file_closed = true;
            }
            self.state = State::BoundaryLine;
        }
        Ok(progress)
    }

    fn next_delimiter(&self) -> DelimiterSearch {
        let Some(at) = self.finder.find(&self.buffer) else {
            return DelimiterSearch::Absent;
        };
        let after = &self.buffer[at + self.delimiter.len()..];
        if after.len() < 2 {
            return DelimiterSearch::Undecided(at);
        }
        if after.starts_with(b"--")
            || after.starts_with(b"\r\n")
            || after[0] == b' '
            || after[0] == b'\t'
        {
            DelimiterSearch::Found(at)
        } else {
            DelimiterSearch::FalseMatch(at)
        }
    }
}

enum DelimiterSearch {
    /// A real delimiter starts at this offset
    Found(usize),
    /// The boundary token appears here but continues into other text
    FalseMatch(usize),
    /// A delimiter starts here but the bytes deciding it have not arrived
    Undecided(usize),
    Absent,
}

/// Extracts the boundary token from a `Content-Type` header value.
///
/// # Errors
///
/// Returns `LibraryError::MalformedMultipart` if the media type is not `multipart/form-data`
/// or no usable boundary parameter is present.
pub fn boundary_from_content_type(content_type: &str) -> LibraryResult<String> {
    let mut parts = split_params(content_type).into_iter();
    let media_type = parts.next().map(|(k, _)| k).unwrap_or_default();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return Err(LibraryError::MalformedMultipart(format!(
            "expected multipart/form-data, got '{}'",
            media_type
        )));
    }

    let boundary = parts
        .find(|(k, _)| k.eq_ignore_ascii_case("boundary"))
        .and_then(|(_, v)| v)
        .ok_or_else(|| LibraryError::MalformedMultipart("no boundary declared".into()))?;

    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(LibraryError::MalformedMultipart("invalid boundary".into()));
    }
    Ok(boundary)
}

/// Reads the filename from a part's header block.
///
/// `filename*` (RFC 5987, percent-encoded) wins over `filename` when both are present.
fn filename_from_headers(headers: &str) -> Option<String> {
    let disposition = headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-disposition")
            .then_some(value)
    })?;

    let params = split_params(disposition);
    let extended = params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("filename*"))
        .and_then(|(_, v)| v.as_deref())
        .and_then(decode_extended_value);
    if extended.is_some() {
        return extended;
    }

    params
        .into_iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("filename"))
        .and_then(|(_, v)| v)
}

/// Splits `token; key=value; key="quoted; value"` into `(key, value)` pairs.
///
/// The first element is the bare token with no value.
fn split_params(input: &str) -> Vec<(String, Option<String>)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .map(|segment| match segment.split_once('=') {
            Some((key, value)) => {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                (key.trim().to_string(), Some(value.to_string()))
            }
            None => (segment.trim().to_string(), None),
        })
        .collect()
}

/// Decodes `charset'lang'percent-encoded` values.
fn decode_extended_value(value: &str) -> Option<String> {
    let mut pieces = value.splitn(3, '\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;
    if !(charset.eq_ignore_ascii_case("utf-8") || charset.is_empty()) {
        return None;
    }

    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}
