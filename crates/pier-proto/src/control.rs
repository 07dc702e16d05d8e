//! In-band control frames.
//!
//! Control signals travel in the same byte stream as terminal output, wrapped in an
//! APC envelope that real terminal emulators swallow:
//!
//! ```text
//! ESC _ p i e r ; <type> ; <payload length> ; <payload> ESC \
//! ```
//!
//! The decimal length makes every frame self-delimiting, so payloads may contain any
//! byte (including `ESC \`) and a frame split across reads is simply reported as
//! incomplete until the rest arrives.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::keys::KeyEvent;

pub const FRAME_PREFIX: &[u8] = b"\x1b_pier;";
pub const FRAME_SUFFIX: &[u8] = b"\x1b\\";
pub const MAX_PAYLOAD: usize = 1 << 20;

const FIELD_SEPARATOR: u8 = b';';
const MAX_TYPE_LEN: usize = 16;
const MAX_LENGTH_DIGITS: usize = 10;

const TYPE_ECHO: &str = "echo";
const TYPE_EXEC: &str = "exec";
const TYPE_KEYPRESS: &str = "keypress";
const TYPE_STDERR: &str = "stderr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Echo { enabled: bool },
    Exec { command_line: String },
    Keypress { event: KeyEvent },
    /// Error-stream output; plain bytes are the output stream.
    Stderr(Bytes),
    /// Plain bytes that sit between envelopes.
    Raw(Bytes),
}

impl ControlFrame {
    pub fn echo(enabled: bool) -> Self {
        ControlFrame::Echo { enabled }
    }

    pub fn exec(command_line: impl Into<String>) -> Self {
        ControlFrame::Exec {
            command_line: command_line.into(),
        }
    }

    pub fn keypress(event: KeyEvent) -> Self {
        ControlFrame::Keypress { event }
    }

    pub fn stderr(bytes: impl Into<Bytes>) -> Self {
        ControlFrame::Stderr(bytes.into())
    }

    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        ControlFrame::Raw(bytes.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlFrame::Echo { .. } => TYPE_ECHO,
            ControlFrame::Exec { .. } => TYPE_EXEC,
            ControlFrame::Keypress { .. } => TYPE_KEYPRESS,
            ControlFrame::Stderr(_) => TYPE_STDERR,
            ControlFrame::Raw(_) => "raw",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown control frame type: {0}")]
    UnknownType(String),
    #[error("malformed control frame header: {0}")]
    InvalidHeader(&'static str),
    #[error("control frame payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
    #[error("control frame is missing its terminator")]
    MissingTerminator,
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// Result of a single [`decode`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A frame and the number of bytes it occupied.
    Frame(ControlFrame, usize),
    /// Nothing can be consumed until more bytes arrive.
    Incomplete,
    /// A broken envelope; the bytes up to `skip` should be dropped.
    Malformed(ProtocolError, usize),
}

pub fn encode(frame: &ControlFrame) -> Vec<u8> {
    let (kind, payload): (&str, Vec<u8>) = match frame {
        ControlFrame::Raw(bytes) => return bytes.to_vec(),
        ControlFrame::Echo { enabled } => (TYPE_ECHO, enabled.to_string().into_bytes()),
        ControlFrame::Exec { command_line } => (TYPE_EXEC, command_line.as_bytes().to_vec()),
        ControlFrame::Stderr(bytes) => (TYPE_STDERR, bytes.to_vec()),
        // KeyEvent only holds strings and bools, serialization cannot fail.
        ControlFrame::Keypress { event } => {
            (TYPE_KEYPRESS, serde_json::to_vec(event).unwrap_or_default())
        }
    };

    let length = payload.len().to_string();
    let mut buf = Vec::with_capacity(
        FRAME_PREFIX.len() + kind.len() + length.len() + payload.len() + FRAME_SUFFIX.len() + 2,
    );
    buf.extend_from_slice(FRAME_PREFIX);
    buf.extend_from_slice(kind.as_bytes());
    buf.push(FIELD_SEPARATOR);
    buf.extend_from_slice(length.as_bytes());
    buf.push(FIELD_SEPARATOR);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(FRAME_SUFFIX);
    buf
}

/// Decodes the next item at the start of `buf`.
///
/// Plain bytes up to the next envelope come back as [`ControlFrame::Raw`]. A trailing
/// fragment that could still grow into an envelope prefix is held back as
/// [`Decoded::Incomplete`].
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.is_empty() {
        return Decoded::Incomplete;
    }

    match find_frame_start(buf) {
        None => Decoded::Frame(ControlFrame::raw(Bytes::copy_from_slice(buf)), buf.len()),
        Some((0, true)) => decode_envelope(buf),
        Some((0, false)) => Decoded::Incomplete,
        Some((pos, _)) => Decoded::Frame(ControlFrame::raw(Bytes::copy_from_slice(&buf[..pos])), pos),
    }
}

/// True when `chunk` begins with a control envelope.
pub fn is_control_frame(chunk: &[u8]) -> bool {
    chunk.starts_with(FRAME_PREFIX)
}

/// Position of the first envelope prefix, and whether it is complete.
fn find_frame_start(buf: &[u8]) -> Option<(usize, bool)> {
    buf.iter()
        .enumerate()
        .filter(|(_, byte)| **byte == FRAME_PREFIX[0])
        .find_map(|(pos, _)| {
            let tail = &buf[pos..];
            if tail.starts_with(FRAME_PREFIX) {
                Some((pos, true))
            } else if FRAME_PREFIX.starts_with(tail) {
                Some((pos, false))
            } else {
                None
            }
        })
}

fn decode_envelope(buf: &[u8]) -> Decoded {
    let mut cursor = Cursor::new(buf, FRAME_PREFIX.len());

    let kind = match cursor.read_field(MAX_TYPE_LEN) {
        Ok(Some(kind)) => kind,
        Ok(None) => return Decoded::Incomplete,
        Err(err) => return Decoded::Malformed(err, resync_point(buf)),
    };
    if kind.is_empty() || !kind.iter().all(u8::is_ascii_lowercase) {
        return Decoded::Malformed(ProtocolError::InvalidHeader("type"), resync_point(buf));
    }

    let length = match cursor.read_field(MAX_LENGTH_DIGITS) {
        Ok(Some(digits)) => match parse_length(digits) {
            Ok(length) => length,
            Err(err) => return Decoded::Malformed(err, resync_point(buf)),
        },
        Ok(None) => return Decoded::Incomplete,
        Err(err) => return Decoded::Malformed(err, resync_point(buf)),
    };

    if cursor.remaining() < length + FRAME_SUFFIX.len() {
        return Decoded::Incomplete;
    }
    let payload = cursor.read_bytes(length);
    if cursor.read_bytes(FRAME_SUFFIX.len()) != FRAME_SUFFIX {
        return Decoded::Malformed(ProtocolError::MissingTerminator, resync_point(buf));
    }
    let consumed = cursor.pos;

    // The tag was validated as ASCII above.
    let kind = String::from_utf8_lossy(kind);
    match build_frame(&kind, payload) {
        Ok(frame) => Decoded::Frame(frame, consumed),
        Err(err) => Decoded::Malformed(err, consumed),
    }
}

fn parse_length(digits: &[u8]) -> Result<usize, ProtocolError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidHeader("length"));
    }
    let length = std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or(ProtocolError::InvalidHeader("length"))?;
    if length > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(length));
    }
    Ok(length)
}

fn build_frame(kind: &str, payload: &[u8]) -> Result<ControlFrame, ProtocolError> {
    match kind {
        TYPE_ECHO => match payload {
            b"true" => Ok(ControlFrame::echo(true)),
            b"false" => Ok(ControlFrame::echo(false)),
            _ => Err(invalid_payload(TYPE_ECHO, "expected true or false")),
        },
        TYPE_EXEC => std::str::from_utf8(payload)
            .map(ControlFrame::exec)
            .map_err(|err| invalid_payload(TYPE_EXEC, err)),
        TYPE_KEYPRESS => serde_json::from_slice::<KeyEvent>(payload)
            .map(ControlFrame::keypress)
            .map_err(|err| invalid_payload(TYPE_KEYPRESS, err)),
        TYPE_STDERR => Ok(ControlFrame::stderr(Bytes::copy_from_slice(payload))),
        other => Err(ProtocolError::UnknownType(other.to_owned())),
    }
}

fn invalid_payload(kind: &'static str, reason: impl ToString) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind,
        reason: reason.to_string(),
    }
}

/// Where decoding resumes after a broken header: just past the envelope terminator or
/// at the next envelope prefix, whichever comes first.
fn resync_point(buf: &[u8]) -> usize {
    let search_from = FRAME_PREFIX.len();
    let body = &buf[search_from..];
    let terminator = body
        .windows(FRAME_SUFFIX.len())
        .position(|window| window == FRAME_SUFFIX)
        .map(|pos| search_from + pos + FRAME_SUFFIX.len());
    let next_start = find_frame_start(body)
        .filter(|(_, complete)| *complete)
        .map(|(pos, _)| search_from + pos);

    match (terminator, next_start) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => buf.len(),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    /// Reads up to the next separator. `Ok(None)` means the field may still be
    /// arriving.
    fn read_field(&mut self, max_len: usize) -> Result<Option<&'a [u8]>, ProtocolError> {
        let rest = &self.bytes[self.pos..];
        match rest.iter().position(|byte| *byte == FIELD_SEPARATOR) {
            Some(len) if len <= max_len => {
                self.pos += len + 1;
                Ok(Some(&rest[..len]))
            }
            Some(_) => Err(ProtocolError::InvalidHeader("field too long")),
            None if rest.len() <= max_len => Ok(None),
            None => Err(ProtocolError::InvalidHeader("field too long")),
        }
    }

    fn read_bytes(&mut self, len: usize) -> &'a [u8] {
        let end = (self.pos + len).min(self.bytes.len());
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        slice
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}

/// Buffers socket reads and yields frames as they become complete.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    buffer: BytesMut,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Releases whatever is buffered as plain bytes, e.g. a lone trailing `ESC` once the
    /// peer has gone quiet.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    /// True when all that is held is the start of an envelope prefix, such as a lone `ESC`.
    pub fn holds_partial_prefix(&self) -> bool {
        !self.buffer.is_empty()
            && self.buffer.len() < FRAME_PREFIX.len()
            && FRAME_PREFIX.starts_with(&self.buffer)
    }

    /// Releases a held partial prefix as plain bytes. A started envelope is kept, since
    /// its remaining bytes may still be in flight.
    pub fn release_partial_prefix(&mut self) -> Option<Bytes> {
        if self.holds_partial_prefix() {
            self.flush()
        } else {
            None
        }
    }
}

impl Iterator for ControlDecoder {
    type Item = Result<ControlFrame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        match decode(&self.buffer) {
            Decoded::Frame(ControlFrame::Raw(_), consumed) => {
                Some(Ok(ControlFrame::Raw(self.buffer.split_to(consumed).freeze())))
            }
            Decoded::Frame(frame, consumed) => {
                self.buffer.advance(consumed);
                Some(Ok(frame))
            }
            Decoded::Incomplete => None,
            Decoded::Malformed(err, skip) => {
                self.buffer.advance(skip.min(self.buffer.len()));
                Some(Err(err))
            }
        }
    }
}
