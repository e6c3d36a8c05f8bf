//! Incremental RESP Reply Parser
//!
//! This module turns an arbitrarily fragmented byte stream into complete
//! [`RespValue`]s. Bytes are appended with [`Decoder::feed`], which returns a
//! lazy iterator over every value that became complete.
//!
//! ## Design
//!
//! [`RespParser`] is an explicit state machine rather than a recursive
//! descent over the buffered bytes:
//!
//! - Bytes that have been turned into (part of) a value are split off the
//!   buffer immediately, so a value that arrives in many pieces is never
//!   scanned twice.
//! - A bulk string whose length line has been read but whose payload has not
//!   fully arrived is remembered as `pending_bulk`.
//! - Arrays under construction live on an explicit stack, so nesting depth is
//!   bounded by memory, not by the call stack.
//!
//! Once a [`ParseError`] is returned the stream is out of sync; the parser
//! keeps returning that same error and never attempts to recover.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::trace;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format, or a length outside the representable range
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// A line grew past the configured limit without a terminator
    #[error("line exceeds {max} bytes without CRLF")]
    LineTooLong { max: usize },

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The bulk string exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum length of a single unterminated line (type byte + header or status)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Size limits enforced while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
    pub max_line_length: usize,
    pub max_bulk_length: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_line_length: MAX_LINE_LENGTH,
            max_bulk_length: MAX_BULK_SIZE,
        }
    }
}

/// A byte-to-value transducer for server replies.
///
/// Implementations buffer partial values across calls. They know nothing
/// about commands; matching values to requests happens elsewhere.
pub trait Decoder: Send {
    /// Appends raw bytes to the internal buffer without decoding anything.
    fn extend(&mut self, chunk: &[u8]);

    /// Decodes the next complete value, or `Ok(None)` if more bytes are needed.
    fn next_value(&mut self) -> ParseResult<Option<RespValue>>;

    /// Number of bytes buffered but not yet part of an emitted value.
    fn buffered(&self) -> usize;

    /// Appends `chunk` and returns an iterator over every value that is now
    /// complete. Values are decoded lazily as the iterator is advanced; any
    /// left unread stay buffered for the next call.
    fn feed(&mut self, chunk: &[u8]) -> Values<'_, Self>
    where
        Self: Sized,
    {
        self.extend(chunk);
        Values {
            decoder: self,
            done: false,
        }
    }
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn extend(&mut self, chunk: &[u8]) {
        (**self).extend(chunk)
    }

    fn next_value(&mut self) -> ParseResult<Option<RespValue>> {
        (**self).next_value()
    }

    fn buffered(&self) -> usize {
        (**self).buffered()
    }
}

/// Lazy sequence of decoded values, see [`Decoder::feed`].
///
/// The iterator fuses after the first error.
pub struct Values<'a, D: ?Sized> {
    decoder: &'a mut D,
    done: bool,
}

impl<D: Decoder + ?Sized> Iterator for Values<'_, D> {
    type Item = ParseResult<RespValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.next_value() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// An array whose elements are still arriving.
#[derive(Debug)]
struct PartialArray {
    remaining: usize,
    items: Vec<RespValue>,
}

/// Resumable state-machine parser.
///
/// # Example
///
/// ```
/// use respwire::protocol::{Decoder, RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// assert_eq!(parser.feed(b"$5\r\nhel").count(), 0);
///
/// let values: Vec<_> = parser.feed(b"lo\r\n:1\r\n").collect();
/// assert_eq!(values.len(), 2);
/// assert_eq!(values[0], Ok(RespValue::bulk_string("hello")));
/// ```
#[derive(Debug)]
pub struct RespParser {
    buffer: BytesMut,

    /// Bytes at the front of `buffer` already searched for CRLF
    scanned: usize,

    /// Declared length of a bulk string whose payload is still arriving
    pending_bulk: Option<usize>,

    stack: Vec<PartialArray>,

    limits: DecoderLimits,

    failed: Option<ParseError>,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    /// Creates a new parser with default limits.
    pub fn new() -> Self {
        Self::with_limits(DecoderLimits::default())
    }

    pub fn with_limits(limits: DecoderLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            scanned: 0,
            pending_bulk: None,
            stack: Vec::new(),
            limits,
            failed: None,
        }
    }

    /// Nesting depth of the array currently being assembled.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn decode(&mut self) -> ParseResult<Option<RespValue>> {
        loop {
            let value = match self.pending_bulk {
                Some(len) => match self.take_bulk(len)? {
                    Some(value) => value,
                    None => return Ok(None),
                },
                None => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    match self.parse_line(line)? {
                        Some(value) => value,
                        // Header of a bulk string or non-empty array
                        None => continue,
                    }
                }
            };

            if let Some(complete) = self.attach(value) {
                return Ok(Some(complete));
            }
        }
    }

    /// Interprets one CRLF-terminated line. Returns `None` when the line only
    /// opened a bulk string or an array.
    fn parse_line(&mut self, line: BytesMut) -> ParseResult<Option<RespValue>> {
        let (&type_byte, payload) = line
            .split_first()
            .ok_or_else(|| ParseError::ProtocolError("empty line".to_string()))?;

        match type_byte {
            prefix::SIMPLE_STRING => Ok(Some(RespValue::SimpleString(to_utf8(payload)?))),
            prefix::ERROR => Ok(Some(RespValue::Error(to_utf8(payload)?))),
            prefix::INTEGER => Ok(Some(RespValue::Integer(parse_int(payload)?))),
            prefix::BULK_STRING => {
                let length = parse_int(payload)?;
                match length {
                    -1 => Ok(Some(RespValue::Null)),
                    n if n < -1 => Err(ParseError::InvalidBulkLength(n)),
                    n => {
                        let size = usize::try_from(n)
                            .map_err(|e| ParseError::InvalidInteger(e.to_string()))?;
                        if size > self.limits.max_bulk_length {
                            return Err(ParseError::MessageTooLarge {
                                size,
                                max: self.limits.max_bulk_length,
                            });
                        }
                        self.pending_bulk = Some(size);
                        Ok(None)
                    }
                }
            }
            prefix::ARRAY => {
                let count = parse_int(payload)?;
                match count {
                    -1 => Ok(Some(RespValue::NullArray)),
                    0 => Ok(Some(RespValue::Array(Vec::new()))),
                    n if n < -1 => Err(ParseError::InvalidArrayLength(n)),
                    n => {
                        let remaining = usize::try_from(n)
                            .map_err(|e| ParseError::InvalidInteger(e.to_string()))?;
                        self.stack.push(PartialArray {
                            remaining,
                            // The count comes off the wire; do not trust it for allocation
                            items: Vec::with_capacity(remaining.min(1024)),
                        });
                        Ok(None)
                    }
                }
            }
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Places a finished value into the innermost open array. Returns the
    /// top-level value once nothing is left open.
    fn attach(&mut self, mut value: RespValue) -> Option<RespValue> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Some(value);
            };
            top.items.push(value);
            top.remaining -= 1;
            if top.remaining > 0 {
                return None;
            }
            let done = self.stack.pop()?;
            value = RespValue::Array(done.items);
        }
    }

    fn take_line(&mut self) -> ParseResult<Option<BytesMut>> {
        // The CR of a split CRLF may be the last byte already scanned
        let start = self.scanned.saturating_sub(1);
        match find_crlf(&self.buffer[start..]) {
            Some(pos) => {
                let end = start + pos;
                if end > self.limits.max_line_length {
                    return Err(ParseError::LineTooLong {
                        max: self.limits.max_line_length,
                    });
                }
                let line = self.buffer.split_to(end);
                self.buffer.advance(CRLF.len());
                self.scanned = 0;
                Ok(Some(line))
            }
            None => {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.limits.max_line_length + 1 {
                    return Err(ParseError::LineTooLong {
                        max: self.limits.max_line_length,
                    });
                }
                Ok(None)
            }
        }
    }

    fn take_bulk(&mut self, len: usize) -> ParseResult<Option<RespValue>> {
        let needed = len + CRLF.len();
        if self.buffer.len() < needed {
            trace!(
                declared = len,
                buffered = self.buffer.len(),
                "Bulk string incomplete"
            );
            return Ok(None);
        }
        if &self.buffer[len..needed] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }
        let data = self.buffer.split_to(len).freeze();
        self.buffer.advance(CRLF.len());
        self.pending_bulk = None;
        Ok(Some(RespValue::BulkString(data)))
    }
}

impl Decoder for RespParser {
    fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_value(&mut self) -> ParseResult<Option<RespValue>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        match self.decode() {
            Ok(value) => Ok(value),
            Err(e) => {
                self.failed = Some(e.clone());
                Err(e)
            }
        }
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

pub(crate) fn to_utf8(bytes: &[u8]) -> ParseResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))
}

pub(crate) fn parse_int(bytes: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(bytes).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
    s.parse()
        .map_err(|e: std::num::ParseIntError| ParseError::InvalidInteger(format!("{:?}: {}", s, e)))
}
