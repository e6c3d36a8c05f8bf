//! Rescanning RESP Reply Parser
//!
//! A second [`Decoder`] with a stateless core: each attempt parses from the
//! start of the buffered bytes and reports how much it consumed, or how many
//! buffered bytes it needs before another attempt can succeed.
//!
//! That hint keeps large values cheap. A bulk string trickling in over many
//! reads is scanned once for its header and then left alone until its last
//! byte has arrived. Arrays are walked with an explicit stack, so nesting
//! depth is bounded only by memory.
//!
//! ## How the Parser Works
//!
//! Each scan returns either:
//! - `Scanned::Complete(value, consumed)` - a whole value, `consumed` bytes were used
//! - `Scanned::Partial { needed }` - the value is incomplete until `needed` bytes are buffered
//! - `Err(ParseError)` - Invalid protocol data

use crate::protocol::parser::{
    find_crlf, parse_int, to_utf8, Decoder, DecoderLimits, ParseError, ParseResult,
};
use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::{Buf, Bytes, BytesMut};

/// Outcome of one scan over the buffered bytes.
#[derive(Debug, PartialEq)]
enum Scanned {
    Complete(RespValue, usize),
    Partial { needed: usize },
}

/// One step of the walk: a finished element or the header of an array.
enum Item {
    Value(RespValue, usize),
    ArrayHeader(usize, usize),
    Partial(usize),
}

/// An array whose elements are still being collected.
struct Frame {
    items: Vec<RespValue>,
    remaining: usize,
}

/// Stateless parser that rescans partial values once enough bytes arrive.
#[derive(Debug)]
pub struct ScanParser {
    buffer: BytesMut,
    limits: DecoderLimits,
    /// No attempt can succeed with fewer bytes buffered
    needed: usize,
    failed: Option<ParseError>,
}

impl Default for ScanParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanParser {
    pub fn new() -> Self {
        Self::with_limits(DecoderLimits::default())
    }

    pub fn with_limits(limits: DecoderLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            limits,
            needed: 0,
            failed: None,
        }
    }

    /// Attempts to parse one value from the front of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        match self.scan(buf)? {
            Scanned::Complete(value, consumed) => Ok(Some((value, consumed))),
            Scanned::Partial { .. } => Ok(None),
        }
    }

    fn scan(&self, buf: &[u8]) -> ParseResult<Scanned> {
        let mut stack: Vec<Frame> = Vec::new();
        let mut pos = 0;

        loop {
            let mut value = match self.item(buf, pos)? {
                Item::Partial(needed) => return Ok(Scanned::Partial { needed }),
                Item::Value(value, next) => {
                    pos = next;
                    value
                }
                Item::ArrayHeader(0, next) => {
                    pos = next;
                    RespValue::Array(Vec::new())
                }
                Item::ArrayHeader(count, next) => {
                    pos = next;
                    stack.push(Frame {
                        items: Vec::with_capacity(count.min(1024)),
                        remaining: count,
                    });
                    continue;
                }
            };

            // Fold the finished value into its parents.
            loop {
                let Some(frame) = stack.last_mut() else {
                    return Ok(Scanned::Complete(value, pos));
                };
                frame.items.push(value);
                frame.remaining -= 1;
                if frame.remaining > 0 {
                    break;
                }
                let items = std::mem::take(&mut frame.items);
                stack.pop();
                value = RespValue::Array(items);
            }
        }
    }

    fn item(&self, buf: &[u8], pos: usize) -> ParseResult<Item> {
        let Some(&marker) = buf.get(pos) else {
            return Ok(Item::Partial(pos + 1));
        };
        let Some(line_end) = self.header(&buf[pos..])? else {
            return Ok(Item::Partial(buf.len() + 1));
        };
        let line = &buf[pos + 1..pos + 1 + line_end];
        // +1 for prefix, +2 for CRLF
        let next = pos + 1 + line_end + 2;

        match marker {
            prefix::SIMPLE_STRING => Ok(Item::Value(RespValue::SimpleString(to_utf8(line)?), next)),
            prefix::ERROR => Ok(Item::Value(RespValue::Error(to_utf8(line)?), next)),
            prefix::INTEGER => Ok(Item::Value(RespValue::Integer(parse_int(line)?), next)),
            prefix::BULK_STRING => self.bulk_string(buf, parse_int(line)?, next),
            prefix::ARRAY => match parse_int(line)? {
                -1 => Ok(Item::Value(RespValue::NullArray, next)),
                count if count < 0 => Err(ParseError::InvalidArrayLength(count)),
                count => {
                    let count = usize::try_from(count)
                        .map_err(|e| ParseError::InvalidInteger(e.to_string()))?;
                    Ok(Item::ArrayHeader(count, next))
                }
            },
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Finds the header line after the type byte. Returns its length, or
    /// `None` if the terminator has not arrived yet.
    fn header(&self, buf: &[u8]) -> ParseResult<Option<usize>> {
        match find_crlf(&buf[1..]) {
            Some(pos) if pos + 1 > self.limits.max_line_length => Err(ParseError::LineTooLong {
                max: self.limits.max_line_length,
            }),
            Some(pos) => Ok(Some(pos)),
            None if buf.len() > self.limits.max_line_length + 1 => Err(ParseError::LineTooLong {
                max: self.limits.max_line_length,
            }),
            None => Ok(None),
        }
    }

    /// Parses the payload of a bulk string whose header ends at `data_start`.
    fn bulk_string(&self, buf: &[u8], length: i64, data_start: usize) -> ParseResult<Item> {
        if length == -1 {
            return Ok(Item::Value(RespValue::Null, data_start));
        }
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length =
            usize::try_from(length).map_err(|e| ParseError::InvalidInteger(e.to_string()))?;
        if length > self.limits.max_bulk_length {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: self.limits.max_bulk_length,
            });
        }

        let total_needed = data_start + length + 2;
        if buf.len() < total_needed {
            return Ok(Item::Partial(total_needed));
        }
        if &buf[data_start + length..total_needed] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
        Ok(Item::Value(RespValue::BulkString(data), total_needed))
    }
}

impl Decoder for ScanParser {
    fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_value(&mut self) -> ParseResult<Option<RespValue>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.buffer.is_empty() || self.buffer.len() < self.needed {
            return Ok(None);
        }
        match self.scan(&self.buffer) {
            Ok(Scanned::Complete(value, consumed)) => {
                self.buffer.advance(consumed);
                self.needed = 0;
                Ok(Some(value))
            }
            Ok(Scanned::Partial { needed }) => {
                self.needed = needed;
                Ok(None)
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reports_consumed() {
        let parser = ScanParser::new();
        let (value, consumed) = parser.parse(b"$5\r\nhello\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::bulk_string("hello"));
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_parse_incomplete_array() {
        let parser = ScanParser::new();
        assert!(parser.parse(b"*2\r\n:1\r\n").unwrap().is_none());
        assert!(parser.parse(b"*2\r\n:1\r\n:2").unwrap().is_none());
    }

    #[test]
    fn test_parse_null_markers() {
        let parser = ScanParser::new();
        assert_eq!(
            parser.parse(b"*-1\r\n").unwrap(),
            Some((RespValue::NullArray, 5))
        );
        assert_eq!(parser.parse(b"$-1\r\n").unwrap(), Some((RespValue::Null, 5)));
        assert_eq!(
            parser.parse(b"*2\r\n*-1\r\n$-1\r\n").unwrap(),
            Some((
                RespValue::Array(vec![RespValue::NullArray, RespValue::Null]),
                14
            ))
        );
    }

    #[test]
    fn test_inline_text_is_rejected() {
        let parser = ScanParser::new();
        assert_eq!(
            parser.parse(b"PONG\r\n"),
            Err(ParseError::UnknownPrefix(b'P'))
        );
    }

    #[test]
    fn test_partial_bulk_waits_for_its_length() {
        let mut parser = ScanParser::new();
        assert_eq!(parser.feed(b"*2\r\n:1\r\n$10\r\nab").count(), 0);
        // 8 bytes of array header and first element, 5 of bulk header, 10 + 2 of payload
        assert_eq!(parser.needed, 25);

        assert_eq!(parser.feed(b"cdefgh").count(), 0);
        assert_eq!(parser.needed, 25);

        let values: Vec<_> = parser.feed(b"ij\r\n").collect();
        assert_eq!(
            values,
            vec![Ok(RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::bulk_string("abcdefghij"),
            ]))]
        );
        assert_eq!(parser.needed, 0);
    }

    #[test]
    fn test_decoder_keeps_remainder() {
        let mut parser = ScanParser::new();
        let values: Vec<_> = parser.feed(b":1\r\n$3\r\nab").collect();
        assert_eq!(values, vec![Ok(RespValue::Integer(1))]);
        assert_eq!(parser.buffered(), 6);

        let values: Vec<_> = parser.feed(b"c\r\n").collect();
        assert_eq!(values, vec![Ok(RespValue::bulk_string("abc"))]);
        assert_eq!(parser.buffered(), 0);
    }
}
