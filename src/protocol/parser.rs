//! Incremental RESP frame parser.
//!
//! The parser runs over a borrowed byte slice and never blocks: the caller
//! appends whatever arrived from the socket and asks for the next frame.
//!
//! - `Ok(Some((value, consumed)))` — one complete frame, `consumed` bytes used
//! - `Ok(None)` — the buffer holds only a partial frame, retry with more data
//! - `Err(ParseError)` — the bytes cannot be RESP; the connection is beyond
//!   recovery at the framing layer
//!
//! Anything that is not one of the five framed kinds is an error. There is no
//! inline-command fallback: a stray `hello\r\n` is a protocol violation, not
//! a command.

use crate::protocol::types::RespValue;
use bytes::Bytes;
use thiserror::Error;

/// Hard ceiling on a single bulk string payload (512 MiB, as Redis).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum array nesting before the parser gives up.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected type byte {0:#04x}")]
    UnexpectedPrefix(u8),

    #[error("invalid integer field")]
    InvalidInteger,

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("bulk string of {0} bytes exceeds the {MAX_BULK_LEN} byte limit")]
    BulkTooLarge(usize),

    #[error("bulk string not terminated by CRLF")]
    UnterminatedBulk,

    #[error("arrays nested deeper than {MAX_DEPTH}")]
    TooDeep,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Attempts to decode one frame from the front of `buf`.
pub fn parse_frame(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let mut scanner = Scanner { buf, pos: 0 };
    match parse_value(&mut scanner, 0)? {
        Some(value) => Ok(Some((value, scanner.pos))),
        None => Ok(None),
    }
}

/// Byte cursor over the unparsed input.
struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = self.buf.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    /// The bytes up to the next CRLF, consuming the terminator as well.
    /// `None` while the terminator has not arrived yet.
    fn line(&mut self) -> Option<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let mut i = 0;
        while i + 1 < rest.len() {
            if rest[i] == b'\r' && rest[i + 1] == b'\n' {
                self.pos += i + 2;
                return Some(&rest[..i]);
            }
            i += 1;
        }
        None
    }

    /// Exactly `n` payload bytes followed by CRLF.
    fn payload(&mut self, n: usize) -> ParseResult<Option<&'a [u8]>> {
        let rest = &self.buf[self.pos..];
        if rest.len() < n + 2 {
            return Ok(None);
        }
        if &rest[n..n + 2] != b"\r\n" {
            return Err(ParseError::UnterminatedBulk);
        }
        self.pos += n + 2;
        Ok(Some(&rest[..n]))
    }
}

fn parse_value(sc: &mut Scanner<'_>, depth: usize) -> ParseResult<Option<RespValue>> {
    if depth > MAX_DEPTH {
        return Err(ParseError::TooDeep);
    }

    let prefix = match sc.next_byte() {
        Some(b) => b,
        None => return Ok(None),
    };

    match prefix {
        b'+' => Ok(sc.line().map(|line| {
            RespValue::Simple(String::from_utf8_lossy(line).into_owned())
        })),
        b'-' => Ok(sc.line().map(|line| {
            RespValue::Error(String::from_utf8_lossy(line).into_owned())
        })),
        b':' => match sc.line() {
            Some(line) => Ok(Some(RespValue::Integer(parse_i64(line)?))),
            None => Ok(None),
        },
        b'$' => parse_bulk(sc),
        b'*' => parse_array(sc, depth),
        other => Err(ParseError::UnexpectedPrefix(other)),
    }
}

fn parse_bulk(sc: &mut Scanner<'_>) -> ParseResult<Option<RespValue>> {
    let len = match sc.line() {
        Some(line) => parse_i64(line)?,
        None => return Ok(None),
    };

    if len == -1 {
        return Ok(Some(RespValue::Null));
    }
    if len < 0 {
        return Err(ParseError::InvalidLength(len));
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(ParseError::BulkTooLarge(len));
    }

    match sc.payload(len)? {
        Some(data) => Ok(Some(RespValue::Bulk(Bytes::copy_from_slice(data)))),
        None => Ok(None),
    }
}

fn parse_array(sc: &mut Scanner<'_>, depth: usize) -> ParseResult<Option<RespValue>> {
    let count = match sc.line() {
        Some(line) => parse_i64(line)?,
        None => return Ok(None),
    };

    if count == -1 {
        return Ok(Some(RespValue::Null));
    }
    if count < 0 {
        return Err(ParseError::InvalidLength(count));
    }

    let mut items = Vec::with_capacity((count as usize).min(64));
    for _ in 0..count {
        match parse_value(sc, depth + 1)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(RespValue::Array(items)))
}

fn parse_i64(line: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(line).map_err(|_| ParseError::InvalidInteger)?;
    s.parse().map_err(|_| ParseError::InvalidInteger)
}
