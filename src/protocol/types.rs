//! RESP value type and wire encoding.
//!
//! Every value on the wire is one of five kinds, each introduced by a single
//! type byte and terminated by CRLF:
//!
//! - `+` Simple String: `+OK\r\n`
//! - `-` Error: `-ERR unknown command\r\n`
//! - `:` Integer: `:1000\r\n`
//! - `$` Bulk String: `$5\r\nhello\r\n` (length `-1` encodes nil: `$-1\r\n`)
//! - `*` Array: `*2\r\n<element><element>` (count `-1` encodes a nil array)
//!
//! Clients send commands as arrays of bulk strings; replies use whichever
//! kind fits. Bulk strings are binary safe and carried as [`Bytes`] so a
//! stored value can be re-encoded without copying the payload.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

pub const CRLF: &[u8] = b"\r\n";

/// A single RESP value, parsed from or destined for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non-binary-safe string without CRLF, e.g. `+OK\r\n`.
    Simple(String),
    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),
    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),
    /// Binary-safe string with an explicit length prefix.
    Bulk(Bytes),
    /// Nil bulk string (`$-1\r\n`).
    Null,
    /// Sequence of values, possibly nested.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple(s: impl Into<String>) -> Self {
        RespValue::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(data.into())
    }

    /// The canonical `+OK\r\n` reply.
    pub fn ok() -> Self {
        RespValue::Simple("OK".to_string())
    }

    /// Appends the wire encoding of this value to `buf`.
    ///
    /// Replies are encoded straight into the connection's output buffer, so
    /// this takes a `BytesMut` rather than allocating per value.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Bulk(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            RespValue::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }

    /// Encodes this value into a fresh buffer. Handy in tests.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// The payload bytes if this is a bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            RespValue::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::Simple(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
        }
    }
}
