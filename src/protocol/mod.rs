// Protocol module - RESP parser and serializer for the client side

use std::io::Cursor;
use thiserror::Error;

pub mod parser;
pub mod serializer;

pub use parser::RespParser;
pub use serializer::{write_command, RespSerializer};

/// RESP (REdis Serialization Protocol) reply values.
///
/// The client only speaks RESP2; that is what cluster nodes answer with
/// unless a HELLO upgrade is negotiated, which this library does not do.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error reply: -MOVED 3999 127.0.0.1:6381\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n (None for the null bulk string)
    BulkString(Option<Vec<u8>>),
    /// Array: *2\r\n... (None for the null array)
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// View as a simple string if possible
    pub fn as_simple_string(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            _ => None,
        }
    }

    /// View as bulk string bytes if possible
    pub fn as_bulk_string(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(Some(s)) => Some(s),
            _ => None,
        }
    }

    /// Bulk or simple string contents as UTF-8 text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(Some(s)) => std::str::from_utf8(s).ok(),
            _ => None,
        }
    }

    /// View as an integer if possible
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// View as an array if possible
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(arr)) => Some(arr),
            _ => None,
        }
    }

    /// True for the null bulk string and the null array
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RespError {
    #[error("incomplete data")]
    Incomplete,

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid bulk string length")]
    InvalidBulkStringLength,

    #[error("invalid array length")]
    InvalidArrayLength,

    #[error("invalid UTF-8 in reply")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, RespError>;

/// Find the first CRLF in a buffer
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Read one CRLF-terminated line from the cursor
pub(crate) fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8]> {
    let start = cursor.position() as usize;
    let slice = &cursor.get_ref()[start..];

    let end = find_crlf(slice).ok_or(RespError::Incomplete)?;

    cursor.set_position((start + end + 2) as u64);
    Ok(&slice[..end])
}

/// Parse a signed decimal integer from line bytes
pub(crate) fn parse_integer(buf: &[u8]) -> Result<i64> {
    let s = std::str::from_utf8(buf).map_err(|_| RespError::InvalidUtf8)?;
    s.parse::<i64>()
        .map_err(|_| RespError::InvalidInteger(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"hello\r\n"), Some(5));
        assert_eq!(find_crlf(b"hello"), None);
        assert_eq!(find_crlf(b"\r\n"), Some(0));
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer(b"123").unwrap(), 123);
        assert_eq!(parse_integer(b"-1").unwrap(), -1);
        assert!(parse_integer(b"abc").is_err());
    }

    #[test]
    fn test_resp_value_accessors() {
        let val = RespValue::SimpleString("OK".to_string());
        assert_eq!(val.as_simple_string(), Some("OK"));
        assert_eq!(val.as_text(), Some("OK"));
        assert_eq!(val.as_integer(), None);

        let val = RespValue::BulkString(Some(b"hi".to_vec()));
        assert_eq!(val.as_text(), Some("hi"));

        assert!(RespValue::BulkString(None).is_null());
        assert!(RespValue::Array(None).is_null());
        assert!(!RespValue::Integer(0).is_null());
    }
}
