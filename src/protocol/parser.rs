// RESP reply parser

use super::{parse_integer, read_line, RespError, RespValue, Result};
use bytes::BytesMut;
use std::io::Cursor;

pub struct RespParser;

impl RespParser {
    /// Parse one complete RESP value from a byte buffer
    pub fn parse(buf: &[u8]) -> Result<RespValue> {
        let mut cursor = Cursor::new(buf);
        Self::parse_value(&mut cursor)
    }

    /// Check whether the buffer holds a complete RESP value, returning
    /// its encoded length so the caller can split it off
    pub fn check_complete(buf: &BytesMut) -> Result<Option<usize>> {
        let mut cursor = Cursor::new(&buf[..]);
        match Self::parse_value(&mut cursor) {
            Ok(_) => Ok(Some(cursor.position() as usize)),
            Err(RespError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn parse_value(cursor: &mut Cursor<&[u8]>) -> Result<RespValue> {
        if cursor.position() >= cursor.get_ref().len() as u64 {
            return Err(RespError::Incomplete);
        }

        let type_byte = cursor.get_ref()[cursor.position() as usize];
        cursor.set_position(cursor.position() + 1);

        match type_byte {
            b'+' => {
                let line = read_line(cursor)?;
                let s = std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)?;
                Ok(RespValue::SimpleString(s.to_string()))
            }
            b'-' => {
                let line = read_line(cursor)?;
                let s = std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)?;
                Ok(RespValue::Error(s.to_string()))
            }
            b':' => {
                let line = read_line(cursor)?;
                Ok(RespValue::Integer(parse_integer(line)?))
            }
            b'$' => Self::parse_bulk_string(cursor),
            b'*' => Self::parse_array(cursor),
            _ => Err(RespError::InvalidProtocol(format!(
                "unknown type byte: {}",
                type_byte as char
            ))),
        }
    }

    fn parse_bulk_string(cursor: &mut Cursor<&[u8]>) -> Result<RespValue> {
        let line = read_line(cursor)?;
        let len = parse_integer(line)?;

        if len == -1 {
            return Ok(RespValue::BulkString(None));
        }
        if len < -1 {
            return Err(RespError::InvalidBulkStringLength);
        }

        let len = len as usize;
        let start = cursor.position() as usize;
        let end = start + len;

        // Data plus trailing CRLF must be fully buffered
        if end + 2 > cursor.get_ref().len() {
            return Err(RespError::Incomplete);
        }
        if cursor.get_ref()[end..end + 2] != *b"\r\n" {
            return Err(RespError::InvalidProtocol(
                "missing CRLF after bulk string".to_string(),
            ));
        }

        let data = cursor.get_ref()[start..end].to_vec();
        cursor.set_position((end + 2) as u64);
        Ok(RespValue::BulkString(Some(data)))
    }

    fn parse_array(cursor: &mut Cursor<&[u8]>) -> Result<RespValue> {
        let line = read_line(cursor)?;
        let len = parse_integer(line)?;

        if len == -1 {
            return Ok(RespValue::Array(None));
        }
        if len < -1 {
            return Err(RespError::InvalidArrayLength);
        }

        let len = len as usize;
        let mut arr = Vec::with_capacity(len);
        for _ in 0..len {
            arr.push(Self::parse_value(cursor)?);
        }
        Ok(RespValue::Array(Some(arr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_string() {
        let result = RespParser::parse(b"+OK\r\n").unwrap();
        assert_eq!(result, RespValue::SimpleString("OK".to_string()));
    }

    #[test]
    fn test_parse_error_reply() {
        let result = RespParser::parse(b"-MOVED 5798 10.0.0.2:6379\r\n").unwrap();
        assert_eq!(
            result,
            RespValue::Error("MOVED 5798 10.0.0.2:6379".to_string())
        );
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(RespParser::parse(b":1000\r\n").unwrap(), RespValue::Integer(1000));
        assert_eq!(RespParser::parse(b":-3\r\n").unwrap(), RespValue::Integer(-3));
    }

    #[test]
    fn test_parse_bulk_string() {
        let result = RespParser::parse(b"$6\r\nfoobar\r\n").unwrap();
        assert_eq!(result, RespValue::BulkString(Some(b"foobar".to_vec())));

        assert_eq!(
            RespParser::parse(b"$-1\r\n").unwrap(),
            RespValue::BulkString(None)
        );
        assert_eq!(
            RespParser::parse(b"$0\r\n\r\n").unwrap(),
            RespValue::BulkString(Some(vec![]))
        );
    }

    #[test]
    fn test_parse_array() {
        let result = RespParser::parse(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n").unwrap();
        assert_eq!(
            result,
            RespValue::Array(Some(vec![
                RespValue::BulkString(Some(b"foo".to_vec())),
                RespValue::BulkString(Some(b"bar".to_vec())),
            ]))
        );

        assert_eq!(RespParser::parse(b"*-1\r\n").unwrap(), RespValue::Array(None));
        assert_eq!(
            RespParser::parse(b"*0\r\n").unwrap(),
            RespValue::Array(Some(vec![]))
        );
    }

    #[test]
    fn test_parse_nested_array() {
        // Shape of a CLUSTER SLOTS entry
        let data = b"*3\r\n:0\r\n:16383\r\n*2\r\n$9\r\n127.0.0.1\r\n:7000\r\n";
        let result = RespParser::parse(data).unwrap();
        assert_eq!(
            result,
            RespValue::Array(Some(vec![
                RespValue::Integer(0),
                RespValue::Integer(16383),
                RespValue::Array(Some(vec![
                    RespValue::BulkString(Some(b"127.0.0.1".to_vec())),
                    RespValue::Integer(7000),
                ])),
            ]))
        );
    }

    #[test]
    fn test_parse_binary_safe() {
        let data = b"$5\r\n\x00\x01\xff\xfe\x02\r\n";
        let result = RespParser::parse(data).unwrap();
        assert_eq!(
            result,
            RespValue::BulkString(Some(vec![0x00, 0x01, 0xff, 0xfe, 0x02]))
        );
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(matches!(
            RespParser::parse(b"+OK"),
            Err(RespError::Incomplete)
        ));
        assert!(matches!(
            RespParser::parse(b"$6\r\nfoo"),
            Err(RespError::Incomplete)
        ));
        assert!(matches!(
            RespParser::parse(b"*2\r\n:1\r\n"),
            Err(RespError::Incomplete)
        ));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            RespParser::parse(b"?boom\r\n"),
            Err(RespError::InvalidProtocol(_))
        ));
    }

    #[test]
    fn test_check_complete() {
        let buf = BytesMut::from(&b"+OK\r\n:42\r\n"[..]);
        assert_eq!(RespParser::check_complete(&buf).unwrap(), Some(5));

        let buf = BytesMut::from(&b"$10\r\npartial"[..]);
        assert_eq!(RespParser::check_complete(&buf).unwrap(), None);
    }
}
