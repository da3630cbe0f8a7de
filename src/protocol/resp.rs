//! RESP (Redis Serialization Protocol) codec
//!
//! Based on the RESP3 specification: https://redis.io/docs/reference/protocol-spec/
//! Decoding never consumes a partial frame, so a reader can keep appending
//! socket data to the same buffer until a whole value is available.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};
use thiserror::Error;

/// Codec failures
#[derive(Error, Debug)]
pub enum RespError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed frame from the server
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Non-UTF-8 bytes where text was expected
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}

pub type RespResult<T> = Result<T, RespError>;

/// One RESP frame
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n (or $-1\r\n for null)
    BulkString(Option<Vec<u8>>),
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
    /// Null: _\r\n (RESP3)
    Null,
}

impl RespValue {
    /// Build a command array of bulk strings
    pub fn command<S: AsRef<str>>(args: &[S]) -> Self {
        RespValue::Array(
            args.iter()
                .map(|a| RespValue::BulkString(Some(a.as_ref().as_bytes().to_vec())))
                .collect(),
        )
    }

    /// Append the wire form of this value to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            RespValue::SimpleString(s) => {
                write!(buf, "+{}\r\n", s)?;
            }
            RespValue::Error(e) => {
                write!(buf, "-{}\r\n", e)?;
            }
            RespValue::Integer(i) => {
                write!(buf, ":{}\r\n", i)?;
            }
            RespValue::BulkString(None) => {
                write!(buf, "$-1\r\n")?;
            }
            RespValue::BulkString(Some(data)) => {
                write!(buf, "${}\r\n", data.len())?;
                buf.extend_from_slice(data);
                write!(buf, "\r\n")?;
            }
            RespValue::Array(items) => {
                write!(buf, "*{}\r\n", items.len())?;
                for item in items {
                    item.encode(buf)?;
                }
            }
            RespValue::Null => {
                write!(buf, "_\r\n")?;
            }
        }
        Ok(())
    }

    /// Decode one value from the front of `buf`, consuming it.
    /// Returns `Ok(None)` and leaves `buf` untouched when the frame is incomplete.
    pub fn decode(buf: &mut BytesMut) -> RespResult<Option<RespValue>> {
        match Self::parse(&buf[..])? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse one value from `buf` without consuming; returns the value and its length
    pub fn parse(buf: &[u8]) -> RespResult<Option<(RespValue, usize)>> {
        Self::parse_nested(buf, 0)
    }

    fn parse_nested(buf: &[u8], depth: usize) -> RespResult<Option<(RespValue, usize)>> {
        let Some(header) = Header::read(buf)? else {
            return Ok(None);
        };
        let after_line = header.after_line;

        match header.kind {
            HeaderKind::Simple(b'+') => Ok(Some((RespValue::SimpleString(utf8(header.body)?), after_line))),
            HeaderKind::Simple(b'-') => Ok(Some((RespValue::Error(utf8(header.body)?), after_line))),
            HeaderKind::Simple(b':') => {
                let i = utf8(header.body)?
                    .parse::<i64>()
                    .map_err(|e| RespError::Protocol(format!("Invalid integer: {}", e)))?;
                Ok(Some((RespValue::Integer(i), after_line)))
            }
            HeaderKind::Simple(_) => Ok(Some((RespValue::Null, after_line))),
            HeaderKind::Bulk(None) => Ok(Some((RespValue::BulkString(None), after_line))),
            HeaderKind::Bulk(Some(len)) => {
                let Some(end) = bulk_end(buf, after_line, len)? else {
                    return Ok(None);
                };
                Ok(Some((RespValue::BulkString(Some(buf[after_line..end].to_vec())), end + 2)))
            }
            HeaderKind::Array(None) => Ok(Some((RespValue::Null, after_line))),
            HeaderKind::Array(Some(len)) => {
                if len > 0 && depth >= MAX_DEPTH {
                    return Err(RespError::Protocol(format!("Nesting deeper than {}", MAX_DEPTH)));
                }
                let mut offset = after_line;
                let mut elements = Vec::new();
                for _ in 0..len {
                    match Self::parse_nested(&buf[offset..], depth + 1)? {
                        Some((value, used)) => {
                            elements.push(value);
                            offset += used;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(elements), offset)))
            }
        }
    }

    /// Elements of an array reply
    pub fn as_array(&self) -> RespResult<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Ok(arr),
            _ => Err(RespError::Protocol("Expected array".to_string())),
        }
    }

    /// Textual content of a simple or bulk string
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s.clone()),
            RespValue::BulkString(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Map a reply value to JSON. Bulk strings holding JSON documents are parsed.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RespValue::SimpleString(s) => serde_json::Value::String(s.clone()),
            RespValue::Error(e) => serde_json::json!({ "error": e }),
            RespValue::Integer(i) => serde_json::Value::from(*i),
            RespValue::BulkString(None) | RespValue::Null => serde_json::Value::Null,
            RespValue::BulkString(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                let trimmed = text.trim_start();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    if let Ok(v) = serde_json::from_str(&text) {
                        return v;
                    }
                }
                serde_json::Value::String(text.into_owned())
            }
            RespValue::Array(items) => serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }
}

fn utf8(bytes: &[u8]) -> RespResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| RespError::InvalidEncoding(e.to_string()))
}

/// Largest bulk string or array length accepted from the wire
const MAX_LEN: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the wire
const MAX_DEPTH: usize = 64;

enum HeaderKind {
    /// `+`, `-`, `:` or `_`: the whole value sits on the header line
    Simple(u8),
    /// `$` with its payload length; `None` is the null bulk string
    Bulk(Option<usize>),
    /// `*` with its element count; `None` is the null array
    Array(Option<usize>),
}

/// First line of a frame, validated
struct Header<'a> {
    kind: HeaderKind,
    body: &'a [u8],
    after_line: usize,
}

impl<'a> Header<'a> {
    /// `Ok(None)` until the CRLF of the first line has arrived
    fn read(buf: &'a [u8]) -> RespResult<Option<Self>> {
        let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let Some((&tag, body)) = buf[..pos].split_first() else {
            return Err(RespError::Protocol("Empty frame header".to_string()));
        };

        let kind = match tag {
            b'+' | b'-' | b':' => HeaderKind::Simple(tag),
            b'_' if body.is_empty() => HeaderKind::Simple(tag),
            b'_' => return Err(RespError::Protocol("Invalid null value".to_string())),
            b'$' => HeaderKind::Bulk(length(body, "bulk string")?),
            b'*' => HeaderKind::Array(length(body, "array")?),
            other => return Err(RespError::Protocol(format!("Unknown RESP type: {}", other as char))),
        };

        Ok(Some(Header {
            kind,
            body,
            after_line: pos + 2,
        }))
    }
}

/// Length field of `$` and `*` headers. `-1` is null.
fn length(body: &[u8], what: &str) -> RespResult<Option<usize>> {
    let len = utf8(body)?
        .parse::<i64>()
        .map_err(|e| RespError::Protocol(format!("Invalid {} length: {}", what, e)))?;
    if len == -1 {
        return Ok(None);
    }
    usize::try_from(len)
        .ok()
        .filter(|n| *n <= MAX_LEN)
        .map(Some)
        .ok_or_else(|| RespError::Protocol(format!("Invalid {} length: {}", what, len)))
}

/// End of a bulk payload that starts at `start`, or `None` while it is incomplete
fn bulk_end(buf: &[u8], start: usize, len: usize) -> RespResult<Option<usize>> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| RespError::Protocol("Bulk string length overflow".to_string()))?;
    if buf.len() < end.saturating_add(2) {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(RespError::Protocol("Missing \\r\\n after bulk string".to_string()));
    }
    Ok(Some(end))
}

/// Resumable search for the end of the next frame in a growing buffer.
///
/// Each call picks up where the previous one stopped, so a large reply that
/// arrives in many reads is walked once instead of once per read. The buffer
/// may only grow between calls; the scanner resets itself after reporting a
/// complete frame.
#[derive(Debug, Default)]
pub struct FrameScanner {
    offset: usize,
    /// Elements still missing at each open array level
    open: Vec<usize>,
}

impl FrameScanner {
    /// Length of the first frame in `buf`, once all of it has arrived
    pub fn scan(&mut self, buf: &[u8]) -> RespResult<Option<usize>> {
        loop {
            let rest = buf.get(self.offset..).unwrap_or(&[]);
            let Some(header) = Header::read(rest)? else {
                return Ok(None);
            };

            let used = match header.kind {
                HeaderKind::Bulk(Some(len)) => match bulk_end(rest, header.after_line, len)? {
                    Some(end) => end + 2,
                    None => return Ok(None),
                },
                HeaderKind::Array(Some(len)) if len > 0 => {
                    if self.open.len() >= MAX_DEPTH {
                        return Err(RespError::Protocol(format!("Nesting deeper than {}", MAX_DEPTH)));
                    }
                    self.offset += header.after_line;
                    self.open.push(len);
                    continue;
                }
                _ => header.after_line,
            };
            self.offset += used;

            while let Some(left) = self.open.last_mut() {
                *left -= 1;
                if *left > 0 {
                    break;
                }
                self.open.pop();
            }
            if self.open.is_empty() {
                return Ok(Some(std::mem::take(&mut self.offset)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let val = RespValue::command(&["GRAPH.QUERY", "g", "RETURN 1"]);
        let mut buf = Vec::new();
        val.encode(&mut buf).unwrap();
        assert_eq!(buf, b"*3\r\n$11\r\nGRAPH.QUERY\r\n$1\r\ng\r\n$8\r\nRETURN 1\r\n");
    }

    #[test]
    fn test_encode_error() {
        let val = RespValue::Error("THROTTLED 250".to_string());
        let mut buf = Vec::new();
        val.encode(&mut buf).unwrap();
        assert_eq!(buf, b"-THROTTLED 250\r\n");
    }

    #[test]
    fn test_decode_simple_string() {
        let mut buf = BytesMut::from(&b"+OK\r\n"[..]);
        let val = RespValue::decode(&mut buf).unwrap().unwrap();
        assert_eq!(val, RespValue::SimpleString("OK".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_nested_array() {
        let mut buf = BytesMut::from(&b"*2\r\n*1\r\n$4\r\nname\r\n*1\r\n$5\r\nAlice\r\n"[..]);
        let val = RespValue::decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            val,
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::BulkString(Some(b"name".to_vec()))]),
                RespValue::Array(vec![RespValue::BulkString(Some(b"Alice".to_vec()))]),
            ])
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_frame_is_not_consumed() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n$3\r\nba"[..]);
        assert!(RespValue::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 19);

        buf.extend_from_slice(b"r\r\n+OK\r\n");
        let val = RespValue::decode(&mut buf).unwrap().unwrap();
        assert_eq!(val.as_array().unwrap().len(), 2);
        assert_eq!(
            RespValue::decode(&mut buf).unwrap().unwrap(),
            RespValue::SimpleString("OK".to_string())
        );
    }

    #[test]
    fn test_unknown_type() {
        let mut buf = BytesMut::from(&b"!oops\r\n"[..]);
        assert!(matches!(RespValue::decode(&mut buf), Err(RespError::Protocol(_))));
    }

    #[test]
    fn test_malformed_headers_are_protocol_errors() {
        let frames: [&[u8]; 6] = [
            b"\r\n",
            b"*4611686018427387904\r\n",
            b"$9223372036854775807\r\n",
            b"$-5\r\n",
            b"*abc\r\n",
            b"_x\r\n",
        ];
        for frame in frames {
            let mut buf = BytesMut::from(frame);
            assert!(
                matches!(RespValue::decode(&mut buf), Err(RespError::Protocol(_))),
                "{:?} should be rejected",
                String::from_utf8_lossy(frame)
            );
            assert!(FrameScanner::default().scan(frame).is_err());
        }
    }

    #[test]
    fn test_null_lengths() {
        let mut buf = BytesMut::from(&b"$-1\r\n*-1\r\n*0\r\n"[..]);
        assert_eq!(RespValue::decode(&mut buf).unwrap(), Some(RespValue::BulkString(None)));
        assert_eq!(RespValue::decode(&mut buf).unwrap(), Some(RespValue::Null));
        assert_eq!(RespValue::decode(&mut buf).unwrap(), Some(RespValue::Array(vec![])));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let frame = b"*1\r\n".repeat(MAX_DEPTH + 1);
        assert!(matches!(RespValue::parse(&frame), Err(RespError::Protocol(_))));
        assert!(FrameScanner::default().scan(&frame).is_err());
    }

    #[test]
    fn test_scanner_resumes_across_reads() {
        let mut reply = Vec::new();
        RespValue::Array(vec![
            RespValue::command(&["name", "age"]),
            RespValue::Array(vec![RespValue::BulkString(Some(b"Alice".to_vec())), RespValue::Integer(30)]),
            RespValue::Array(vec![RespValue::Null, RespValue::SimpleString("OK".to_string())]),
        ])
        .encode(&mut reply)
        .unwrap();
        let frame_len = reply.len();
        reply.extend_from_slice(b"+NEXT\r\n");

        let mut scanner = FrameScanner::default();
        let mut found = None;
        for end in 1..=reply.len() {
            if let Some(len) = scanner.scan(&reply[..end]).unwrap() {
                found = Some((end, len));
                break;
            }
        }
        assert_eq!(found, Some((frame_len, frame_len)));
        assert_eq!(RespValue::parse(&reply).unwrap().unwrap().1, frame_len);

        // reset after a frame: the next one starts from offset 0 again
        assert_eq!(scanner.scan(&reply[frame_len..]).unwrap(), Some(7));
    }

    #[test]
    fn test_to_json() {
        assert_eq!(RespValue::Integer(7).to_json(), serde_json::json!(7));
        assert_eq!(
            RespValue::BulkString(Some(br#"{"id": 1}"#.to_vec())).to_json(),
            serde_json::json!({"id": 1})
        );
        assert_eq!(
            RespValue::BulkString(Some(b"Alice".to_vec())).to_json(),
            serde_json::json!("Alice")
        );
        assert_eq!(RespValue::Null.to_json(), serde_json::Value::Null);
    }
}
