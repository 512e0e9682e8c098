//! RESP (the well-known cache protocol's wire format) encoder/decoder.
//!
//! Frames are 8-bit clean: bulk strings carry raw bytes, never text, so the
//! codec is built on `bytes::Bytes` rather than `str`/`Cow<str>`.

use bytes::Bytes;
use std::str::Utf8Error;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(Bytes),
    Error(Bytes),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported frame type byte: {0:#x}")]
    UnsupportedType(u8),

    #[error("frame is not terminated with CRLF")]
    MissingCrlf,

    #[error("length prefix is not valid UTF-8")]
    NotUtf8(#[from] Utf8Error),

    #[error("length prefix is not a valid integer")]
    BadInteger,

    #[error("negative bulk length other than -1")]
    BadBulkLength,

    #[error("negative array length")]
    BadArrayLength,

    #[error("array elements must be bulk strings or arrays")]
    UnsupportedArrayElement,
}

/// Outcome of a decode attempt over a byte buffer that may hold a partial frame.
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame, plus the number of bytes it consumed from the input.
    Frame(Frame, usize),
    /// The buffer holds the start of a frame but not all of it yet.
    NeedMore,
}

const CRLF: &[u8] = b"\r\n";

/// Decode exactly one frame from the front of `buf`, if a complete one is present.
pub fn decode_one(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    if buf.is_empty() {
        return Ok(Decoded::NeedMore);
    }

    match buf[0] {
        b'+' => Ok(match decode_line(buf)? {
            Some((line, consumed)) => Decoded::Frame(Frame::Simple(Bytes::copy_from_slice(line)), consumed),
            None => Decoded::NeedMore,
        }),
        b'-' => Ok(match decode_line(buf)? {
            Some((line, consumed)) => Decoded::Frame(Frame::Error(Bytes::copy_from_slice(line)), consumed),
            None => Decoded::NeedMore,
        }),
        b':' => match decode_line(buf)? {
            Some((line, consumed)) => {
                let n = parse_i64(line)?;
                Ok(Decoded::Frame(Frame::Integer(n), consumed))
            }
            None => Ok(Decoded::NeedMore),
        },
        b'$' => decode_bulk(buf),
        b'*' => decode_array(buf),
        other => Err(ProtocolError::UnsupportedType(other)),
    }
}

/// Find the line up to (not including) the first `\r\n`, returning the line
/// slice and total bytes consumed including the CRLF.
fn decode_line(buf: &[u8]) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    if let Some(pos) = find_crlf(&buf[1..]) {
        Ok(Some((&buf[1..1 + pos], 1 + pos + 2)))
    } else {
        Ok(None)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn parse_i64(bytes: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(bytes)?
        .parse::<i64>()
        .map_err(|_| ProtocolError::BadInteger)
}

fn decode_bulk(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    let (len_line, header_len) = match decode_line(buf)? {
        Some(v) => v,
        None => return Ok(Decoded::NeedMore),
    };
    let len = parse_i64(len_line)?;
    if len == -1 {
        return Ok(Decoded::Frame(Frame::NullBulk, header_len));
    }
    if len < -1 {
        return Err(ProtocolError::BadBulkLength);
    }
    let len = len as usize;
    let total = header_len + len + 2;
    if buf.len() < total {
        return Ok(Decoded::NeedMore);
    }
    if &buf[header_len + len..total] != CRLF {
        return Err(ProtocolError::MissingCrlf);
    }
    let data = Bytes::copy_from_slice(&buf[header_len..header_len + len]);
    Ok(Decoded::Frame(Frame::Bulk(data), total))
}

fn decode_array(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    let (len_line, header_len) = match decode_line(buf)? {
        Some(v) => v,
        None => return Ok(Decoded::NeedMore),
    };
    let len = parse_i64(len_line)?;
    if len == -1 {
        return Ok(Decoded::Frame(Frame::NullArray, header_len));
    }
    if len < -1 {
        return Err(ProtocolError::BadArrayLength);
    }
    let mut consumed = header_len;
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match decode_one(&buf[consumed..])? {
            Decoded::Frame(frame, n) => {
                match &frame {
                    Frame::Bulk(_) | Frame::NullBulk | Frame::Array(_) => {}
                    _ => return Err(ProtocolError::UnsupportedArrayElement),
                }
                items.push(frame);
                consumed += n;
            }
            Decoded::NeedMore => return Ok(Decoded::NeedMore),
        }
    }
    Ok(Decoded::Frame(Frame::Array(items), consumed))
}

impl Frame {
    pub fn simple(s: impl Into<Vec<u8>>) -> Self {
        Frame::Simple(Bytes::from(s.into()))
    }

    pub fn error(s: impl Into<Vec<u8>>) -> Self {
        Frame::Error(Bytes::from(s.into()))
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    pub fn array_of_bulks<I, B>(items: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Frame::Array(items.into_iter().map(Frame::bulk).collect())
    }

    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Frame::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            Frame::Bulk(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s);
                buf.extend_from_slice(CRLF);
            }
            Frame::Error(e) => {
                buf.push(b'-');
                buf.extend_from_slice(e);
                buf.extend_from_slice(CRLF);
            }
            Frame::Integer(i) => {
                buf.push(b':');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Frame::Bulk(b) => {
                buf.push(b'$');
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(b);
                buf.extend_from_slice(CRLF);
            }
            Frame::NullBulk => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            Frame::NullArray => {
                buf.extend_from_slice(b"*-1\r\n");
            }
            Frame::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }
}

/// Frame the RDB blob used in the `PSYNC` reply: `$<len>\r\n<bytes>`, deliberately
/// missing the trailing CRLF that a normal bulk string would carry.
pub fn encode_rdb_blob(bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bytes.len() + 16);
    buf.push(b'$');
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_string() {
        let buf = b"+PONG\r\n";
        match decode_one(buf).unwrap() {
            Decoded::Frame(Frame::Simple(s), n) => {
                assert_eq!(&s[..], b"PONG");
                assert_eq!(n, buf.len());
            }
            _ => panic!("expected frame"),
        }
    }

    #[test]
    fn needs_more_on_short_bulk() {
        let buf = b"$5\r\nhel";
        assert!(matches!(decode_one(buf).unwrap(), Decoded::NeedMore));
    }

    #[test]
    fn needs_more_on_truncated_header() {
        let buf = b"$5\r\n";
        assert!(matches!(decode_one(buf).unwrap(), Decoded::NeedMore));
    }

    #[test]
    fn decodes_null_bulk() {
        let buf = b"$-1\r\n";
        match decode_one(buf).unwrap() {
            Decoded::Frame(Frame::NullBulk, n) => assert_eq!(n, buf.len()),
            _ => panic!("expected null bulk"),
        }
    }

    #[test]
    fn decodes_nested_array() {
        let buf = b"*2\r\n$4\r\nPING\r\n*1\r\n$4\r\nECHO\r\n";
        match decode_one(buf).unwrap() {
            Decoded::Frame(Frame::Array(items), n) => {
                assert_eq!(items.len(), 2);
                assert_eq!(n, buf.len());
                assert!(matches!(&items[1], Frame::Array(inner) if inner.len() == 1));
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn is_8bit_clean() {
        let raw = vec![0u8, 1, 2, 255, b'\r', b'\n'];
        let encoded = Frame::bulk(raw.clone()).encode();
        match decode_one(&encoded).unwrap() {
            Decoded::Frame(Frame::Bulk(b), n) => {
                assert_eq!(&b[..], &raw[..]);
                assert_eq!(n, encoded.len());
            }
            _ => panic!("expected bulk"),
        }
    }

    #[test]
    fn encode_decode_roundtrip_array_of_bulks() {
        let frame = Frame::array_of_bulks(["RPUSH", "l", "a", "b"]);
        let encoded = frame.encode();
        match decode_one(&encoded).unwrap() {
            Decoded::Frame(decoded, n) => {
                assert_eq!(decoded, frame);
                assert_eq!(n, encoded.len());
            }
            _ => panic!("expected frame"),
        }
    }

    #[test]
    fn rdb_blob_has_no_trailing_crlf() {
        let bytes = [1u8, 2, 3];
        let framed = encode_rdb_blob(&bytes);
        assert_eq!(framed, b"$3\r\n\x01\x02\x03");
    }

    #[test]
    fn rejects_unsupported_type_byte() {
        let buf = b"!oops\r\n";
        assert_eq!(
            decode_one(buf).unwrap_err(),
            ProtocolError::UnsupportedType(b'!')
        );
    }

    #[test]
    fn null_array_round_trips() {
        let encoded = Frame::NullArray.encode();
        assert_eq!(encoded, b"*-1\r\n");
        match decode_one(&encoded).unwrap() {
            Decoded::Frame(Frame::NullArray, n) => assert_eq!(n, encoded.len()),
            _ => panic!("expected null array"),
        }
    }
}
