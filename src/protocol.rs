//! RESP wire codec for RedVault
//!
//! Streaming nom parsers decode values out of a growing buffer; `RespReader`
//! refills that buffer from any async byte stream until a full value is
//! available. The same framing is used for client requests, replies and the
//! records of the append-only log.

use crate::error::{RedVaultError, Result};
use bytes::{Buf, BytesMut};
use nom::{
    bytes::streaming::{tag, take, take_until},
    combinator::{map, map_opt, map_res},
    error::{Error, ErrorKind},
    multi::count,
    sequence::terminated,
    IResult,
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest bulk string payload accepted by the decoder.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest number of elements accepted in a single array.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Header lines (`+`, `-`, `:` and length prefixes) longer than this are rejected.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Every protocol-level datum: requests, replies and log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(String),
    NullBulkString,
    Array(Vec<Value>),
}

impl Value {
    pub fn simple(s: impl Into<String>) -> Self {
        Value::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Value::Error(s.into())
    }

    pub fn bulk(s: impl Into<String>) -> Self {
        Value::BulkString(s.into())
    }

    /// Build a request array of bulk strings, e.g. `["SET", "k", "v"]`.
    pub fn command(parts: &[&str]) -> Self {
        Value::Array(parts.iter().map(|p| Value::bulk(*p)).collect())
    }

    pub fn as_bulk(&self) -> Option<&str> {
        match self {
            Value::BulkString(s) => Some(s),
            _ => None,
        }
    }

    /// Serialize to the exact wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::SimpleString(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Value::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Value::Integer(n) => {
                out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
            }
            Value::BulkString(s) => {
                out.extend_from_slice(format!("${}\r\n", s.len()).as_bytes());
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Value::NullBulkString => out.extend_from_slice(b"$-1\r\n"),
            Value::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }
}

/// Parse exactly one value from the front of `input`.
///
/// Returns `Err(nom::Err::Incomplete)` when `input` holds only part of a
/// value, so callers can read more bytes and retry.
pub fn parse_value(input: &[u8]) -> IResult<&[u8], Value> {
    let (rest, type_byte) = prefix(input)?;
    match type_byte {
        b'+' => map(text, Value::SimpleString)(rest),
        b'-' => map(text, Value::Error)(rest),
        b':' => map(integer, Value::Integer)(rest),
        b'$' => bulk_string(rest),
        b'*' => array(rest),
        _ => Err(nom::Err::Failure(Error::new(input, ErrorKind::Tag))),
    }
}

fn prefix(input: &[u8]) -> IResult<&[u8], u8> {
    map(take(1usize), |b: &[u8]| b[0])(input)
}

fn line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    match terminated(take_until("\r\n"), tag("\r\n"))(input) {
        Err(nom::Err::Incomplete(_)) if input.len() > MAX_LINE_LEN => {
            Err(nom::Err::Failure(Error::new(input, ErrorKind::TooLarge)))
        }
        other => other,
    }
}

fn text(input: &[u8]) -> IResult<&[u8], String> {
    map_res(line, |bytes: &[u8]| std::str::from_utf8(bytes).map(str::to_owned))(input)
}

fn integer(input: &[u8]) -> IResult<&[u8], i64> {
    map_opt(line, |bytes: &[u8]| std::str::from_utf8(bytes).ok()?.parse::<i64>().ok())(input)
}

fn checked_len(input: &[u8], declared: i64, max: usize) -> std::result::Result<usize, nom::Err<Error<&[u8]>>> {
    usize::try_from(declared)
        .ok()
        .filter(|len| *len <= max)
        .ok_or_else(|| nom::Err::Failure(Error::new(input, ErrorKind::LengthValue)))
}

fn payload(input: &[u8], len: usize) -> IResult<&[u8], String> {
    map_res(take(len), |bytes: &[u8]| std::str::from_utf8(bytes).map(str::to_owned))(input)
}

// Trailing CRLF of a bulk string is consumed by length only.
fn terminator(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take(2usize)(input)
}

fn bulk_string(input: &[u8]) -> IResult<&[u8], Value> {
    let (input, declared) = integer(input)?;
    if declared == -1 {
        return Ok((input, Value::NullBulkString));
    }
    let len = checked_len(input, declared, MAX_BULK_LEN)?;
    let (input, data) = payload(input, len)?;
    let (input, _) = terminator(input)?;
    Ok((input, Value::BulkString(data)))
}

fn elements(input: &[u8], len: usize) -> IResult<&[u8], Vec<Value>> {
    count(parse_value, len)(input)
}

fn array(input: &[u8]) -> IResult<&[u8], Value> {
    let (input, declared) = integer(input)?;
    let len = checked_len(input, declared, MAX_ARRAY_LEN)?;
    let (input, items) = elements(input, len)?;
    Ok((input, Value::Array(items)))
}

/// Skip one value header, plus the payload for bulk strings, without
/// building anything. Returns how many child values follow it.
fn skip_header(input: &[u8]) -> IResult<&[u8], usize> {
    let (rest, type_byte) = prefix(input)?;
    match type_byte {
        b'+' | b'-' => map(line, |_| 0usize)(rest),
        b':' => map(integer, |_| 0usize)(rest),
        b'$' => {
            let (rest, declared) = integer(rest)?;
            if declared == -1 {
                return Ok((rest, 0));
            }
            let len = checked_len(rest, declared, MAX_BULK_LEN)?;
            map(take(len + CRLF.len()), |_| 0usize)(rest)
        }
        b'*' => {
            let (rest, declared) = integer(rest)?;
            let len = checked_len(rest, declared, MAX_ARRAY_LEN)?;
            Ok((rest, len))
        }
        _ => Err(nom::Err::Failure(Error::new(input, ErrorKind::Tag))),
    }
}

/// Resumable framing check for the value at the front of the buffer.
///
/// Progress survives across refills, so bytes already checked are not
/// scanned again while a large value trickles in.
#[derive(Debug, Default)]
struct FrameScan {
    /// Length of the checked prefix of the current value
    checked: usize,
    /// Children still expected by each open array, innermost last
    pending: Vec<usize>,
}

impl FrameScan {
    /// Returns the length of the first value in `buf` once all of it is
    /// buffered, and resets for the next one.
    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        loop {
            let children = match skip_header(&buf[self.checked..]) {
                Ok((rest, children)) => {
                    self.checked = buf.len() - rest.len();
                    children
                }
                Err(nom::Err::Incomplete(_)) => return Ok(None),
                Err(e) => return Err(RedVaultError::from(e)),
            };

            if children > 0 {
                self.pending.push(children);
                continue;
            }

            // A leaf or empty array is done; close every array it finishes.
            loop {
                match self.pending.last_mut() {
                    None => {
                        let len = self.checked;
                        self.checked = 0;
                        return Ok(Some(len));
                    }
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        self.pending.pop();
                    }
                }
            }
        }
    }
}

/// Incremental value reader over an async byte stream.
pub struct RespReader<R> {
    reader: R,
    buffer: BytesMut,
    scan: FrameScan,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            scan: FrameScan::default(),
        }
    }

    /// Read the next complete value.
    ///
    /// `Ok(None)` means the stream ended cleanly between values. A stream that
    /// ends in the middle of a value, or bytes that do not form a valid value,
    /// produce a `Protocol` error.
    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        loop {
            // Values are only built once the whole frame is buffered.
            if let Some(len) = self.scan.advance(&self.buffer)? {
                let value = match parse_value(&self.buffer[..len]) {
                    Ok((_, value)) => value,
                    Err(nom::Err::Incomplete(_)) => {
                        return Err(RedVaultError::Protocol("frame ended early".to_string()))
                    }
                    Err(e) => return Err(RedVaultError::from(e)),
                };
                self.buffer.advance(len);
                return Ok(Some(value));
            }

            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(RedVaultError::Protocol(
                    "stream ended in the middle of a value".to_string(),
                ));
            }
        }
    }
}
