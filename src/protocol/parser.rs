use super::types::RespValue;
use crate::error::{Result, XdisError};
use bytes::{Buf, Bytes, BytesMut};
use std::io::Cursor;

/// Upper bound for a single bulk payload.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound for an element count in one array header.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Upper bound for a header or inline line, excluding the CRLF.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Outcome of one parse attempt over the buffered bytes.
enum Step<T> {
    Done(T),
    Incomplete,
}

macro_rules! ready {
    ($e:expr) => {
        match $e? {
            Step::Done(v) => v,
            Step::Incomplete => return Ok(Step::Incomplete),
        }
    };
}

/// Incremental RESP2 parser.
///
/// Bytes are appended to the internal buffer (usually straight from the
/// socket through [`RespParser::buffer_mut`]); [`RespParser::parse`] yields
/// one complete frame at a time and leaves partial frames buffered.
pub struct RespParser {
    buffer: BytesMut,
}

impl RespParser {
    /// Create a new parser with a given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Get a mutable reference to the buffer
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Try to parse a complete RESP value from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed frame is a
    /// `Protocol` error; the connection is not recoverable after it.
    ///
    /// Only headers are walked until the frame is complete: bulk payloads
    /// are skipped by length and never copied. The complete frame is then
    /// split off and its bulk strings are slices of it.
    pub fn parse(&mut self) -> Result<Option<RespValue>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let inline = !matches!(self.buffer[0], b'+' | b'-' | b':' | b'$' | b'*');
        let len = {
            let mut cursor = Cursor::new(&self.buffer[..]);
            let step = if inline {
                read_line(&mut cursor)?.map(|_| ())
            } else {
                skip_value(&mut cursor)?
            };
            match step {
                Step::Done(()) => cursor.position() as usize,
                Step::Incomplete => return Ok(None),
            }
        };

        let frame = self.buffer.split_to(len).freeze();
        let mut cursor = Cursor::new(&frame[..]);
        let step = if inline {
            parse_inline(&mut cursor, &frame)?
        } else {
            parse_value(&mut cursor, &frame)?
        };
        match step {
            Step::Done(value) => Ok(Some(value)),
            Step::Incomplete => Err(XdisError::Protocol("truncated frame".to_string())),
        }
    }
}

impl<T> Step<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Done(v) => Step::Done(f(v)),
            Step::Incomplete => Step::Incomplete,
        }
    }
}

/// Split a request frame into its command name and arguments.
pub fn into_command(value: RespValue) -> Result<(Bytes, Vec<Bytes>)> {
    let items = match value {
        RespValue::Array(Some(items)) if !items.is_empty() => items,
        _ => return Err(XdisError::Protocol("expected a non-empty array".to_string())),
    };

    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::BulkString(Some(b)) => parts.push(b),
            RespValue::SimpleString(s) => parts.push(Bytes::from(s)),
            RespValue::Integer(i) => parts.push(Bytes::from(i.to_string())),
            _ => {
                return Err(XdisError::Protocol(
                    "expected bulk strings in request".to_string(),
                ))
            }
        }
    }
    let name = parts.remove(0);
    Ok((name, parts))
}

/// Walks one value without building it.
fn skip_value(cursor: &mut Cursor<&[u8]>) -> Result<Step<()>> {
    if !cursor.has_remaining() {
        return Ok(Step::Incomplete);
    }

    match cursor.get_u8() {
        b'+' | b'-' | b':' => {
            ready!(read_line(cursor));
        }
        b'$' => {
            if let Some(len) = ready!(bulk_len(cursor)) {
                ready!(bulk_payload(cursor, len));
            }
        }
        b'*' => {
            let len = ready!(array_len(cursor)).unwrap_or(0);
            for _ in 0..len {
                ready!(skip_value(cursor));
            }
        }
        other => return Err(invalid_marker(other)),
    }
    Ok(Step::Done(()))
}

fn parse_value(cursor: &mut Cursor<&[u8]>, src: &Bytes) -> Result<Step<RespValue>> {
    if !cursor.has_remaining() {
        return Ok(Step::Incomplete);
    }

    match cursor.get_u8() {
        b'+' => {
            let line = ready!(read_line(cursor));
            Ok(Step::Done(RespValue::SimpleString(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
        b'-' => {
            let line = ready!(read_line(cursor));
            Ok(Step::Done(RespValue::Error(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
        b':' => {
            let line = ready!(read_line(cursor));
            Ok(Step::Done(RespValue::Integer(parse_number(line, "integer")?)))
        }
        b'$' => {
            let Some(len) = ready!(bulk_len(cursor)) else {
                return Ok(Step::Done(RespValue::BulkString(None)));
            };
            let start = ready!(bulk_payload(cursor, len));
            Ok(Step::Done(RespValue::BulkString(Some(
                src.slice(start..start + len),
            ))))
        }
        b'*' => {
            let Some(len) = ready!(array_len(cursor)) else {
                return Ok(Step::Done(RespValue::Array(None)));
            };
            let mut array = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                array.push(ready!(parse_value(cursor, src)));
            }
            Ok(Step::Done(RespValue::Array(Some(array))))
        }
        other => Err(invalid_marker(other)),
    }
}

fn invalid_marker(marker: u8) -> XdisError {
    XdisError::Protocol(format!("invalid RESP type marker: {}", marker as char))
}

/// Bulk header after the `$`; `None` is the null bulk string.
fn bulk_len(cursor: &mut Cursor<&[u8]>) -> Result<Step<Option<usize>>> {
    let line = ready!(read_line(cursor));
    let len = parse_number(line, "bulk length")?;
    if len == -1 {
        return Ok(Step::Done(None));
    }
    if !(0..=MAX_BULK_LEN).contains(&len) {
        return Err(XdisError::Protocol(format!("invalid bulk length: {}", len)));
    }
    Ok(Step::Done(Some(len as usize)))
}

/// Skips `len` payload bytes and the CRLF; returns the payload offset.
fn bulk_payload(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Step<usize>> {
    if cursor.remaining() < len + 2 {
        return Ok(Step::Incomplete);
    }
    let start = cursor.position() as usize;
    if &cursor.get_ref()[start + len..start + len + 2] != b"\r\n" {
        return Err(XdisError::Protocol("bulk string not terminated".to_string()));
    }
    cursor.advance(len + 2);
    Ok(Step::Done(start))
}

/// Array header after the `*`; `None` is the null array.
fn array_len(cursor: &mut Cursor<&[u8]>) -> Result<Step<Option<usize>>> {
    let line = ready!(read_line(cursor));
    let len = parse_number(line, "multibulk length")?;
    if len == -1 {
        return Ok(Step::Done(None));
    }
    if !(0..=MAX_ARRAY_LEN).contains(&len) {
        return Err(XdisError::Protocol(format!("invalid multibulk length: {}", len)));
    }
    Ok(Step::Done(Some(len as usize)))
}

/// Inline commands (`PING\r\n`), as typed into telnet.
fn parse_inline(cursor: &mut Cursor<&[u8]>, src: &Bytes) -> Result<Step<RespValue>> {
    let line = ready!(read_line(cursor));
    let parts: Vec<RespValue> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|p| !p.is_empty())
        .map(|p| RespValue::BulkString(Some(src.slice_ref(p))))
        .collect();
    Ok(Step::Done(RespValue::Array(Some(parts))))
}

/// Reads up to the next CRLF. A line longer than [`MAX_LINE_LEN`] is a
/// protocol error, complete or not.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<Step<&'a [u8]>> {
    let start = cursor.position() as usize;
    let data: &'a [u8] = *cursor.get_ref();
    let window = &data[start..data.len().min(start + MAX_LINE_LEN + 2)];

    match window.windows(2).position(|w| w == b"\r\n") {
        Some(offset) => {
            cursor.set_position((start + offset + 2) as u64);
            Ok(Step::Done(&data[start..start + offset]))
        }
        None if window.len() >= MAX_LINE_LEN + 2 => Err(XdisError::Protocol(format!(
            "line longer than {} bytes",
            MAX_LINE_LEN
        ))),
        None => Ok(Step::Incomplete),
    }
}

fn parse_number(line: &[u8], what: &str) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            XdisError::Protocol(format!(
                "invalid {}: {}",
                what,
                String::from_utf8_lossy(line)
            ))
        })
}
