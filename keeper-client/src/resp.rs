//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server responses over an async
//! buffered reader, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Iterative Parsing**: Nested arrays are folded with an explicit stack,
//!    so no recursive futures are boxed.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{StoreError, StoreResult};

/// Upper bound on a single bulk reply.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Upper bound on elements in one array reply.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;
/// Elements reserved up front for an array; the rest grow on demand.
const ARRAY_PREALLOC: usize = 64;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with None for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// True for null bulk strings and null arrays.
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Bulk(None) | RespValue::Array(None))
    }

    /// Text of simple and bulk strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Integer replies.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Converts a server error reply into `Err`, leaving other values as-is.
    pub fn into_result(self) -> StoreResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(StoreError::Server(
                String::from_utf8_lossy(&message).into_owned(),
            )),
            other => Ok(other),
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

enum Frame {
    Value(RespValue),
    ArrayHeader(usize),
}

/// Reads one complete RESP value from the buffered reader.
pub async fn read_response<R>(reader: &mut R, line_buf: &mut Vec<u8>) -> StoreResult<RespValue>
where
    R: AsyncBufRead + Unpin,
{
    // Open arrays: (items still expected, items collected so far).
    let mut stack: Vec<(usize, Vec<RespValue>)> = Vec::new();

    loop {
        let mut value = match read_frame(reader, line_buf).await? {
            Frame::Value(value) => value,
            Frame::ArrayHeader(len) => {
                stack.push((len, Vec::with_capacity(len.min(ARRAY_PREALLOC))));
                continue;
            }
        };

        loop {
            let Some((remaining, items)) = stack.last_mut() else {
                return Ok(value);
            };
            items.push(value);
            *remaining -= 1;
            if *remaining > 0 {
                break;
            }
            let items = stack.pop().map(|(_, items)| items).unwrap_or_default();
            value = RespValue::Array(Some(items));
        }
    }
}

async fn read_frame<R>(reader: &mut R, line_buf: &mut Vec<u8>) -> StoreResult<Frame>
where
    R: AsyncBufRead + Unpin,
{
    read_line(reader, line_buf).await?;
    if line_buf.is_empty() {
        return Err(StoreError::Protocol("empty reply line"));
    }

    let frame = match line_buf[0] {
        b'+' => Frame::Value(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Frame::Value(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Frame::Value(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            Frame::Value(read_bulk(reader, len).await?)
        }
        b'*' => match parse_i64(&line_buf[1..])? {
            len if len < 0 => Frame::Value(RespValue::Array(None)),
            0 => Frame::Value(RespValue::Array(Some(Vec::new()))),
            len if len > MAX_ARRAY_LEN => return Err(StoreError::Protocol("array reply too long")),
            len => Frame::ArrayHeader(len as usize),
        },
        _ => return Err(StoreError::Protocol("unknown reply type")),
    };
    Ok(frame)
}

async fn read_bulk<R>(reader: &mut R, len: i64) -> StoreResult<RespValue>
where
    R: AsyncBufRead + Unpin,
{
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len > MAX_BULK_LEN {
        return Err(StoreError::Protocol("bulk reply too long"));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != [b'\r', b'\n'] {
        return Err(StoreError::Protocol("bulk string not terminated by crlf"));
    }
    Ok(RespValue::Bulk(Some(data)))
}

async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> StoreResult<()>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).await?;
    if bytes == 0 {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        )));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(StoreError::Protocol("reply line not terminated by crlf"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> StoreResult<i64> {
    if data.is_empty() {
        return Err(StoreError::Protocol("empty integer"));
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(StoreError::Protocol("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
