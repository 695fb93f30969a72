//! # RESP2 Request Parser
//!
//! Incrementally decode client commands from a read buffer. A command is
//! either a RESP array of bulk strings or a single inline line
//! (`PING\r\n`), the form `redis-cli` and telnet sessions send.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Upper bound on a single bulk argument.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Upper bound on arguments in one command.
const MAX_ARGS: usize = 1024 * 1024;

/// Request framing errors. The connection is closed after reporting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RespError {
    #[error("protocol error")]
    Protocol,
}

/// Stateless parser; kept as a type so callers can hold one per connection.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Parses one complete command from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when more bytes are
    /// needed; consumes the command's bytes on success.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != b'*' {
            return Ok(parse_inline(buf));
        }

        let mut pos = 0;
        let count = match read_line(buf, &mut pos) {
            Some(line) => parse_len(&line[1..])?,
            None => return Ok(None),
        };
        let Some(count) = count else {
            // Null array: nothing to run.
            buf.advance(pos);
            return Ok(Some(Vec::new()));
        };
        if count > MAX_ARGS {
            return Err(RespError::Protocol);
        }

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let header = match read_line(buf, &mut pos) {
                Some(line) => line,
                None => return Ok(None),
            };
            if header.first() != Some(&b'$') {
                return Err(RespError::Protocol);
            }
            let len = parse_len(&header[1..])?.ok_or(RespError::Protocol)?;
            if len > MAX_BULK_LEN {
                return Err(RespError::Protocol);
            }
            if buf.len() < pos + len + 2 {
                return Ok(None);
            }
            if &buf[pos + len..pos + len + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            args.push(buf[pos..pos + len].to_vec());
            pos += len + 2;
        }

        buf.advance(pos);
        Ok(Some(args))
    }
}

/// Returns the line starting at `*pos` without its CRLF and moves `*pos`
/// past it, or `None` when the line is incomplete.
fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let start = *pos;
    let offset = buf[start..].windows(2).position(|window| window == b"\r\n")?;
    *pos = start + offset + 2;
    Some(&buf[start..start + offset])
}

/// Parses a length field; `-1` means null.
fn parse_len(digits: &[u8]) -> Result<Option<usize>, RespError> {
    if digits == b"-1" {
        return Ok(None);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .map(Some)
        .ok_or(RespError::Protocol)
}

fn parse_inline(buf: &mut BytesMut) -> Option<Vec<Vec<u8>>> {
    let end = buf.windows(2).position(|window| window == b"\r\n")?;
    let line = buf.split_to(end + 2);
    Some(
        line[..end]
            .split(|byte| byte.is_ascii_whitespace())
            .filter(|word| !word.is_empty())
            .map(<[u8]>::to_vec)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> (Vec<Vec<Vec<u8>>>, BytesMut) {
        let mut buf = BytesMut::from(input);
        let mut parser = RespParser::new();
        let mut commands = Vec::new();
        while let Some(args) = parser.parse(&mut buf).unwrap() {
            commands.push(args);
        }
        (commands, buf)
    }

    #[test]
    fn parses_array_command() {
        let (commands, rest) = parse_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nvalue\r\n");
        assert_eq!(commands, vec![vec![b"SET".to_vec(), b"k".to_vec(), b"value".to_vec()]]);
        assert!(rest.is_empty());
    }

    #[test]
    fn waits_for_partial_frames() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$5\r\nal"[..]);
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 19);

        buf.extend_from_slice(b"pha\r\n");
        assert_eq!(
            parser.parse(&mut buf).unwrap(),
            Some(vec![b"GET".to_vec(), b"alpha".to_vec()])
        );
    }

    #[test]
    fn parses_pipelined_commands() {
        let (commands, _) = parse_all(b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nINCR\r\n$1\r\nn\r\n");
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1][0], b"INCR");
    }

    #[test]
    fn parses_inline_command() {
        let (commands, _) = parse_all(b"SET  key value\r\nPING\r\n");
        assert_eq!(commands[0], vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
        assert_eq!(commands[1], vec![b"PING".to_vec()]);
    }

    #[test]
    fn rejects_malformed_bulk() {
        let mut buf = BytesMut::from(&b"*1\r\n+OK\r\n"[..]);
        assert_eq!(RespParser::new().parse(&mut buf), Err(RespError::Protocol));

        let mut buf = BytesMut::from(&b"*1\r\n$2\r\nabcd\r\n"[..]);
        assert_eq!(RespParser::new().parse(&mut buf), Err(RespError::Protocol));
    }
}
