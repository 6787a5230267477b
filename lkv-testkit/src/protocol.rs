//! # RESP2 Request Parser
//!
//! Incremental parser for client requests: arrays of bulk strings, plus
//! inline commands for hand-typed sessions. Consumes bytes from a `BytesMut`
//! only once a whole request is available.

use bytes::{Buf, BytesMut};

/// Longest inline command or header line accepted.
const MAX_LINE: usize = 64 * 1024;
/// Largest bulk argument accepted.
const MAX_BULK: usize = 512 * 1024 * 1024;
/// Most arguments accepted in one request.
const MAX_ARGS: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    /// Malformed frame; the connection should be closed.
    Protocol,
}

/// Stateless between requests; kept as a type so callers hold one per
/// connection.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Parses one request from the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed; nothing is consumed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != b'*' {
            return parse_inline(buf);
        }

        let mut pos = 0;
        let count = match read_header(buf, &mut pos, b'*')? {
            Some(count) => count,
            None => return Ok(None),
        };
        if count < 0 {
            buf.advance(pos);
            return Ok(Some(Vec::new()));
        }
        let count = count as usize;
        if count > MAX_ARGS {
            return Err(RespError::Protocol);
        }

        let mut args = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let len = match read_header(buf, &mut pos, b'$')? {
                Some(len) if len >= 0 && (len as usize) <= MAX_BULK => len as usize,
                Some(_) => return Err(RespError::Protocol),
                None => return Ok(None),
            };
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

/// Reads `<prefix><integer>\r\n` starting at `pos`.
fn read_header(buf: &BytesMut, pos: &mut usize, prefix: u8) -> Result<Option<i64>, RespError> {
    let line_end = match find_crlf(&buf[*pos..]) {
        Some(end) => *pos + end,
        None if buf.len() - *pos > MAX_LINE => return Err(RespError::Protocol),
        None => return Ok(None),
    };
    if buf[*pos] != prefix {
        return Err(RespError::Protocol);
    }
    let value = parse_i64(&buf[*pos + 1..line_end]).ok_or(RespError::Protocol)?;
    *pos = line_end + 2;
    Ok(Some(value))
}

fn parse_inline(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
    let line_end = match buf.iter().position(|&b| b == b'\n') {
        Some(end) => end,
        None if buf.len() > MAX_LINE => return Err(RespError::Protocol),
        None => return Ok(None),
    };
    let line = buf.split_to(line_end + 1);
    let args = line[..]
        .split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    Ok(Some(args))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_i64(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Vec<Vec<Vec<u8>>> {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(args) = parser.parse(&mut buf).unwrap() {
            out.push(args);
        }
        out
    }

    #[test]
    fn parses_pipelined_arrays() {
        let requests = parse_all(b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], vec![b"GET".to_vec(), b"k".to_vec()]);
    }

    #[test]
    fn waits_for_partial_frames() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$5\r\nhel"[..]);
        assert_eq!(parser.parse(&mut buf), Ok(None));
        assert_eq!(buf.len(), 20);
        buf.extend_from_slice(b"lo\r\n");
        assert_eq!(parser.parse(&mut buf), Ok(Some(vec![b"GET".to_vec(), b"hello".to_vec()])));
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_inline_commands() {
        let requests = parse_all(b"SET  key value\r\nPING\n");
        assert_eq!(requests[0], vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
        assert_eq!(requests[1], vec![b"PING".to_vec()]);
    }

    #[test]
    fn rejects_bad_framing() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"*1\r\n:4\r\nPING\r\n"[..]);
        assert_eq!(parser.parse(&mut buf), Err(RespError::Protocol));
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPINGxx"[..]);
        assert_eq!(parser.parse(&mut buf), Err(RespError::Protocol));
    }
}
