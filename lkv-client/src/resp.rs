//! # RESP2 Framing
//!
//! Purpose: Encode commands (singly or as a pipeline) and parse replies from
//! the store's native wire protocol.
//!
//! ## Design Principles
//! 1. **Owned Commands**: `Command` owns its arguments so batches can buffer
//!    them past the caller's borrow.
//! 2. **Buffer Reuse**: Encoding appends into a caller-provided buffer.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::io::{BufRead, Write};

use crate::error::{ClientError, ClientResult};

/// Arrays nested deeper than this are treated as a protocol violation.
const MAX_DEPTH: usize = 8;
/// Largest bulk string accepted, matching the server-side limit.
const MAX_BULK: usize = 512 * 1024 * 1024;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays, with an empty vector for null arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Turns an error reply into `ClientError::Server`, passing others through.
    pub fn into_result(self) -> ClientResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(ClientError::server(&message)),
            other => Ok(other),
        }
    }

    /// Accepts a `+OK`-style acknowledgement.
    pub fn expect_ok(self) -> ClientResult<()> {
        match self.into_result()? {
            RespValue::Simple(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Extracts an integer reply.
    pub fn into_integer(self) -> ClientResult<i64> {
        match self.into_result()? {
            RespValue::Integer(value) => Ok(value),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Extracts a bulk reply; `None` is the null bulk string.
    pub fn into_bulk(self) -> ClientResult<Option<Vec<u8>>> {
        match self.into_result()? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Extracts an array of non-null bulk strings.
    pub fn into_bulk_array(self) -> ClientResult<Vec<Vec<u8>>> {
        match self.into_result()? {
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| item.into_bulk().and_then(|data| data.ok_or(ClientError::UnexpectedResponse)))
                .collect(),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Bulk(None))
    }
}

/// One command and its arguments, ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Command {
            args: vec![name.as_bytes().to_vec()],
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Appends an unsigned integer argument in decimal form.
    pub fn arg_u64(self, value: u64) -> Self {
        self.arg(value.to_string())
    }

    /// Command name as sent on the wire.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Frames this command as a RESP2 array of bulk strings.
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_header(out, b'*', self.args.len());
        for arg in &self.args {
            push_header(out, b'$', arg.len());
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Frames several commands back to back for a single write.
pub fn encode_pipeline<'a, I>(commands: I, out: &mut Vec<u8>)
where
    I: IntoIterator<Item = &'a Command>,
{
    for command in commands {
        command.encode(out);
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_value(reader, line_buf, 0)
}

fn read_value<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> ClientResult<RespValue> {
    if depth > MAX_DEPTH {
        return Err(ClientError::Protocol);
    }
    read_line(reader, line_buf)?;
    let (&marker, body) = line_buf.split_first().ok_or(ClientError::Protocol)?;

    match marker {
        b'+' => Ok(RespValue::Simple(body.to_vec())),
        b'-' => Ok(RespValue::Error(body.to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(body)?)),
        b'$' => match usize::try_from(parse_i64(body)?) {
            Ok(len) => read_bulk(reader, len).map(|data| RespValue::Bulk(Some(data))),
            Err(_) => Ok(RespValue::Bulk(None)),
        },
        b'*' => {
            let len = usize::try_from(parse_i64(body)?).unwrap_or(0);
            let mut items = Vec::with_capacity(len.min(64));
            for _ in 0..len {
                items.push(read_value(reader, line_buf, depth + 1)?);
            }
            Ok(RespValue::Array(items))
        }
        _ => Err(ClientError::Protocol),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: usize) -> ClientResult<Vec<u8>> {
    if len > MAX_BULK {
        return Err(ClientError::Protocol);
    }
    // Payload plus the trailing CRLF in one read.
    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data)?;
    if !data.ends_with(b"\r\n") {
        return Err(ClientError::Protocol);
    }
    data.truncate(len);
    Ok(data)
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        // Peer closed the socket between replies.
        return Err(ClientError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(ClientError::Protocol)
}

fn push_header(out: &mut Vec<u8>, marker: u8, len: usize) {
    out.push(marker);
    // Writing into a Vec cannot fail.
    let _ = write!(out, "{}\r\n", len);
}
