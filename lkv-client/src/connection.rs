//! # Store Connection
//!
//! A single TCP connection to one endpoint, with reusable framing buffers and
//! optional `AUTH` on connect.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use lkv_common::Endpoint;

use crate::error::{ClientError, ClientResult};
use crate::resp::{encode_pipeline, read_response, Command, RespValue};

/// Connection parameters shared by every connection of a pool.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Credential sent with `AUTH` right after connecting.
    pub password: Option<String>,
    /// Connect, read, and write timeout.
    pub timeout: Option<Duration>,
}

/// Single TCP connection with reusable buffers.
pub struct Connection {
    endpoint: Endpoint,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    /// Opens a connection and authenticates when a password is configured.
    pub fn open(endpoint: &Endpoint, options: &ConnectOptions) -> ClientResult<Self> {
        let stream = connect_stream(endpoint, options.timeout)?;
        stream.set_read_timeout(options.timeout)?;
        stream.set_write_timeout(options.timeout)?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let mut conn = Connection {
            endpoint: endpoint.clone(),
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        };

        if let Some(password) = options.password.as_deref() {
            conn.exec(&Command::new("AUTH").arg(password))?.expect_ok()?;
        }
        tracing::trace!(endpoint = %endpoint, "connection opened");
        Ok(conn)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sends one command and waits for its reply.
    pub fn exec(&mut self, command: &Command) -> ClientResult<RespValue> {
        self.write_buf.clear();
        command.encode(&mut self.write_buf);
        self.flush_buffer()?;
        read_response(&mut self.reader, &mut self.line_buf)
    }

    /// Sends every command in one write, then reads one reply per command.
    ///
    /// All replies are drained even when some are error replies, so the
    /// connection stays in sync.
    pub fn pipeline(&mut self, commands: &[Command]) -> ClientResult<Vec<RespValue>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.write_buf.clear();
        encode_pipeline(commands, &mut self.write_buf);
        self.flush_buffer()?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(read_response(&mut self.reader, &mut self.line_buf)?);
        }
        Ok(replies)
    }

    /// Round-trips a `PING`.
    pub fn ping(&mut self) -> ClientResult<()> {
        match self.exec(&Command::new("PING"))?.into_result()? {
            RespValue::Simple(_) | RespValue::Bulk(Some(_)) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    fn flush_buffer(&mut self) -> ClientResult<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }
}

fn connect_stream(endpoint: &Endpoint, timeout: Option<Duration>) -> ClientResult<TcpStream> {
    let addrs: Vec<SocketAddr> = endpoint
        .authority()
        .to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress(endpoint.to_string()))?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => ClientError::Io(err),
        None => ClientError::InvalidAddress(endpoint.to_string()),
    })
}
