//! # Client Errors
//!
//! One error type for the whole client so lock, batch, and pool failures
//! propagate through `?` unchanged.

use lkv_common::ConfigError;
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,

    /// Server returned an error reply.
    #[error("server error: {message}")]
    Server { message: String },

    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// Endpoint could not be resolved into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Caller passed an argument the store would reject.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Pool stayed at capacity for the whole borrow wait.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// No current pool could be obtained within the borrow wait.
    #[error("no connection pool available")]
    PoolUnavailable,

    /// The pool was destroyed while the caller was using or waiting on it.
    #[error("connection pool closed")]
    PoolClosed,

    /// The pool manager has been shut down.
    #[error("pool manager shut down")]
    Shutdown,

    /// A batch was abandoned after an earlier failure.
    #[error("batch abandoned after a previous error")]
    BatchAbandoned,

    /// Lock backend returned something other than "set" or "exists".
    #[error("lock error on {key}: {reason}")]
    Lock { key: String, reason: String },

    /// Startup configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// True for failures that a fresh connection or pool may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Protocol
                | ClientError::PoolExhausted
                | ClientError::PoolUnavailable
                | ClientError::PoolClosed
        )
    }

    /// True when the connection that produced this error must not be reused.
    pub(crate) fn poisons_connection(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Protocol)
    }

    pub(crate) fn server(message: &[u8]) -> Self {
        ClientError::Server {
            message: String::from_utf8_lossy(message).into_owned(),
        }
    }
}
