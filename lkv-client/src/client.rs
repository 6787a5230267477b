//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API over the pool manager. String
//! calls live here; list, set, hash, sorted-set, and counter calls are in
//! `collections`.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling, failover, and framing.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Bounded Retry**: Each call wraps borrow + operate + release in a
//!    retry loop with exponential backoff, for transient failures only.
//! 4. **Invalidate On IO Failure**: A socket error retires the pool that
//!    produced it before the next attempt.

use std::sync::Arc;
use std::time::Duration;

use lkv_common::Settings;

use crate::batch::Batch;
use crate::error::{ClientError, ClientResult};
use crate::manager::PoolManager;
use crate::pool::PooledConnection;
use crate::resp::{Command, RespValue};

/// Retry schedule for facade calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first; at least 1.
    pub attempts: u32,
    /// Sleep before the second attempt, doubled for each one after.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.delay.saturating_mul(factor)
    }
}

/// Options for the facade itself (pool tuning lives in `ManagerOptions`).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub retry: RetryPolicy,
    /// TTL applied by `set`; `None` keeps keys until deleted.
    pub data_ttl: Option<Duration>,
}

impl ClientOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        ClientOptions {
            retry: RetryPolicy {
                attempts: settings.retry_attempts.max(1),
                delay: settings.retry_delay,
            },
            data_ttl: settings.data_ttl,
        }
    }
}

/// TTL state of a key, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

struct ClientInner {
    manager: Arc<PoolManager>,
    options: ClientOptions,
}

/// Cloneable handle to the store. Clones share one pool manager.
#[derive(Clone)]
pub struct KVClient {
    inner: Arc<ClientInner>,
}

impl KVClient {
    /// Validates settings, builds the directory and pool manager, and
    /// starts its background tasks.
    pub fn connect(settings: &Settings) -> ClientResult<Self> {
        settings.validate()?;
        let manager = PoolManager::from_settings(settings)?;
        Ok(Self::from_manager(Arc::new(manager), ClientOptions::from_settings(settings)))
    }

    /// Wraps an existing manager.
    pub fn from_manager(manager: Arc<PoolManager>, options: ClientOptions) -> Self {
        KVClient {
            inner: Arc::new(ClientInner { manager, options }),
        }
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.inner.manager
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Opens a batch bound to one borrowed connection.
    pub fn begin(&self) -> ClientResult<Batch> {
        Batch::begin(Arc::clone(&self.inner.manager), self.inner.options.data_ttl)
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        check_key(key)?;
        let command = Command::new("GET").arg(key);
        self.run("GET", key, |conn| conn.exec(&command)?.into_bulk())
    }

    /// Sets a value, attaching the configured data TTL if any.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        let command = set_command(key, value, self.inner.options.data_ttl);
        self.run("SET", key, |conn| conn.exec(&command)?.expect_ok())
    }

    /// Sets a value that expires after `ttl`.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        check_key(key)?;
        check_ttl(ttl)?;
        let command = set_command(key, value, Some(ttl));
        self.run("SET", key, |conn| conn.exec(&command)?.expect_ok())
    }

    /// Atomically sets `key` only when it does not exist, with a TTL.
    ///
    /// `Ok(false)` means the key already exists; failures of the store come
    /// back as errors, never as `false`.
    pub fn set_if_absent(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<bool> {
        check_key(key)?;
        check_ttl(ttl)?;
        let command = with_expiry(Command::new("SET").arg(key).arg(value).arg("NX"), ttl);
        self.run("SET NX", key, |conn| match conn.exec(&command)?.into_result()? {
            RespValue::Simple(_) => Ok(true),
            reply if reply.is_null() => Ok(false),
            _ => Err(ClientError::UnexpectedResponse),
        })
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        check_key(key)?;
        let command = Command::new("DEL").arg(key);
        self.run("DEL", key, |conn| Ok(conn.exec(&command)?.into_integer()? > 0))
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        check_key(key)?;
        check_ttl(ttl)?;
        let command = expire_command(key, ttl);
        self.run("EXPIRE", key, |conn| Ok(conn.exec(&command)?.into_integer()? == 1))
    }

    /// Returns TTL status for a key.
    pub fn ttl(&self, key: &[u8]) -> ClientResult<KeyTtl> {
        check_key(key)?;
        let command = Command::new("TTL").arg(key);
        self.run("TTL", key, |conn| match conn.exec(&command)?.into_integer()? {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::NoExpiry),
            secs if secs >= 0 => Ok(KeyTtl::ExpiresIn(Duration::from_secs(secs as u64))),
            _ => Err(ClientError::UnexpectedResponse),
        })
    }

    /// Round-trips a `PING` through the current pool.
    pub fn ping(&self) -> ClientResult<()> {
        self.run("PING", b"", PooledConnection::ping)
    }

    /// Shuts the shared pool manager down.
    pub fn shutdown(&self) {
        self.inner.manager.shutdown();
    }

    pub(crate) fn run<T, F>(&self, op: &'static str, key: &[u8], mut call: F) -> ClientResult<T>
    where
        F: FnMut(&mut PooledConnection) -> ClientResult<T>,
    {
        let manager = &self.inner.manager;
        let retry = self.inner.options.retry;
        let mut attempt = 1;
        loop {
            let result = manager.borrow().and_then(|mut conn| {
                let result = call(&mut conn);
                if let Err(err) = &result {
                    if err.poisons_connection() {
                        manager.invalidate(conn.pool_id());
                    }
                }
                manager.release(conn);
                result
            });

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < retry.attempts => {
                    tracing::warn!(
                        op,
                        key = %String::from_utf8_lossy(key),
                        attempt,
                        error = %err,
                        "store call failed, retrying"
                    );
                    std::thread::sleep(retry.backoff(attempt));
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(op, key = %String::from_utf8_lossy(key), error = %err, "store call failed");
                    return Err(err);
                }
            }
        }
    }
}

/// Mutating calls shared by the pass-through client and batches, so call
/// sites read the same whether or not a batch is open.
pub trait Mutate {
    fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()>;
    fn set_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()>;
    fn delete(&mut self, key: &[u8]) -> ClientResult<()>;
    fn expire(&mut self, key: &[u8], ttl: Duration) -> ClientResult<()>;
    fn push(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()>;
    fn remove_from_list(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()>;
    fn add_to_set(&mut self, key: &[u8], members: &[&[u8]]) -> ClientResult<()>;
    fn remove_from_set(&mut self, key: &[u8], member: &[u8]) -> ClientResult<()>;
    fn set_hash(&mut self, key: &[u8], fields: &[(&[u8], &[u8])]) -> ClientResult<()>;
    fn hash_set_if_absent(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> ClientResult<()>;
    fn hash_delete(&mut self, key: &[u8], field: &[u8]) -> ClientResult<()>;
    fn add_scored(&mut self, key: &[u8], member: &[u8], score: f64) -> ClientResult<()>;
    fn remove_scored(&mut self, key: &[u8], member: &[u8]) -> ClientResult<()>;
    fn remove_score_range(&mut self, key: &[u8], min: f64, max: f64) -> ClientResult<()>;
}

impl Mutate for KVClient {
    fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        KVClient::set(self, key, value)
    }

    fn set_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        KVClient::set_with_ttl(self, key, value, ttl)
    }

    fn delete(&mut self, key: &[u8]) -> ClientResult<()> {
        KVClient::delete(self, key).map(|_| ())
    }

    fn expire(&mut self, key: &[u8], ttl: Duration) -> ClientResult<()> {
        KVClient::expire(self, key, ttl).map(|_| ())
    }

    fn push(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        KVClient::push(self, key, value).map(|_| ())
    }

    fn remove_from_list(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        KVClient::remove_from_list(self, key, value).map(|_| ())
    }

    fn add_to_set(&mut self, key: &[u8], members: &[&[u8]]) -> ClientResult<()> {
        KVClient::add_to_set(self, key, members).map(|_| ())
    }

    fn remove_from_set(&mut self, key: &[u8], member: &[u8]) -> ClientResult<()> {
        KVClient::remove_from_set(self, key, member).map(|_| ())
    }

    fn set_hash(&mut self, key: &[u8], fields: &[(&[u8], &[u8])]) -> ClientResult<()> {
        KVClient::set_hash(self, key, fields)
    }

    fn hash_set_if_absent(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> ClientResult<()> {
        KVClient::hash_set_if_absent(self, key, field, value).map(|_| ())
    }

    fn hash_delete(&mut self, key: &[u8], field: &[u8]) -> ClientResult<()> {
        KVClient::hash_delete(self, key, field).map(|_| ())
    }

    fn add_scored(&mut self, key: &[u8], member: &[u8], score: f64) -> ClientResult<()> {
        KVClient::add_scored(self, key, member, score).map(|_| ())
    }

    fn remove_scored(&mut self, key: &[u8], member: &[u8]) -> ClientResult<()> {
        KVClient::remove_scored(self, key, member).map(|_| ())
    }

    fn remove_score_range(&mut self, key: &[u8], min: f64, max: f64) -> ClientResult<()> {
        KVClient::remove_score_range(self, key, min, max).map(|_| ())
    }
}

pub(crate) fn check_key(key: &[u8]) -> ClientResult<()> {
    if key.is_empty() {
        return Err(ClientError::InvalidArgument("empty key"));
    }
    Ok(())
}

pub(crate) fn check_ttl(ttl: Duration) -> ClientResult<()> {
    if ttl.as_millis() == 0 {
        return Err(ClientError::InvalidArgument("ttl below one millisecond"));
    }
    Ok(())
}

/// Appends `EX secs`, or `PX millis` when the TTL is not whole seconds.
pub(crate) fn with_expiry(command: Command, ttl: Duration) -> Command {
    if ttl.subsec_millis() == 0 {
        command.arg("EX").arg_u64(ttl.as_secs())
    } else {
        command.arg("PX").arg_u64(ttl.as_millis() as u64)
    }
}

pub(crate) fn set_command(key: &[u8], value: &[u8], ttl: Option<Duration>) -> Command {
    let command = Command::new("SET").arg(key).arg(value);
    match ttl {
        Some(ttl) => with_expiry(command, ttl),
        None => command,
    }
}

pub(crate) fn expire_command(key: &[u8], ttl: Duration) -> Command {
    if ttl.subsec_millis() == 0 {
        Command::new("EXPIRE").arg(key).arg_u64(ttl.as_secs())
    } else {
        Command::new("PEXPIRE").arg(key).arg_u64(ttl.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(command: &Command) -> Vec<String> {
        command
            .args()
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect()
    }

    #[test]
    fn expiry_uses_seconds_when_whole() {
        let command = set_command(b"k", b"v", Some(Duration::from_secs(5)));
        assert_eq!(words(&command), vec!["SET", "k", "v", "EX", "5"]);
        let command = set_command(b"k", b"v", Some(Duration::from_millis(1500)));
        assert_eq!(words(&command), vec!["SET", "k", "v", "PX", "1500"]);
        assert_eq!(words(&set_command(b"k", b"v", None)), vec!["SET", "k", "v"]);
    }

    #[test]
    fn expire_switches_to_milliseconds() {
        assert_eq!(words(&expire_command(b"k", Duration::from_secs(2))), vec!["EXPIRE", "k", "2"]);
        assert_eq!(
            words(&expire_command(b"k", Duration::from_millis(250))),
            vec!["PEXPIRE", "k", "250"]
        );
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy {
            attempts: 4,
            delay: Duration::from_millis(10),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
        let single = RetryPolicy {
            attempts: 1,
            delay: Duration::ZERO,
        };
        assert_eq!(single.backoff(1), Duration::ZERO);
    }

    #[test]
    fn rejects_empty_key_and_zero_ttl() {
        assert!(matches!(check_key(b""), Err(ClientError::InvalidArgument(_))));
        assert!(matches!(check_ttl(Duration::from_micros(10)), Err(ClientError::InvalidArgument(_))));
        assert!(check_ttl(Duration::from_millis(1)).is_ok());
    }
}
