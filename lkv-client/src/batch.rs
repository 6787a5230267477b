//! # Batched Writes
//!
//! A `Batch` pins one pooled connection and buffers mutating commands until
//! `end`, which sends them as a single pipeline and waits for every reply.
//!
//! Any failure while flushing abandons the batch: the buffer is discarded,
//! the connection goes back (and is dropped if the socket is suspect), the
//! connection's pool is invalidated, and the error is returned. A batch that
//! is dropped without `end` discards its buffer and sends nothing.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{check_key, check_ttl, expire_command, set_command, Mutate};
use crate::collections::{
    check_nonempty, check_score, check_score_range, hdel_command, hset_command, hsetnx_command, lpush_command,
    lrem_command, sadd_command, with_data_ttl, zadd_command, zremrange_command,
};
use crate::error::{ClientError, ClientResult};
use crate::manager::PoolManager;
use crate::pool::PooledConnection;
use crate::resp::{Command, RespValue};

/// Buffered mutations bound to one borrowed connection.
///
/// Collection writes that carry the data TTL queue two commands, so `len`
/// counts wire commands rather than calls.
pub struct Batch {
    manager: Arc<PoolManager>,
    conn: Option<PooledConnection>,
    commands: Vec<Command>,
    data_ttl: Option<Duration>,
}

impl Batch {
    pub(crate) fn begin(manager: Arc<PoolManager>, data_ttl: Option<Duration>) -> ClientResult<Self> {
        let conn = manager.borrow()?;
        tracing::debug!(pool = conn.pool_id(), endpoint = %conn.endpoint(), "batch started");
        Ok(Batch {
            manager,
            conn: Some(conn),
            commands: Vec::new(),
            data_ttl,
        })
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Flushes the buffer in one round trip and returns the connection.
    ///
    /// Replies come back in command order. If the store rejected any command
    /// the first rejection is returned as an error after all replies have
    /// been read; commands before and after it were still applied.
    pub fn end(mut self) -> ClientResult<Vec<RespValue>> {
        let mut conn = self.conn.take().ok_or(ClientError::BatchAbandoned)?;
        let commands = std::mem::take(&mut self.commands);
        let pool_id = conn.pool_id();

        let replies = match conn.pipeline(&commands) {
            Ok(replies) => replies,
            Err(err) => {
                tracing::error!(pool = pool_id, commands = commands.len(), error = %err, "batch flush failed, abandoning");
                self.manager.release(conn);
                if err.poisons_connection() {
                    self.manager.invalidate(pool_id);
                }
                return Err(err);
            }
        };
        self.manager.release(conn);

        let rejected = replies.iter().enumerate().find_map(|(idx, reply)| match reply {
            RespValue::Error(message) => Some((idx, message)),
            _ => None,
        });
        if let Some((idx, message)) = rejected {
            let command = String::from_utf8_lossy(commands[idx].name());
            tracing::warn!(pool = pool_id, index = idx, command = %command, "batch command rejected");
            return Err(ClientError::server(message));
        }
        tracing::debug!(pool = pool_id, commands = commands.len(), "batch flushed");
        Ok(replies)
    }

    fn queue(&mut self, command: Command) -> ClientResult<()> {
        self.queue_all(vec![command])
    }

    fn queue_all(&mut self, commands: Vec<Command>) -> ClientResult<()> {
        if self.conn.is_none() {
            return Err(ClientError::BatchAbandoned);
        }
        self.commands.extend(commands);
        Ok(())
    }
}

impl Mutate for Batch {
    fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        let command = set_command(key, value, self.data_ttl);
        self.queue(command)
    }

    fn set_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        check_key(key)?;
        check_ttl(ttl)?;
        self.queue(set_command(key, value, Some(ttl)))
    }

    fn delete(&mut self, key: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        self.queue(Command::new("DEL").arg(key))
    }

    fn expire(&mut self, key: &[u8], ttl: Duration) -> ClientResult<()> {
        check_key(key)?;
        check_ttl(ttl)?;
        self.queue(expire_command(key, ttl))
    }

    fn push(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        self.queue_all(with_data_ttl(lpush_command(key, value), key, self.data_ttl))
    }

    fn remove_from_list(&mut self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        self.queue(lrem_command(key, value))
    }

    fn add_to_set(&mut self, key: &[u8], members: &[&[u8]]) -> ClientResult<()> {
        check_key(key)?;
        check_nonempty(members.len(), "no set members")?;
        self.queue_all(with_data_ttl(sadd_command(key, members), key, self.data_ttl))
    }

    fn remove_from_set(&mut self, key: &[u8], member: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        self.queue(Command::new("SREM").arg(key).arg(member))
    }

    fn set_hash(&mut self, key: &[u8], fields: &[(&[u8], &[u8])]) -> ClientResult<()> {
        check_key(key)?;
        check_nonempty(fields.len(), "no hash fields")?;
        self.queue_all(with_data_ttl(hset_command(key, fields), key, self.data_ttl))
    }

    fn hash_set_if_absent(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        self.queue(hsetnx_command(key, field, value))
    }

    fn hash_delete(&mut self, key: &[u8], field: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        self.queue(hdel_command(key, field))
    }

    fn add_scored(&mut self, key: &[u8], member: &[u8], score: f64) -> ClientResult<()> {
        check_key(key)?;
        check_score(score)?;
        self.queue(zadd_command(key, member, score))
    }

    fn remove_scored(&mut self, key: &[u8], member: &[u8]) -> ClientResult<()> {
        check_key(key)?;
        self.queue(Command::new("ZREM").arg(key).arg(member))
    }

    fn remove_score_range(&mut self, key: &[u8], min: f64, max: f64) -> ClientResult<()> {
        check_key(key)?;
        check_score_range(min, max)?;
        self.queue(zremrange_command(key, min, max))
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.commands.is_empty() {
                tracing::warn!(pool = conn.pool_id(), discarded = self.commands.len(), "batch dropped without end");
            }
            self.manager.release(conn);
        }
    }
}
