//! # Connection Pool
//!
//! Purpose: Reuse TCP connections to a single endpoint, bounding how many
//! exist at once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    connects happen outside the lock on a reserved slot.
//! 3. **Bounded Blocking**: A borrow at capacity waits on a condition variable
//!    until a slot frees up or the borrow timeout elapses.
//! 4. **One Endpoint For Life**: A pool never changes endpoint; it is
//!    destroyed and replaced instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lkv_common::Endpoint;
use parking_lot::{Condvar, Mutex};

use crate::connection::{ConnectOptions, Connection};
use crate::error::{ClientError, ClientResult};
use crate::resp::{Command, RespValue};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Capacity and timing for one pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// How long a borrow may wait for a free slot.
    pub borrow_timeout: Duration,
    /// Options applied to every new connection.
    pub connect: ConnectOptions,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    id: u64,
    endpoint: Endpoint,
    options: PoolOptions,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Connection pool bound to one endpoint. Cloning shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are opened on demand.
    pub fn new(endpoint: Endpoint, options: PoolOptions) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pool = id, endpoint = %endpoint, max = options.max_total, "pool created");
        ConnectionPool {
            inner: Arc::new(PoolInner {
                id,
                endpoint,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(options.max_idle),
                    total: 0,
                    closed: false,
                }),
                options,
                available: Condvar::new(),
            }),
        }
    }

    /// Process-unique pool id, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Borrows a connection, opening a new one if below capacity.
    ///
    /// Blocks up to the borrow timeout when the pool is at capacity.
    pub fn borrow(&self) -> ClientResult<PooledConnection> {
        let deadline = Instant::now() + self.inner.options.borrow_timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(ClientError::PoolClosed);
            }
            if let Some(conn) = state.idle.pop_front() {
                return Ok(PooledConnection::new(self.inner.clone(), conn));
            }
            if state.total < self.inner.options.max_total {
                state.total += 1;
                break;
            }
            if self.inner.available.wait_until(&mut state, deadline).timed_out() {
                tracing::warn!(pool = self.inner.id, endpoint = %self.inner.endpoint, "borrow timed out at capacity");
                return Err(ClientError::PoolExhausted);
            }
        }
        drop(state);

        match Connection::open(&self.inner.endpoint, &self.inner.options.connect) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    /// Borrows a connection and round-trips a `PING` on it.
    pub fn check_health(&self) -> ClientResult<()> {
        let mut conn = self.borrow()?;
        conn.ping()
    }

    /// Closes the pool: idle connections are dropped now, borrowed ones when
    /// they come back, and waiting borrowers fail with `PoolClosed`.
    pub fn destroy(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(idle.len());
            idle
        };
        self.inner.available.notify_all();
        tracing::debug!(pool = self.inner.id, endpoint = %self.inner.endpoint, dropped = idle.len(), "pool destroyed");
        drop(idle);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// True when both handles refer to the same pool.
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Snapshot of current occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            total: state.total,
            max: self.inner.options.max_total,
        }
    }
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.state.lock();
        if !state.closed && state.idle.len() < self.options.max_idle {
            state.idle.push_back(conn);
            drop(state);
        } else {
            state.total = state.total.saturating_sub(1);
            drop(state);
            drop(conn);
        }
        self.available.notify_one();
    }
}

/// Occupancy of a pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections ready to be borrowed.
    pub idle: usize,
    /// Connections currently borrowed.
    pub in_use: usize,
    /// Idle plus borrowed.
    pub total: usize,
    /// Capacity.
    pub max: usize,
}

impl PoolStatus {
    /// Percentage of capacity currently borrowed.
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// RAII wrapper returning a connection to its pool on drop.
///
/// A connection that saw an IO or framing error is discarded instead.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Id of the originating pool.
    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoint
    }

    /// Executes one command and returns the parsed reply.
    pub fn exec(&mut self, command: &Command) -> ClientResult<RespValue> {
        let result = self.conn_mut()?.exec(command);
        self.track(result)
    }

    /// Executes several commands in one round trip.
    pub fn pipeline(&mut self, commands: &[Command]) -> ClientResult<Vec<RespValue>> {
        let result = self.conn_mut()?.pipeline(commands);
        self.track(result)
    }

    pub fn ping(&mut self) -> ClientResult<()> {
        let result = self.conn_mut()?.ping();
        self.track(result)
    }

    /// Marks the connection as unusable so it is not returned to the pool.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    fn conn_mut(&mut self) -> ClientResult<&mut Connection> {
        self.conn.as_mut().ok_or(ClientError::PoolClosed)
    }

    fn track<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(err) = &result {
            if err.poisons_connection() {
                // Unknown stream position; never hand this socket out again.
                self.valid = false;
            }
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.valid {
            self.pool.return_connection(conn);
        } else {
            tracing::debug!(pool = self.pool.id, endpoint = %conn.endpoint(), "discarding broken connection");
            drop(conn);
            self.pool.release_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_status_utilization() {
        let status = PoolStatus {
            idle: 1,
            in_use: 3,
            total: 4,
            max: 4,
        };
        assert!((status.utilization() - 75.0).abs() < f64::EPSILON);
        assert!(status.is_at_capacity());
    }

    #[test]
    fn destroyed_pool_refuses_borrows() {
        let pool = ConnectionPool::new(
            Endpoint::new("127.0.0.1", 1),
            PoolOptions {
                max_total: 1,
                max_idle: 1,
                borrow_timeout: Duration::from_millis(10),
                connect: ConnectOptions {
                    password: None,
                    timeout: Some(Duration::from_millis(10)),
                },
            },
        );
        pool.destroy();
        assert!(pool.is_closed());
        assert!(matches!(pool.borrow(), Err(ClientError::PoolClosed)));
        assert_eq!(pool.status().total, 0);
    }

    #[test]
    fn clones_share_the_pool() {
        let options = PoolOptions {
            max_total: 1,
            max_idle: 1,
            borrow_timeout: Duration::from_millis(10),
            connect: ConnectOptions {
                password: None,
                timeout: None,
            },
        };
        let a = ConnectionPool::new(Endpoint::new("127.0.0.1", 1), options.clone());
        let b = ConnectionPool::new(Endpoint::new("127.0.0.1", 1), options);
        assert!(a.same_pool(&a.clone()));
        assert!(!a.same_pool(&b));
        assert_ne!(a.id(), b.id());
    }
}
