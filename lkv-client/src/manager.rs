//! # Pool Manager
//!
//! Purpose: Keep the client able to reach one of several equivalent store
//! endpoints while individual endpoints fail.
//!
//! ## Design Principles
//! 1. **One Current, Many Spares**: Borrows go to the single current pool;
//!    the rest are warm spares bound to other endpoints.
//! 2. **Self-Healing**: A replenish task tops the spares back up from the
//!    endpoint directory; a liveness task health-checks the current pool and fails
//!    over to a spare when the check fails.
//! 3. **Short Critical Sections**: The pool-set mutex is never held across
//!    network IO or sleeps.
//! 4. **Explicit Ownership**: Built and shared through `Arc`; there is no
//!    process-wide instance.
//!
//! ## Structure Overview
//!
//! ```text
//! PoolManager
//!   ├── tasks: [lkv-replenish, lkv-liveness]
//!   └── inner: Arc<ManagerInner>
//!         ├── directory: Arc<EndpointDirectory>
//!         ├── stop: Arc<StopSignal>
//!         └── set: Mutex<PoolSet>
//!               ├── current: Option<ConnectionPool>
//!               └── spares: VecDeque<ConnectionPool>
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lkv_common::{Endpoint, Settings};
use parking_lot::Mutex;

use crate::connection::ConnectOptions;
use crate::directory::EndpointDirectory;
use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
use crate::task::{spawn_periodic, StopSignal};

/// Lower bound on the failover wait loop's sleep.
const MIN_FAILOVER_POLL: Duration = Duration::from_millis(10);

/// Tuning for the pool manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Number of pools kept warm (current plus spares).
    pub pool_count: usize,
    /// Options for every pool the manager creates.
    pub pool: PoolOptions,
    /// Period of the replenish and liveness tasks.
    pub check_interval: Duration,
    /// Sleep between rechecks while the liveness task waits for a spare.
    pub failover_poll: Duration,
}

impl ManagerOptions {
    /// Derives manager options from loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let timeout = settings.connection_timeout;
        ManagerOptions {
            pool_count: settings.pool_count.max(1),
            pool: PoolOptions {
                max_total: settings.pool_size,
                max_idle: settings.pool_size,
                borrow_timeout: timeout,
                connect: ConnectOptions {
                    password: settings.password.clone(),
                    timeout: Some(timeout),
                },
            },
            check_interval: settings.health_check_interval,
            failover_poll: timeout.min(settings.health_check_interval).max(MIN_FAILOVER_POLL),
        }
    }
}

struct PoolSet {
    current: Option<ConnectionPool>,
    spares: VecDeque<ConnectionPool>,
}

struct ManagerInner {
    directory: Arc<EndpointDirectory>,
    options: ManagerOptions,
    set: Mutex<PoolSet>,
    stop: Arc<StopSignal>,
}

/// Owns the pool set and its background maintenance threads.
pub struct PoolManager {
    inner: Arc<ManagerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolManager {
    /// Creates `pool_count` pools from the directory, makes the first one
    /// current, and starts the replenish and liveness tasks.
    pub fn new(directory: Arc<EndpointDirectory>, options: ManagerOptions) -> ClientResult<Self> {
        let mut spares = VecDeque::with_capacity(options.pool_count);
        for _ in 0..options.pool_count {
            match directory.next() {
                Some(endpoint) => spares.push_back(ConnectionPool::new(endpoint, options.pool.clone())),
                None => {
                    tracing::warn!("endpoint directory exhausted while building pools");
                    break;
                }
            }
        }
        let current = spares.pop_front();
        if let Some(pool) = &current {
            tracing::info!(pool = pool.id(), endpoint = %pool.endpoint(), spares = spares.len(), "pool manager started");
        }

        let inner = Arc::new(ManagerInner {
            directory,
            set: Mutex::new(PoolSet { current, spares }),
            stop: Arc::new(StopSignal::new()),
            options,
        });

        let manager = PoolManager {
            inner: Arc::clone(&inner),
            tasks: Mutex::new(Vec::with_capacity(2)),
        };

        let period = inner.options.check_interval;
        let replenisher = Arc::clone(&inner);
        let liveness = Arc::clone(&inner);
        // On spawn failure the manager drops here and stops what did start.
        let handles = vec![
            spawn_periodic("lkv-replenish", period, Arc::clone(&inner.stop), move || {
                replenisher.replenish()
            })?,
            spawn_periodic("lkv-liveness", period, Arc::clone(&inner.stop), move || {
                liveness.check_liveness()
            })?,
        ];
        manager.tasks.lock().extend(handles);
        Ok(manager)
    }

    /// Builds the directory and manager straight from settings.
    pub fn from_settings(settings: &Settings) -> ClientResult<Self> {
        let directory = EndpointDirectory::new(&settings.hosts, &settings.ports)?;
        Self::new(Arc::new(directory), ManagerOptions::from_settings(settings))
    }

    /// Borrows a connection from the current pool.
    ///
    /// Promotes a spare or lazily creates a pool when none is current. Fails
    /// with `PoolUnavailable` when no pool can be obtained because the
    /// directory is exhausted, and with `PoolExhausted` when the current pool
    /// stays at capacity for the whole borrow timeout.
    pub fn borrow(&self) -> ClientResult<PooledConnection> {
        let deadline = Instant::now() + self.inner.options.pool.borrow_timeout;
        loop {
            let pool = self.inner.current_pool()?;
            match pool.borrow() {
                // Destroyed between selection and borrow; pick again.
                Err(ClientError::PoolClosed) if Instant::now() < deadline => continue,
                Err(ClientError::PoolClosed) => return Err(ClientError::PoolUnavailable),
                Err(err) if err.poisons_connection() => {
                    // Could not connect; retire the pool so a retry lands elsewhere.
                    self.invalidate(pool.id());
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    /// Returns a connection to its originating pool.
    pub fn release(&self, conn: PooledConnection) {
        tracing::trace!(pool = conn.pool_id(), "connection released");
        drop(conn);
    }

    /// Drops the current pool so the next borrow starts from a fresh one.
    pub fn reset(&self) {
        let stale = self.inner.set.lock().current.take();
        if let Some(pool) = stale {
            tracing::warn!(pool = pool.id(), endpoint = %pool.endpoint(), "resetting current pool");
            pool.destroy();
        }
    }

    /// Like `reset`, but only when `pool_id` is still the current pool.
    ///
    /// Lets a caller report a failure without tearing down a replacement
    /// that another thread already installed.
    pub fn invalidate(&self, pool_id: u64) -> bool {
        let stale = {
            let mut set = self.inner.set.lock();
            match &set.current {
                Some(pool) if pool.id() == pool_id => set.current.take(),
                _ => None,
            }
        };
        match stale {
            Some(pool) => {
                tracing::warn!(pool = pool_id, endpoint = %pool.endpoint(), "invalidating current pool");
                pool.destroy();
                true
            }
            None => false,
        }
    }

    /// Stops the background tasks and destroys every pool. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.stop.stop() {
            return;
        }
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("pool manager task panicked");
            }
        }

        let pools: Vec<ConnectionPool> = {
            let mut set = self.inner.set.lock();
            let current = set.current.take();
            current.into_iter().chain(set.spares.drain(..)).collect()
        };
        for pool in &pools {
            pool.destroy();
        }
        tracing::info!(pools = pools.len(), "pool manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.stop.is_stopped()
    }

    pub fn directory(&self) -> &Arc<EndpointDirectory> {
        &self.inner.directory
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Snapshot of the pool set.
    pub fn status(&self) -> ManagerStatus {
        let set = self.inner.set.lock();
        ManagerStatus {
            current: set.current.as_ref().map(PoolSummary::of),
            spares: set.spares.iter().map(PoolSummary::of).collect(),
            shut_down: self.inner.stop.is_stopped(),
        }
    }

    /// Runs one replenish pass on the caller's thread.
    pub fn replenish_now(&self) {
        self.inner.replenish();
    }

    /// Runs one liveness pass on the caller's thread, including any wait
    /// for a spare after a failed health check.
    pub fn check_liveness_now(&self) {
        self.inner.check_liveness();
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ManagerInner {
    fn new_pool(&self, endpoint: Endpoint) -> ConnectionPool {
        ConnectionPool::new(endpoint, self.options.pool.clone())
    }

    /// Returns the current pool, promoting or creating one if needed.
    fn current_pool(&self) -> ClientResult<ConnectionPool> {
        if self.stop.is_stopped() {
            return Err(ClientError::Shutdown);
        }
        let mut set = self.set.lock();
        if let Some(pool) = &set.current {
            return Ok(pool.clone());
        }
        let pool = match set.spares.pop_front() {
            Some(pool) => pool,
            None => match self.directory.next() {
                Some(endpoint) => self.new_pool(endpoint),
                None => return Err(ClientError::PoolUnavailable),
            },
        };
        tracing::info!(pool = pool.id(), endpoint = %pool.endpoint(), "pool promoted on borrow");
        set.current = Some(pool.clone());
        Ok(pool)
    }

    /// Tops spares up to `pool_count - 1`, or `pool_count` with no current.
    fn replenish(&self) {
        let mut set = self.set.lock();
        let target = if set.current.is_some() {
            self.options.pool_count.saturating_sub(1)
        } else {
            self.options.pool_count
        };
        let mut added = 0;
        while set.spares.len() < target {
            match self.directory.next() {
                Some(endpoint) => {
                    set.spares.push_back(self.new_pool(endpoint));
                    added += 1;
                }
                None => {
                    // Try again next tick.
                    tracing::warn!(missing = target - set.spares.len(), "endpoint directory exhausted, replenish deferred");
                    break;
                }
            }
        }
        if added > 0 {
            tracing::debug!(added, spares = set.spares.len(), "spare pools replenished");
        }
    }

    /// Health-checks the current pool; on failure destroys it and waits for a spare.
    fn check_liveness(&self) {
        let current = self.set.lock().current.clone();
        if let Some(pool) = current {
            match pool.check_health() {
                Ok(()) => {
                    tracing::trace!(pool = pool.id(), "health check ok");
                    return;
                }
                // Busy is not dead.
                Err(ClientError::PoolExhausted) => return,
                Err(err) => {
                    tracing::error!(pool = pool.id(), endpoint = %pool.endpoint(), error = %err, "health check failed");
                    let mut set = self.set.lock();
                    if set.current.as_ref().is_some_and(|c| c.same_pool(&pool)) {
                        set.current = None;
                    }
                    drop(set);
                    pool.destroy();
                }
            }
        }
        self.await_failover();
    }

    /// Blocks this task until some pool is current, promoting a spare as soon
    /// as one exists. The set lock is released while sleeping.
    fn await_failover(&self) {
        loop {
            {
                let mut set = self.set.lock();
                if set.current.is_some() {
                    return;
                }
                if let Some(pool) = set.spares.pop_front() {
                    tracing::info!(pool = pool.id(), endpoint = %pool.endpoint(), "failed over to spare pool");
                    set.current = Some(pool);
                    return;
                }
            }
            tracing::debug!("no spare pools left, waiting for replenishment");
            if self.stop.sleep(self.options.failover_poll) {
                return;
            }
        }
    }
}

/// Snapshot of the pool set.
#[derive(Debug, Clone)]
pub struct ManagerStatus {
    /// Pool serving borrows, if any.
    pub current: Option<PoolSummary>,
    /// Warm spares in promotion order.
    pub spares: Vec<PoolSummary>,
    pub shut_down: bool,
}

/// Identity and occupancy of one pool.
#[derive(Debug, Clone)]
pub struct PoolSummary {
    pub id: u64,
    pub endpoint: Endpoint,
    pub status: PoolStatus,
}

impl PoolSummary {
    fn of(pool: &ConnectionPool) -> Self {
        PoolSummary {
            id: pool.id(),
            endpoint: pool.endpoint().clone(),
            status: pool.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pool_count: usize) -> ManagerOptions {
        ManagerOptions {
            pool_count,
            pool: PoolOptions {
                max_total: 2,
                max_idle: 2,
                borrow_timeout: Duration::from_millis(50),
                connect: ConnectOptions {
                    password: None,
                    timeout: Some(Duration::from_millis(50)),
                },
            },
            // Keep the background tasks out of the way of these tests.
            check_interval: Duration::from_secs(3600),
            failover_poll: Duration::from_millis(10),
        }
    }

    fn directory(ports: &[u16]) -> Arc<EndpointDirectory> {
        let endpoints = ports.iter().map(|p| Endpoint::new("127.0.0.1", *p)).collect();
        Arc::new(EndpointDirectory::from_endpoints(endpoints).unwrap())
    }

    fn endpoint_port(summary: &Option<PoolSummary>) -> Option<u16> {
        summary.as_ref().map(|s| s.endpoint.port())
    }

    #[test]
    fn builds_current_and_spares_in_rotation() {
        let manager = PoolManager::new(directory(&[1, 2, 3]), options(3)).unwrap();
        let status = manager.status();
        assert_eq!(endpoint_port(&status.current), Some(1));
        let spares: Vec<u16> = status.spares.iter().map(|s| s.endpoint.port()).collect();
        assert_eq!(spares, vec![2, 3]);
    }

    #[test]
    fn reset_promotes_spare_on_next_use() {
        let manager = PoolManager::new(directory(&[1, 2]), options(2)).unwrap();
        manager.reset();
        assert!(manager.status().current.is_none());

        let pool = manager.inner.current_pool().unwrap();
        assert_eq!(pool.endpoint().port(), 2);
        assert!(manager.status().spares.is_empty());
    }

    #[test]
    fn replenish_restores_spare_count() {
        let manager = PoolManager::new(directory(&[1, 2, 3]), options(2)).unwrap();
        manager.reset();
        manager.inner.current_pool().unwrap();
        assert!(manager.status().spares.is_empty());

        manager.replenish_now();
        let status = manager.status();
        assert_eq!(status.spares.len(), 1);
        // Rotation continues where construction left off.
        assert_eq!(status.spares[0].endpoint.port(), 3);
    }

    #[test]
    fn replenish_without_current_fills_whole_set() {
        let manager = PoolManager::new(directory(&[1, 2]), options(2)).unwrap();
        manager.reset();
        manager.inner.set.lock().spares.clear();
        manager.replenish_now();
        assert_eq!(manager.status().spares.len(), 2);
    }

    #[test]
    fn exhausted_directory_defers_replenish_and_fails_borrow() {
        let manager = PoolManager::new(directory(&[1]), options(2)).unwrap();
        manager.directory().clear();
        manager.replenish_now();
        assert!(manager.status().spares.len() <= 1);

        manager.reset();
        manager.inner.set.lock().spares.clear();
        assert!(matches!(manager.borrow(), Err(ClientError::PoolUnavailable)));
    }

    #[test]
    fn invalidate_ignores_stale_pool_ids() {
        let manager = PoolManager::new(directory(&[1, 2]), options(2)).unwrap();
        let current = manager.status().current.unwrap().id;
        assert!(!manager.invalidate(current + 1000));
        assert!(manager.status().current.is_some());
        assert!(manager.invalidate(current));
        assert!(manager.status().current.is_none());
    }

    #[test]
    fn failed_health_check_fails_over_to_spare() {
        // Nothing listens on these ports, so the health check fails.
        let manager = PoolManager::new(directory(&[1, 2]), options(2)).unwrap();
        manager.check_liveness_now();
        let status = manager.status();
        assert_eq!(endpoint_port(&status.current), Some(2));
        assert!(status.spares.is_empty());
    }

    #[test]
    fn connect_failure_retires_current_pool() {
        let manager = PoolManager::new(directory(&[1, 2]), options(2)).unwrap();
        assert!(matches!(manager.borrow(), Err(ClientError::Io(_))));
        assert_eq!(endpoint_port(&manager.status().current), None);
        assert!(matches!(manager.borrow(), Err(ClientError::Io(_))));
        assert!(manager.status().spares.is_empty());
    }

    #[test]
    fn shutdown_is_idempotent_and_refuses_borrows() {
        let manager = PoolManager::new(directory(&[1, 2]), options(2)).unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shut_down());
        let status = manager.status();
        assert!(status.current.is_none() && status.spares.is_empty());
        assert!(matches!(manager.borrow(), Err(ClientError::Shutdown)));
    }
}
