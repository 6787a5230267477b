//! # Distributed Lock
//!
//! Purpose: Mutual exclusion across processes through a single store key.
//!
//! ## Design Principles
//! 1. **Atomic Claim**: `SET key owner NX` with an expiry, so a key never
//!    exists without a TTL and a crashed holder frees the lock on its own.
//! 2. **Owner Identity**: The value stored under the key is the owner id;
//!    re-acquiring with the same id succeeds, releasing with another id is a
//!    no-op.
//! 3. **Monotonic Waits**: Acquire timeouts are measured with `Instant`.
//! 4. **Cancellable Renewal**: A fixed lock gets a renewal thread that checks
//!    it still owns the key before each extension and stops on release, on
//!    lost ownership, or when the lock handle is dropped.
//!
//! ## Acquire Loop
//!
//! ```text
//! SET NX ──ok──> held ──fixed?──> start renewal
//!   │ exists
//!   v
//! GET == owner ──yes──> held (re-entrant)
//!   │ no
//!   v
//! timed out? ──yes──> false
//!   │ no
//!   └── sleep poll interval, retry
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lkv_common::Settings;
use parking_lot::Mutex;

use crate::client::KVClient;
use crate::error::{ClientError, ClientResult};
use crate::task::{spawn_periodic, StopSignal};

/// Timing for one lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Expiry put on the key by acquire and by each renewal.
    pub ttl: Duration,
    /// Sleep between acquire attempts while contended.
    pub poll_interval: Duration,
    /// Period of the renewal thread for fixed locks; below `ttl`.
    pub renew_interval: Duration,
}

impl LockOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        LockOptions {
            ttl: settings.lock_ttl,
            poll_interval: settings.lock_poll_interval,
            renew_interval: settings.lock_renew_interval,
        }
    }

    /// Rejects timings under which a fixed lock could lapse between renewals.
    pub fn validate(&self) -> ClientResult<()> {
        if self.ttl.as_millis() == 0 {
            return Err(ClientError::InvalidArgument("lock ttl below one millisecond"));
        }
        if self.poll_interval.is_zero() {
            return Err(ClientError::InvalidArgument("lock poll interval is zero"));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.ttl {
            return Err(ClientError::InvalidArgument("lock renew interval must be non-zero and below the ttl"));
        }
        Ok(())
    }
}

struct Renewal {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Renewal {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Renewal {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("lock renewal thread panicked");
            }
        }
    }
}

/// Lock over one key, shared by any number of owners.
pub struct DistributedLock {
    client: KVClient,
    key: String,
    options: LockOptions,
    renewals: Mutex<HashMap<String, Renewal>>,
}

impl DistributedLock {
    /// Binds a lock to `key`.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty key or for options that fail
    /// `LockOptions::validate`.
    pub fn new(client: KVClient, key: impl Into<String>, options: LockOptions) -> ClientResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(ClientError::InvalidArgument("empty lock key"));
        }
        options.validate()?;
        Ok(DistributedLock {
            client,
            key,
            options,
            renewals: Mutex::new(HashMap::new()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Tries to take the lock for `owner` until `timeout` elapses.
    ///
    /// A zero `timeout` waits indefinitely. With `fixed`, a renewal thread
    /// keeps extending the key until `release`. Returns `Ok(false)` on
    /// timeout; store failures that persist past the client's retries and
    /// are not transient come back as `ClientError::Lock`.
    pub fn acquire(&self, owner: &str, fixed: bool, timeout: Duration) -> ClientResult<bool> {
        if owner.is_empty() {
            return Err(ClientError::InvalidArgument("empty lock owner"));
        }
        let started = Instant::now();
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            match self.try_claim(owner) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) if err.is_transient() => {
                    tracing::warn!(key = %self.key, owner, error = %err, "lock attempt failed, will retry");
                }
                Err(err) => {
                    return Err(ClientError::Lock {
                        key: self.key.clone(),
                        reason: err.to_string(),
                    })
                }
            }
            if !timeout.is_zero() && started.elapsed() >= timeout {
                tracing::debug!(key = %self.key, owner, attempts, "lock acquire timed out");
                return Ok(false);
            }
            std::thread::sleep(self.options.poll_interval);
        }

        if fixed {
            self.start_renewal(owner)?;
        }
        tracing::info!(key = %self.key, owner, fixed, attempts, "lock acquired");
        Ok(true)
    }

    /// Releases the lock if `owner` holds it and stops any renewal.
    ///
    /// Releasing a lock held by someone else, or not held at all, leaves the
    /// key untouched.
    pub fn release(&self, owner: &str) -> ClientResult<()> {
        // Stop renewing first so the key cannot be extended after deletion.
        let renewal = self.renewals.lock().remove(owner);
        drop(renewal);

        let key = self.key.as_bytes();
        match self.client.get(key)? {
            Some(holder) if holder == owner.as_bytes() => {
                self.client.delete(key)?;
                tracing::info!(key = %self.key, owner, "lock released");
            }
            Some(_) => tracing::debug!(key = %self.key, owner, "release ignored, held by another owner"),
            None => tracing::debug!(key = %self.key, owner, "release ignored, lock not held"),
        }
        Ok(())
    }

    /// True while a renewal thread for `owner` is alive.
    pub fn is_renewing(&self, owner: &str) -> bool {
        self.renewals.lock().get(owner).is_some_and(Renewal::is_running)
    }

    /// One claim attempt: fresh claim or already held by `owner`.
    fn try_claim(&self, owner: &str) -> ClientResult<bool> {
        let key = self.key.as_bytes();
        if self.client.set_if_absent(key, owner.as_bytes(), self.options.ttl)? {
            return Ok(true);
        }
        match self.client.get(key)? {
            Some(holder) if holder == owner.as_bytes() => {
                tracing::trace!(key = %self.key, owner, "lock already held by owner");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn start_renewal(&self, owner: &str) -> ClientResult<()> {
        let mut renewals = self.renewals.lock();
        if renewals.get(owner).is_some_and(Renewal::is_running) {
            return Ok(());
        }

        let stop = Arc::new(StopSignal::new());
        let client = self.client.clone();
        let key = self.key.clone();
        let holder = owner.to_string();
        let ttl = self.options.ttl;
        let signal = Arc::clone(&stop);
        let handle = spawn_periodic("lkv-lock-renew", self.options.renew_interval, Arc::clone(&stop), move || {
            renew_once(&client, &key, &holder, ttl, &signal)
        })?;
        // Replacing a finished renewal joins it on drop.
        renewals.insert(
            owner.to_string(),
            Renewal {
                stop,
                handle: Some(handle),
            },
        );
        tracing::debug!(key = %self.key, owner, "lock renewal started");
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        let renewals = std::mem::take(&mut *self.renewals.lock());
        if !renewals.is_empty() {
            tracing::debug!(key = %self.key, count = renewals.len(), "stopping lock renewals");
        }
    }
}

/// Extends `key` if `owner` still holds it; stops the renewal otherwise.
fn renew_once(client: &KVClient, key: &str, owner: &str, ttl: Duration, stop: &StopSignal) {
    let bytes = key.as_bytes();
    match client.get(bytes) {
        Ok(Some(holder)) if holder == owner.as_bytes() => match client.expire(bytes, ttl) {
            Ok(true) => tracing::trace!(key, owner, "lock renewed"),
            Ok(false) => {
                tracing::warn!(key, owner, "lock expired before renewal, stopping");
                stop.stop();
            }
            Err(err) => tracing::warn!(key, owner, error = %err, "lock renewal failed"),
        },
        Ok(_) => {
            tracing::warn!(key, owner, "lock ownership lost, stopping renewal");
            stop.stop();
        }
        Err(err) => tracing::warn!(key, owner, error = %err, "lock renewal check failed"),
    }
}
