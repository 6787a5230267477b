//! # lkv Client Library
//!
//! Purpose: Provide a blocking client for a pool of equivalent Redis-compatible
//! endpoints, with failover, batched writes, and a distributed lock on top.
//!
//! ## Design Principles
//! 1. **Explicit Sharing**: Managers and clients are built by the caller and
//!    shared through `Arc`; nothing is process-global.
//! 2. **RAII Connections**: Borrowed connections return to their pool on drop.
//! 3. **Background Healing**: Spare pools and liveness checks run on threads
//!    owned by the pool manager and stop when it shuts down.
//! 4. **Typed Errors**: One `ClientError` classifies failures as transient or
//!    not, which drives retry and failover.
//!
//! ## Layers
//!
//! ```text
//! DistributedLock / Batch
//!         │
//!      KVClient ── retry + backoff
//!         │
//!    PoolManager ── replenish / liveness threads
//!         │
//!  ConnectionPool (one endpoint) ── EndpointDirectory (rotation)
//!         │
//!     Connection ── RESP2 framing
//! ```

mod batch;
mod client;
mod collections;
mod connection;
mod directory;
mod error;
mod lock;
mod manager;
mod pool;
mod resp;
mod task;

pub use batch::Batch;
pub use client::{ClientOptions, KVClient, KeyTtl, Mutate, RetryPolicy};
pub use collections::GLOBAL_COUNTER_KEY;
pub use connection::{ConnectOptions, Connection};
pub use directory::EndpointDirectory;
pub use error::{ClientError, ClientResult};
pub use lock::{DistributedLock, LockOptions};
pub use manager::{ManagerOptions, ManagerStatus, PoolManager, PoolSummary};
pub use pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
pub use resp::{Command, RespValue};

pub use lkv_common::{Endpoint, Settings};
