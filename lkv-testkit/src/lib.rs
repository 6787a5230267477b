//! # lkv Test Kit
//!
//! Purpose: Run a small Redis-compatible server in-process so the client's
//! pooling, failover, batching, and locking can be exercised without an
//! external store.
//!
//! ## Design Principles
//! 1. **Real Sockets**: Clients talk RESP2 over loopback TCP, exactly as they
//!    would to a real store.
//! 2. **Shared Data, Separate Endpoints**: Several servers can share one
//!    `MemoryStore` and stand in for replicas; stopping one closes its
//!    listener and every connection it accepted.
//! 3. **Own Runtime**: Each server drives a tokio runtime on its own thread,
//!    so blocking client code in tests needs no async context.

mod protocol;
mod server;
mod store;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use lkv_common::Endpoint;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub use protocol::{RespError, RespParser};
pub use store::{MemoryStore, StoreError, StoreResult, TtlStatus};

use server::{handle_connection, Session};

/// Options for a test server.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Require `AUTH` with this password before other commands.
    pub password: Option<String>,
}

/// A running in-process server bound to an ephemeral loopback port.
pub struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    shutdown: Option<watch::Sender<bool>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Starts a server with a private store.
    pub fn start() -> io::Result<Self> {
        Self::start_with(Arc::new(MemoryStore::new()), ServerOptions::default())
    }

    /// Starts a server over `store`, which other servers may share.
    pub fn start_shared(store: Arc<MemoryStore>) -> io::Result<Self> {
        Self::start_with(store, ServerOptions::default())
    }

    pub fn start_with(store: Arc<MemoryStore>, options: ServerOptions) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0"))?;
        let addr = listener.local_addr()?;
        let (shutdown, signal) = watch::channel(false);

        let served = Arc::clone(&store);
        let password: Option<Arc<str>> = options.password.map(Arc::from);
        let thread = std::thread::Builder::new()
            .name(format!("lkv-testkit-{}", addr.port()))
            .spawn(move || {
                runtime.block_on(serve(listener, served, password, signal));
                // Dropping the runtime cancels every connection task.
                drop(runtime);
            })?;

        tracing::debug!(%addr, "test server started");
        Ok(TestServer {
            addr,
            store,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Endpoint clients should connect to.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Closes the listener and all open connections. Idempotent.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(addr = %self.addr, "test server thread panicked");
            }
            tracing::debug!(addr = %self.addr, "test server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listener: TcpListener,
    store: Arc<MemoryStore>,
    password: Option<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let store = Arc::clone(&store);
                    let session = Session::new(password.clone());
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, store, session).await {
                            tracing::trace!(%peer, error = %err, "test connection closed with error");
                        }
                    });
                }
                Err(err) => tracing::warn!(error = %err, "test server accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}
