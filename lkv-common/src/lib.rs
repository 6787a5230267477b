// lkv-common - Shared types for LeaseKV
//
// This crate defines the endpoint value type and the startup configuration
// surface consumed by the client, the test store, and the CLI.

pub mod config;
pub mod endpoint;
pub mod error;

// Re-export for convenience
pub use config::*;
pub use endpoint::*;
pub use error::*;
