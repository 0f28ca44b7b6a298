//! Key-value store facade for the coderun orchestrator.
//!
//! One command surface over three deployment shapes of a Redis-compatible
//! store: standalone, sharded (cluster) and sentinel-supervised HA. Every
//! key is transparently prefixed with a configurable namespace, and the
//! pipeline is an ordered batch without cross-key transactional semantics
//! so that sharded deployments never reject cross-slot writes.

pub mod client;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use client::{KvClient, KvCommands, Pipeline};
pub use config::{KvConfig, KvMode, KvTlsConfig};
pub use error::{Error, Result};
