//! sealkv
//!
//! HA-aware storage layer for a secrets platform, backed by Consul.
//! Provides durable key-value storage over Consul's KV API, bounded
//! request concurrency, and a service-discovery synchronizer that keeps
//! each node's registration (leadership role tag + sealed-state health)
//! current with the local agent.
//!
//! An in-memory backend implementing the same storage contract is
//! included for tests and embedded use.

pub mod config;
pub mod consul;
pub mod error;
pub mod mem;
pub mod permit;
pub mod redirect;
pub mod storage;

pub use config::{parse_duration, ConsulConfig};
pub use consul::{compute_tags, ConsulBackend, StateProbe};
pub use error::{Error, Result};
pub use mem::MemBackend;
pub use permit::PermitPool;
pub use redirect::RedirectAddress;
pub use storage::{Entry, StorageBackend};
