//! Storage Contract
//!
//! Defines the byte-value storage surface consumed by the secret-engine
//! layer. Implementations may keep data in memory or in an external
//! coordination service; callers always work with prefix-relative keys.

use crate::error::Result;
use async_trait::async_trait;

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Durable key-value storage over a flat namespace of byte values.
///
/// This is an outbound port: the engine layer issues operations against it
/// without knowing whether the backing store is remote. Implementations
/// must be safely callable from many tasks concurrently.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store an entry, overwriting any existing value at its key.
    async fn put(&self, entry: &Entry) -> Result<()>;

    /// Fetch an entry. A missing key is `Ok(None)`, never an error.
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Delete a key. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the immediate children under a prefix, directory-style:
    /// `"foo"` for a leaf entry, `"foo/"` for a sub-tree. An empty result
    /// is an empty vector, never an error.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
