//! In-Memory Backend
//!
//! `StorageBackend` over a concurrent map. Used by the conformance test
//! suite and for embedded/dev deployments where durability is not needed.

use crate::error::Result;
use crate::storage::{Entry, StorageBackend};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;

/// Non-durable in-memory storage backend.
#[derive(Default)]
pub struct MemBackend {
    entries: DashMap<String, Vec<u8>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemBackend {
    async fn put(&self, entry: &Entry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry.value.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        Ok(self
            .entries
            .get(key)
            .map(|v| Entry::new(key, v.value().clone())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // BTreeSet gives deduplication of folder entries and stable order.
        let mut children = BTreeSet::new();
        for item in self.entries.iter() {
            if let Some(rest) = item.key().strip_prefix(prefix) {
                if rest.is_empty() {
                    continue;
                }
                match rest.find('/') {
                    Some(idx) => children.insert(rest[..=idx].to_string()),
                    None => children.insert(rest.to_string()),
                };
            }
        }
        Ok(children.into_iter().collect())
    }
}
