//! In-process store used for local mode and tests

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::KvStore;
use crate::error::Result;

/// Map-backed store. Shares nothing across processes.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        debug!(key, store = "memory", "get key");
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        debug!(key, store = "memory", "put key");
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        debug!(key, store = "memory", "create key");
        entries.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!(key, store = "memory", "delete key");
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.get(key).map(Vec::as_slice) != Some(expected) {
            return Ok(false);
        }
        debug!(key, store = "memory", "compare and delete key");
        entries.remove(key);
        Ok(true)
    }
}
