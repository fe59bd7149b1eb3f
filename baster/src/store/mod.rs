//! Key-value store abstraction
//!
//! Backs both the ACME cache (account credentials, certificate bundles,
//! challenge tokens) and the distributed issuance locks. A missing key is
//! reported as `Ok(None)` so callers can branch on it; every other failure
//! is a [`ProxyError::Store`](crate::error::ProxyError::Store).

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Namespace for ACME cache entries
pub const KIND_CACHE: &str = "Cache";
/// Namespace for issuance locks
pub const KIND_LOCK: &str = "Lock";

/// Remote key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value, `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Write a value only if the key does not exist yet.
    ///
    /// Returns `false` when another writer got there first.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool>;

    /// Delete a value. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete a value only if it still equals `expected`.
    ///
    /// Returns `false` when the key is missing or holds something else.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool>;
}

/// A view of a store restricted to one entity kind.
///
/// Keys are stored as `<kind>/<key>` so locks and cache entries for the
/// same hostname never collide.
#[derive(Clone)]
pub struct Namespaced {
    inner: Arc<dyn KvStore>,
    kind: &'static str,
}

impl Namespaced {
    pub fn new(inner: Arc<dyn KvStore>, kind: &'static str) -> Self {
        Self { inner, kind }
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{}", self.kind, key)
    }
}

#[async_trait]
impl KvStore for Namespaced {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.key(key)).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.put(&self.key(key), value).await
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.inner.put_if_absent(&self.key(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.key(key)).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.inner.delete_if_eq(&self.key(key), expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let backing: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let cache = Namespaced::new(backing.clone(), KIND_CACHE);
        let locks = Namespaced::new(backing.clone(), KIND_LOCK);

        cache.put("a.example.com", b"bundle").await.unwrap();
        assert_eq!(locks.get("a.example.com").await.unwrap(), None);
        assert_eq!(
            backing.get("Cache/a.example.com").await.unwrap(),
            Some(b"bundle".to_vec())
        );
    }
}
