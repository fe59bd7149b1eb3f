//! Redis-backed store shared by every proxy replica

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::KvStore;
use crate::error::{ProxyError, Result};

/// Deletes KEYS[1] only while it holds ARGV[1]
const DELETE_IF_EQ: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Store backed by a Redis server.
///
/// Keys are written as `<prefix>:<key>`; every call is bounded by `timeout`.
pub struct RedisStore {
    /// Connection manager (handles reconnection)
    connection: ConnectionManager,
    prefix: String,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis. Fails fast if the server is unreachable.
    pub async fn connect(url: &str, prefix: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| ProxyError::store("connect", url, e))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| ProxyError::store("connect", url, e))?;

        info!(prefix, timeout_ms = timeout.as_millis() as u64, "Redis store connected");

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            timeout,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn bounded<T, F>(&self, operation: &'static str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ProxyError::store(operation, key, e)),
            Err(_) => Err(ProxyError::store(operation, key, "operation timed out")),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        debug!(key, store = "redis", "get key");
        let mut conn = self.connection.clone();
        let full_key = self.key(key);
        self.bounded("get", key, conn.get::<_, Option<Vec<u8>>>(&full_key))
            .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        debug!(key, store = "redis", "put key");
        let mut conn = self.connection.clone();
        let full_key = self.key(key);
        self.bounded("put", key, conn.set::<_, _, ()>(&full_key, value))
            .await
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        debug!(key, store = "redis", "create key");
        let mut conn = self.connection.clone();
        let full_key = self.key(key);
        self.bounded("put_if_absent", key, conn.set_nx::<_, _, bool>(&full_key, value))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!(key, store = "redis", "delete key");
        let mut conn = self.connection.clone();
        let full_key = self.key(key);
        self.bounded("delete", key, conn.del::<_, ()>(&full_key))
            .await
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        debug!(key, store = "redis", "compare and delete key");
        let mut conn = self.connection.clone();
        let full_key = self.key(key);
        let script = redis::Script::new(DELETE_IF_EQ);
        let deleted: i64 = self
            .bounded(
                "delete_if_eq",
                key,
                script.key(&full_key).arg(expected).invoke_async(&mut conn),
            )
            .await?;
        Ok(deleted == 1)
    }
}
