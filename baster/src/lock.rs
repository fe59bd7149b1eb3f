//! Distributed issuance lock
//!
//! One lease per hostname, stored in the `Lock` namespace of the shared
//! key-value store. A lease older than the staleness threshold belongs to a
//! crashed holder and is reclaimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::store::{KvStore, Namespaced, KIND_LOCK};

/// Default wait between attempts on a held lock
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default age after which a lock is considered abandoned
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Lock record as persisted in the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub hostname: String,
    pub acquired: DateTime<Utc>,
}

/// Mutual exclusion across proxy replicas, keyed by hostname
#[derive(Clone)]
pub struct DistributedLock {
    store: Namespaced,
    retry_interval: Duration,
    stale_after: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_timing(store, DEFAULT_RETRY_INTERVAL, DEFAULT_STALE_AFTER)
    }

    pub fn with_timing(
        store: Arc<dyn KvStore>,
        retry_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            store: Namespaced::new(store, KIND_LOCK),
            retry_interval,
            stale_after,
        }
    }

    /// Block until the lock for `hostname` is held by this caller.
    ///
    /// Waits without bound while another holder keeps a fresh lease. Store
    /// errors abort the wait.
    pub async fn acquire(&self, hostname: &str) -> Result<()> {
        loop {
            match self.store.get(hostname).await? {
                None => {
                    let record = LockRecord {
                        hostname: hostname.to_string(),
                        acquired: Utc::now(),
                    };
                    let bytes = serde_json::to_vec(&record)?;
                    if self.store.put_if_absent(hostname, &bytes).await? {
                        info!(hostname, "Lock acquired");
                        return Ok(());
                    }
                    debug!(hostname, "Lost lock creation race");
                }
                Some(bytes) => {
                    if self.is_stale(&bytes) {
                        // Only the record we judged stale; a fresh lease
                        // written meanwhile by another replica survives
                        if self.store.delete_if_eq(hostname, &bytes).await? {
                            error!(hostname, "Reclaimed stale lock");
                        } else {
                            debug!(hostname, "Stale lock already reclaimed elsewhere");
                        }
                        continue;
                    }
                    debug!(
                        hostname,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lock held elsewhere, waiting"
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Release the lock unconditionally
    pub async fn release(&self, hostname: &str) -> Result<()> {
        self.store.delete(hostname).await?;
        info!(hostname, "Lock released");
        Ok(())
    }

    fn is_stale(&self, bytes: &[u8]) -> bool {
        let Ok(record) = serde_json::from_slice::<LockRecord>(bytes) else {
            return true;
        };
        let age = Utc::now().signed_duration_since(record.acquired);
        match age.to_std() {
            Ok(age) => age > self.stale_after,
            // Timestamp in the future: clock skew between replicas
            Err(_) => false,
        }
    }
}
