//! Routing configuration watcher
//!
//! Polls a [`ConfigSource`] and publishes a new [`RoutingTable`] whenever its
//! version changes. A version that fails to parse or validate is skipped and
//! the previous table keeps serving.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::routing::{RoutingTable, SharedRouting};
use crate::settings::Settings;
use crate::source::ConfigSource;

/// Default wait between bootstrap attempts
pub const DEFAULT_BOOTSTRAP_RETRY: Duration = Duration::from_secs(15);

/// Default poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct ConfigWatcher {
    source: Arc<dyn ConfigSource>,
    routing: SharedRouting,
    poll_interval: Duration,
    bootstrap_retry: Duration,
    last_version: Option<String>,
}

impl ConfigWatcher {
    pub fn new(source: Arc<dyn ConfigSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            routing: Arc::new(ArcSwap::from_pointee(RoutingTable::empty())),
            poll_interval,
            bootstrap_retry: DEFAULT_BOOTSTRAP_RETRY,
            last_version: None,
        }
    }

    pub fn with_bootstrap_retry(mut self, retry: Duration) -> Self {
        self.bootstrap_retry = retry;
        self
    }

    /// Handle to the published table
    pub fn routing(&self) -> SharedRouting {
        self.routing.clone()
    }

    /// Load the first table, retrying until it succeeds.
    ///
    /// Returns the settings it was built from so the caller can configure
    /// ACME from them.
    pub async fn bootstrap(&mut self) -> Settings {
        loop {
            match self.load().await {
                Ok(settings) => return settings,
                Err(e) => {
                    error!(
                        error = %e,
                        retry_secs = self.bootstrap_retry.as_secs(),
                        "Cannot load routing configuration"
                    );
                    tokio::time::sleep(self.bootstrap_retry).await;
                }
            }
        }
    }

    /// Check the source once and reload on a new version.
    ///
    /// Returns whether a new table was published.
    pub async fn poll(&mut self) -> Result<bool> {
        let version = self.source.current_version().await?;
        if self.last_version.as_deref() == Some(version.as_str()) {
            debug!(version = %version, "Configuration unchanged");
            return Ok(false);
        }

        info!(version = %version, "Configuration changed, reloading");
        // Recorded first so a broken version is not retried every poll
        self.last_version = Some(version);

        match self.load().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "Rejected configuration, keeping the current routing table");
                Ok(false)
            }
        }
    }

    /// Poll forever
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = self.poll().await {
                error!(error = %e, "Configuration poll failed");
            }
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn load(&mut self) -> Result<Settings> {
        let (text, version) = self.source.fetch().await?;
        self.last_version = Some(version.clone());

        let settings = Settings::parse(&text)?;
        let table = RoutingTable::build(&settings, &version)?;
        info!(version = %version, domains = table.len(), "Routing table published");
        self.routing.store(Arc::new(table));
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory source whose document can be swapped by the test
    struct StaticSource {
        doc: Mutex<(String, String)>,
    }

    impl StaticSource {
        fn new(text: &str, version: &str) -> Arc<Self> {
            Arc::new(Self {
                doc: Mutex::new((text.to_string(), version.to_string())),
            })
        }

        fn set(&self, text: &str, version: &str) {
            *self.doc.lock().unwrap() = (text.to_string(), version.to_string());
        }
    }

    #[async_trait]
    impl ConfigSource for StaticSource {
        async fn current_version(&self) -> Result<String> {
            Ok(self.doc.lock().unwrap().1.clone())
        }

        async fn fetch(&self) -> Result<(String, String)> {
            Ok(self.doc.lock().unwrap().clone())
        }
    }

    fn doc(hostname: &str) -> String {
        format!(
            "[acme]\nemail = \"admin@example.com\"\n\n[domains.a]\nhostname = \"{}\"\nservice = \"a:80\"\n",
            hostname
        )
    }

    #[tokio::test]
    async fn test_bootstrap_and_reload() {
        let source = StaticSource::new(&doc("a.example.com"), "1");
        let mut watcher = ConfigWatcher::new(source.clone(), DEFAULT_POLL_INTERVAL);
        let routing = watcher.routing();

        watcher.bootstrap().await;
        assert_eq!(routing.load().version, "1");
        assert!(routing.load().lookup("a.example.com").is_some());

        assert!(!watcher.poll().await.unwrap());

        source.set(&doc("b.example.com"), "2");
        assert!(watcher.poll().await.unwrap());
        let table = routing.load_full();
        assert_eq!(table.version, "2");
        assert!(table.lookup("a.example.com").is_none());
        assert!(table.lookup("b.example.com").is_some());
    }

    #[tokio::test]
    async fn test_broken_version_keeps_previous_table() {
        let source = StaticSource::new(&doc("a.example.com"), "1");
        let mut watcher = ConfigWatcher::new(source.clone(), DEFAULT_POLL_INTERVAL);
        let routing = watcher.routing();
        watcher.bootstrap().await;

        // Missing acme email
        source.set("[domains.a]\nhostname = \"x\"\nservice = \"x:80\"\n", "2");
        assert!(!watcher.poll().await.unwrap());
        assert_eq!(routing.load().version, "1");

        // Same broken version is not fetched again
        assert!(!watcher.poll().await.unwrap());

        source.set(&doc("c.example.com"), "3");
        assert!(watcher.poll().await.unwrap());
        assert_eq!(routing.load().version, "3");
    }

    #[tokio::test]
    async fn test_bootstrap_retries() {
        let source = StaticSource::new("not toml [[[", "1");
        let mut watcher = ConfigWatcher::new(source.clone(), DEFAULT_POLL_INTERVAL)
            .with_bootstrap_retry(Duration::from_millis(10));
        let routing = watcher.routing();

        let fixer = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                source.set(&doc("a.example.com"), "2");
            })
        };

        let settings = tokio::time::timeout(Duration::from_secs(2), watcher.bootstrap())
            .await
            .unwrap();
        fixer.await.unwrap();
        assert_eq!(settings.acme.email, "admin@example.com");
        assert_eq!(routing.load().version, "2");
    }
}
