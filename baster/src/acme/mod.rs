//! Automatic certificate management
//!
//! [`AcmeManager`] owns the certificate lifecycle for every hostname in the
//! routing table:
//!
//! - issuance through an ACME directory, serialized across replicas by the
//!   [`DistributedLock`] and within a replica by a per-hostname guard
//! - HTTP-01 challenge responses published in the shared cache so any replica
//!   can answer the validation request
//! - certificate lookup during the TLS handshake
//! - background renewal of certificates close to expiry
//!
//! The ACME protocol itself sits behind [`AcmeDirectory`] / [`AcmeOrder`];
//! [`client::LetsEncrypt`] is the production implementation.

use async_trait::async_trait;
use chrono::Utc;
use rcgen::KeyPair;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::certs::{self, Bundle, Leaf};
use crate::challenge::token_key;
use crate::error::{ProxyError, Result};
use crate::lock::DistributedLock;
use crate::routing::SharedRouting;
use crate::store::{KvStore, Namespaced, KIND_CACHE};

pub mod client;

pub use self::client::LetsEncrypt;

/// Cache key of the ACME account credentials
pub const ACCOUNT_KEY: &str = "acme_account.key";

/// Coarse order state, as far as issuance is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderProgress {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// An HTTP-01 challenge to publish before asking for validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http01Challenge {
    pub token: String,
    pub key_authorization: String,
    pub url: String,
}

/// Entry point of an ACME server, bound to an account
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    /// Open a new order for a single hostname
    async fn new_order(&self, hostname: &str) -> Result<Box<dyn AcmeOrder>>;
}

/// One certificate order
#[async_trait]
pub trait AcmeOrder: Send {
    /// Refresh and report the order state
    async fn status(&mut self) -> Result<OrderProgress>;

    /// HTTP-01 challenges of the pending authorizations.
    ///
    /// Fails with [`ProxyError::NoHttp01Challenge`] when an authorization
    /// offers no HTTP-01 challenge.
    async fn http01_challenges(&mut self) -> Result<Vec<Http01Challenge>>;

    /// Tell the server the challenge response is in place
    async fn set_ready(&mut self, challenge: &Http01Challenge) -> Result<()>;

    /// Finalize with a CSR for `hostname` signed by `key` and return the
    /// issued chain as PEM
    async fn issue(&mut self, hostname: &str, key: &KeyPair) -> Result<String>;
}

/// Where certificates come from
#[derive(Clone)]
pub enum Issuer {
    Acme(Arc<dyn AcmeDirectory>),
    /// Generate self-signed certificates locally
    SelfSigned,
}

/// Timing knobs of the certificate lifecycle
#[derive(Debug, Clone)]
pub struct AcmeTiming {
    /// Wait before retrying an issuance that produced no certificate
    pub issuance_backoff: Duration,
    /// Interval between order status polls
    pub poll_interval: Duration,
    /// Upper bound on waiting for challenge validation
    pub challenge_timeout: Duration,
    /// Interval between renewal passes
    pub renewal_interval: Duration,
    /// Renew certificates expiring within this window
    pub renew_before: chrono::Duration,
}

impl Default for AcmeTiming {
    fn default() -> Self {
        Self {
            issuance_backoff: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            challenge_timeout: Duration::from_secs(5 * 60),
            renewal_interval: Duration::from_secs(12 * 60 * 60),
            renew_before: chrono::Duration::days(30),
        }
    }
}

/// A certificate ready to be served
pub struct Issued {
    pub bundle: Bundle,
    pub leaf: Leaf,
    pub server_config: Arc<rustls::ServerConfig>,
}

impl Issued {
    fn new(hostname: &str, bundle: Bundle) -> Result<Self> {
        let leaf = certs::validate(hostname, &bundle, Utc::now())?;
        let server_config = crate::tls::server_config(&bundle)?;
        Ok(Self {
            bundle,
            leaf,
            server_config,
        })
    }

    fn is_current(&self) -> bool {
        let now = Utc::now();
        self.leaf.not_before <= now && now <= self.leaf.not_after
    }
}

/// Certificate lifecycle manager
pub struct AcmeManager {
    issuer: Issuer,
    cache: Namespaced,
    lock: DistributedLock,
    routing: SharedRouting,
    timing: AcmeTiming,
    /// Certificates already loaded for the TLS handshake
    issued: RwLock<HashMap<String, Arc<Issued>>>,
    /// Per-hostname single-flight guards
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AcmeManager {
    pub fn new(
        issuer: Issuer,
        store: Arc<dyn KvStore>,
        lock: DistributedLock,
        routing: SharedRouting,
        timing: AcmeTiming,
    ) -> Self {
        Self {
            issuer,
            cache: Namespaced::new(store, KIND_CACHE),
            lock,
            routing,
            timing,
            issued: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Return a valid certificate for `hostname`, issuing one if needed.
    ///
    /// `None` means another actor completed the order but its certificate
    /// is not visible in the cache yet.
    pub async fn ensure_certificate(&self, hostname: &str) -> Result<Option<Bundle>> {
        self.ensure(hostname, chrono::Duration::zero()).await
    }

    /// Like [`ensure_certificate`](Self::ensure_certificate) but retries on
    /// the issuance back-off until a certificate is available.
    pub async fn certificate(&self, hostname: &str) -> Result<Bundle> {
        loop {
            if let Some(bundle) = self.ensure_certificate(hostname).await? {
                return Ok(bundle);
            }
            info!(
                hostname,
                retry_secs = self.timing.issuance_backoff.as_secs(),
                "Certificate not available yet, retrying"
            );
            tokio::time::sleep(self.timing.issuance_backoff).await;
        }
    }

    /// Certificate lookup for the TLS handshake
    pub async fn get_certificate(&self, server_name: &str) -> Result<Arc<Issued>> {
        let hostname = server_name.trim_end_matches('.').to_ascii_lowercase();
        if self.routing.load().lookup(&hostname).is_none() {
            return Err(ProxyError::HostNotAllowed(hostname));
        }

        if let Some(issued) = self.loaded(&hostname).await {
            return Ok(issued);
        }

        let guard = self.flight_guard(&hostname).await;
        let _flight = guard.lock().await;

        // Another handshake may have finished while we waited
        if let Some(issued) = self.loaded(&hostname).await {
            return Ok(issued);
        }

        let bundle = match &self.issuer {
            Issuer::SelfSigned => certs::self_signed(&hostname)?,
            Issuer::Acme(_) => self.certificate(&hostname).await?,
        };
        let issued = Arc::new(Issued::new(&hostname, bundle)?);
        self.issued
            .write()
            .await
            .insert(hostname.clone(), issued.clone());
        debug!(hostname = %hostname, not_after = %issued.leaf.not_after, "Certificate loaded");
        Ok(issued)
    }

    /// Stored HTTP-01 key authorization for `token`
    pub async fn challenge_response(&self, token: &str) -> Result<Option<Vec<u8>>> {
        self.cache.get(&token_key(token)).await
    }

    /// Spawn the background renewal loop
    pub fn start_renewal_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = if self.renew_expiring().await {
                    self.timing.renewal_interval
                } else {
                    self.timing.issuance_backoff
                };
                tokio::time::sleep(wait).await;
            }
        })
    }

    /// One renewal pass. Returns `false` when some renewal failed.
    pub async fn renew_expiring(&self) -> bool {
        let Issuer::Acme(_) = self.issuer else {
            return true;
        };

        let hostnames: Vec<String> = self
            .routing
            .load()
            .domains()
            .map(|d| d.hostname.clone())
            .collect();

        let mut healthy = true;
        for hostname in hostnames {
            match self.renew(&hostname).await {
                Ok(()) => {}
                Err(e) => {
                    error!(hostname = %hostname, error = %e, "Certificate renewal failed");
                    healthy = false;
                }
            }
        }
        healthy
    }

    async fn renew(&self, hostname: &str) -> Result<()> {
        // Only hostnames that already hold a certificate; others are issued
        // lazily on first handshake
        let Some(bundle) = self.cached(hostname).await? else {
            return Ok(());
        };
        let leaf = match certs::validate(hostname, &bundle, Utc::now()) {
            Ok(leaf) => leaf,
            Err(_) => return Ok(()),
        };
        if !leaf.expires_within(Utc::now(), self.timing.renew_before) {
            return self.refresh_loaded(hostname, bundle, &leaf).await;
        }

        info!(hostname, not_after = %leaf.not_after, "Renewing certificate");
        if let Some(bundle) = self.ensure(hostname, self.timing.renew_before).await? {
            let issued = Arc::new(Issued::new(hostname, bundle)?);
            self.issued
                .write()
                .await
                .insert(hostname.to_string(), issued);
        }
        Ok(())
    }

    /// Swap in a cached certificate newer than the one serving handshakes,
    /// e.g. after another replica renewed it
    async fn refresh_loaded(&self, hostname: &str, bundle: Bundle, leaf: &Leaf) -> Result<()> {
        let stale = match self.issued.read().await.get(hostname) {
            Some(loaded) => loaded.leaf.not_after < leaf.not_after,
            None => false,
        };
        if stale {
            debug!(hostname, not_after = %leaf.not_after, "Loading certificate renewed elsewhere");
            let issued = Arc::new(Issued::new(hostname, bundle)?);
            self.issued
                .write()
                .await
                .insert(hostname.to_string(), issued);
        }
        Ok(())
    }

    async fn ensure(
        &self,
        hostname: &str,
        min_remaining: chrono::Duration,
    ) -> Result<Option<Bundle>> {
        if let Some(bundle) = self.cached_valid(hostname, min_remaining).await? {
            return Ok(Some(bundle));
        }

        let directory = match &self.issuer {
            Issuer::Acme(directory) => directory.clone(),
            Issuer::SelfSigned => return certs::self_signed(hostname).map(Some),
        };

        self.lock.acquire(hostname).await?;

        if let Some(bundle) = self.cached_valid(hostname, min_remaining).await? {
            debug!(hostname, "Certificate issued by another replica");
            self.lock.release(hostname).await?;
            return Ok(Some(bundle));
        }

        // On failure the lock stays held and is reclaimed once stale
        let bundle = self.issue(hostname, directory.as_ref()).await?;
        match bundle {
            Some(bundle) => Ok(Some(bundle)),
            None => {
                self.lock.release(hostname).await?;
                self.cached_valid(hostname, chrono::Duration::zero()).await
            }
        }
    }

    /// Run one order to completion. `None` when the order was already valid.
    async fn issue(&self, hostname: &str, directory: &dyn AcmeDirectory) -> Result<Option<Bundle>> {
        info!(hostname, "Requesting certificate");
        let mut order = directory.new_order(hostname).await?;

        if order.status().await? == OrderProgress::Valid {
            info!(hostname, "Order already valid");
            return Ok(None);
        }

        let challenges = match order.http01_challenges().await {
            Ok(challenges) => challenges,
            Err(e @ ProxyError::NoHttp01Challenge { .. }) => {
                error!(hostname, error = %e, "ACME server offers no usable challenge, check the account configuration");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        for challenge in &challenges {
            self.cache
                .put(
                    &token_key(&challenge.token),
                    challenge.key_authorization.as_bytes(),
                )
                .await?;
        }
        for challenge in &challenges {
            debug!(hostname, token = %challenge.token, "Challenge ready");
            order.set_ready(challenge).await?;
        }

        self.wait_ready(hostname, order.as_mut()).await?;

        let key = KeyPair::generate().map_err(|e| ProxyError::acme(hostname, "generate key", e))?;
        let chain_pem = order.issue(hostname, &key).await?;

        let bundle = Bundle::from_chain_pem(&key, &chain_pem)
            .ok_or_else(|| ProxyError::acme(hostname, "parse chain", "no certificate in response"))?;
        let leaf = certs::validate(hostname, &bundle, Utc::now())?;

        // Persisted before release so a waiter finds it once it holds the lock
        self.cache.put(hostname, &certs::encode(&bundle)).await?;
        self.lock.release(hostname).await?;
        for challenge in &challenges {
            if let Err(e) = self.cache.delete(&token_key(&challenge.token)).await {
                warn!(hostname, token = %challenge.token, error = %e, "Failed to delete challenge token");
            }
        }

        info!(hostname, not_after = %leaf.not_after, "Certificate issued");
        Ok(Some(bundle))
    }

    async fn wait_ready(&self, hostname: &str, order: &mut dyn AcmeOrder) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timing.challenge_timeout;
        loop {
            match order.status().await? {
                OrderProgress::Ready | OrderProgress::Valid | OrderProgress::Processing => {
                    return Ok(())
                }
                OrderProgress::Invalid => {
                    return Err(ProxyError::acme(hostname, "validate challenge", "authorization is invalid"))
                }
                OrderProgress::Pending => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(ProxyError::acme(
                            hostname,
                            "validate challenge",
                            "timed out waiting for validation",
                        ));
                    }
                    tokio::time::sleep(self.timing.poll_interval).await;
                }
            }
        }
    }

    async fn cached(&self, hostname: &str) -> Result<Option<Bundle>> {
        Ok(self
            .cache
            .get(hostname)
            .await?
            .and_then(|bytes| certs::decode(&bytes)))
    }

    async fn cached_valid(
        &self,
        hostname: &str,
        min_remaining: chrono::Duration,
    ) -> Result<Option<Bundle>> {
        let Some(bundle) = self.cached(hostname).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        match certs::validate(hostname, &bundle, now) {
            Ok(leaf) if !leaf.expires_within(now, min_remaining) => Ok(Some(bundle)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(hostname, error = %e, "Cached certificate unusable");
                Ok(None)
            }
        }
    }

    async fn loaded(&self, hostname: &str) -> Option<Arc<Issued>> {
        self.issued
            .read()
            .await
            .get(hostname)
            .filter(|issued| issued.is_current())
            .cloned()
    }

    async fn flight_guard(&self, hostname: &str) -> Arc<Mutex<()>> {
        self.inflight
            .lock()
            .await
            .entry(hostname.to_string())
            .or_default()
            .clone()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDirectory;
    use super::*;
    use crate::routing::RoutingTable;
    use crate::settings::Settings;
    use crate::store::MemoryStore;
    use arc_swap::ArcSwap;
    use chrono::Datelike;

    const HOST: &str = "www.example.com";

    fn routing() -> SharedRouting {
        let settings = Settings::parse(
            r#"
[acme]
email = "admin@example.com"

[domains.web]
hostname = "www.example.com"
service = "web:8080"
"#,
        )
        .unwrap();
        Arc::new(ArcSwap::from_pointee(
            RoutingTable::build(&settings, "test").unwrap(),
        ))
    }

    fn timing() -> AcmeTiming {
        AcmeTiming {
            issuance_backoff: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
            challenge_timeout: Duration::from_secs(1),
            ..AcmeTiming::default()
        }
    }

    fn manager(directory: &Arc<FakeDirectory>, store: Arc<dyn KvStore>) -> AcmeManager {
        let lock = DistributedLock::with_timing(
            store.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60 * 60),
        );
        AcmeManager::new(
            Issuer::Acme(Arc::new(directory.clone())),
            store,
            lock,
            routing(),
            timing(),
        )
    }

    fn lock_key(hostname: &str) -> String {
        format!("{}/{}", crate::store::KIND_LOCK, hostname)
    }

    /// Bundle for HOST expiring `days` from now
    fn expiring_in(days: i64) -> Bundle {
        let key = KeyPair::generate().unwrap();
        let end = Utc::now() + chrono::Duration::days(days);
        let mut params = rcgen::CertificateParams::new(vec![HOST.to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
        let cert = params.self_signed(&key).unwrap();
        Bundle::from_chain_pem(&key, &cert.pem()).unwrap()
    }

    #[tokio::test]
    async fn test_issue_then_reuse() {
        let directory = Arc::new(FakeDirectory::default());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());

        let first = acme.ensure_certificate(HOST).await.unwrap().unwrap();
        assert_eq!(directory.orders(), 1);

        let second = acme.ensure_certificate(HOST).await.unwrap().unwrap();
        assert_eq!(directory.orders(), 1);
        assert_eq!(first.chain, second.chain);

        assert!(store.get(&lock_key(HOST)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_challenge_token_removed_after_issue() {
        let directory = Arc::new(FakeDirectory::default());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store);

        acme.ensure_certificate(HOST).await.unwrap().unwrap();
        let token = format!("tok-{}", HOST);
        assert!(acme.challenge_response(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_challenge_response_reads_cache() {
        let directory = Arc::new(FakeDirectory::default());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());

        Namespaced::new(store, KIND_CACHE)
            .put(&token_key("abc"), b"abc.thumb")
            .await
            .unwrap();
        assert_eq!(
            acme.challenge_response("abc").await.unwrap(),
            Some(b"abc.thumb".to_vec())
        );
        assert!(acme.challenge_response("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_order_already_valid_releases_lock() {
        let directory = Arc::new(FakeDirectory {
            already_valid: true,
            ..FakeDirectory::default()
        });
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());

        assert!(acme.ensure_certificate(HOST).await.unwrap().is_none());
        assert!(store.get(&lock_key(HOST)).await.unwrap().is_none());
        assert_eq!(directory.issued.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_http01_challenge_keeps_lock() {
        let directory = Arc::new(FakeDirectory {
            dns_only: true,
            ..FakeDirectory::default()
        });
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());

        let err = acme.ensure_certificate(HOST).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoHttp01Challenge { .. }));
        assert!(store.get(&lock_key(HOST)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_certificate_rejected() {
        let directory = Arc::new(FakeDirectory {
            wrong_name: Some("other.example.com".to_string()),
            ..FakeDirectory::default()
        });
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());

        let err = acme.ensure_certificate(HOST).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidCertificate { .. }));
        let cache = Namespaced::new(store, KIND_CACHE);
        assert!(cache.get(HOST).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_certificate_rejects_unknown_host() {
        let directory = Arc::new(FakeDirectory::default());
        let acme = manager(&directory, Arc::new(MemoryStore::new()));

        let err = acme.get_certificate("evil.example.net").await.err().unwrap();
        assert!(matches!(err, ProxyError::HostNotAllowed(_)));
        assert_eq!(directory.orders(), 0);
    }

    #[tokio::test]
    async fn test_get_certificate_single_flight() {
        let directory = Arc::new(FakeDirectory::default());
        let acme = Arc::new(manager(&directory, Arc::new(MemoryStore::new())));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let acme = acme.clone();
                tokio::spawn(async move { acme.get_certificate("WWW.example.com.").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(directory.orders(), 1);
    }

    #[tokio::test]
    async fn test_self_signed_issuer() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = AcmeManager::new(
            Issuer::SelfSigned,
            store.clone(),
            DistributedLock::new(store),
            routing(),
            timing(),
        );
        let issued = acme.get_certificate(HOST).await.unwrap();
        assert!(issued.leaf.names.contains(&HOST.to_string()));
    }

    #[tokio::test]
    async fn test_renewal_reissues_expiring_certificate() {
        let directory = Arc::new(FakeDirectory::default());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());

        let cache = Namespaced::new(store, KIND_CACHE);
        cache
            .put(HOST, &certs::encode(&expiring_in(5)))
            .await
            .unwrap();

        assert!(acme.renew_expiring().await);
        assert_eq!(directory.orders(), 1);
        let renewed = certs::decode(&cache.get(HOST).await.unwrap().unwrap()).unwrap();
        let leaf = certs::validate(HOST, &renewed, Utc::now()).unwrap();
        assert!(!leaf.expires_within(Utc::now(), chrono::Duration::days(30)));
    }

    #[tokio::test]
    async fn test_renewal_picks_up_certificate_renewed_elsewhere() {
        let directory = Arc::new(FakeDirectory::default());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());
        let cache = Namespaced::new(store, KIND_CACHE);

        cache.put(HOST, &certs::encode(&expiring_in(5))).await.unwrap();
        let before = acme.get_certificate(HOST).await.unwrap().leaf.not_after;

        // Another replica stores a renewed certificate
        cache.put(HOST, &certs::encode(&expiring_in(90))).await.unwrap();
        assert!(acme.renew_expiring().await);

        let after = acme.get_certificate(HOST).await.unwrap().leaf.not_after;
        assert!(after > before);
        assert_eq!(directory.orders(), 0);
    }

    #[tokio::test]
    async fn test_renewal_skips_fresh_and_missing() {
        let directory = Arc::new(FakeDirectory::default());
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = manager(&directory, store.clone());

        assert!(acme.renew_expiring().await);
        assert_eq!(directory.orders(), 0);

        Namespaced::new(store, KIND_CACHE)
            .put(HOST, &certs::encode(&expiring_in(90)))
            .await
            .unwrap();
        assert!(acme.renew_expiring().await);
        assert_eq!(directory.orders(), 0);
    }
}
