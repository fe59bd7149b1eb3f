//! Let's Encrypt directory backed by `instant-acme`

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier,
    LetsEncrypt as Directory, NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use std::time::Duration;
use tracing::{debug, info};

use super::{AcmeDirectory, AcmeOrder, Http01Challenge, OrderProgress, ACCOUNT_KEY};
use crate::error::{ProxyError, Result};
use crate::store::KvStore;

/// Upper bound on waiting for the certificate after finalization
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(60);

/// ACME account on Let's Encrypt production or staging
pub struct LetsEncrypt {
    account: Account,
}

impl LetsEncrypt {
    /// Restore the account from the cache, or register a new one.
    ///
    /// `cache` is the `Cache` namespace; credentials are stored under
    /// [`ACCOUNT_KEY`].
    pub async fn connect(cache: &dyn KvStore, email: &str, staging: bool) -> Result<Self> {
        if let Some(bytes) = cache.get(ACCOUNT_KEY).await? {
            let credentials: AccountCredentials = serde_json::from_slice(&bytes)?;
            let account = Account::builder()
                .map_err(|e| ProxyError::acme(email, "load account", e))?
                .from_credentials(credentials)
                .await
                .map_err(|e| ProxyError::acme(email, "load account", e))?;
            info!(email, "ACME account restored");
            return Ok(Self { account });
        }

        let directory = if staging {
            Directory::Staging
        } else {
            Directory::Production
        };
        info!(email, staging, "Registering ACME account");

        // Registering a known key returns the existing account
        let (account, credentials) = Account::builder()
            .map_err(|e| ProxyError::acme(email, "create account", e))?
            .create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory.url().to_owned(),
                None,
            )
            .await
            .map_err(|e| ProxyError::acme(email, "create account", e))?;

        cache
            .put(ACCOUNT_KEY, &serde_json::to_vec(&credentials)?)
            .await?;
        info!(email, "ACME account registered");

        Ok(Self { account })
    }
}

#[async_trait]
impl AcmeDirectory for LetsEncrypt {
    async fn new_order(&self, hostname: &str) -> Result<Box<dyn AcmeOrder>> {
        let identifiers = [Identifier::Dns(hostname.to_string())];
        let order = self
            .account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| ProxyError::acme(hostname, "create order", e))?;
        Ok(Box::new(LetsEncryptOrder {
            hostname: hostname.to_string(),
            order,
        }))
    }
}

struct LetsEncryptOrder {
    hostname: String,
    order: Order,
}

#[async_trait]
impl AcmeOrder for LetsEncryptOrder {
    async fn status(&mut self) -> Result<OrderProgress> {
        let state = self
            .order
            .refresh()
            .await
            .map_err(|e| ProxyError::acme(&self.hostname, "refresh order", e))?;
        Ok(match state.status {
            OrderStatus::Pending => OrderProgress::Pending,
            OrderStatus::Ready => OrderProgress::Ready,
            OrderStatus::Processing => OrderProgress::Processing,
            OrderStatus::Valid => OrderProgress::Valid,
            OrderStatus::Invalid => OrderProgress::Invalid,
        })
    }

    async fn http01_challenges(&mut self) -> Result<Vec<Http01Challenge>> {
        let hostname = self.hostname.clone();
        let mut challenges = Vec::new();
        let mut authorizations = self.order.authorizations();

        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| ProxyError::acme(&hostname, "fetch authorization", e))?;
            debug!(hostname = %hostname, status = ?authz.status, "Processing authorization");

            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let offered: Vec<String> = authz
                .challenges
                .iter()
                .map(|c| format!("{:?}", c.r#type))
                .collect();
            let challenge = authz
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| ProxyError::NoHttp01Challenge {
                    hostname: hostname.clone(),
                    offered,
                })?;

            challenges.push(Http01Challenge {
                token: challenge.token.clone(),
                key_authorization: challenge.key_authorization().as_str().to_string(),
                url: challenge.url.clone(),
            });
        }

        Ok(challenges)
    }

    async fn set_ready(&mut self, challenge: &Http01Challenge) -> Result<()> {
        let hostname = self.hostname.clone();
        let mut authorizations = self.order.authorizations();

        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| ProxyError::acme(&hostname, "fetch authorization", e))?;
            if !authz.challenges.iter().any(|c| c.url == challenge.url) {
                continue;
            }
            if let Some(mut handle) = authz.challenge(ChallengeType::Http01) {
                handle
                    .set_ready()
                    .await
                    .map_err(|e| ProxyError::acme(&hostname, "set challenge ready", e))?;
                return Ok(());
            }
        }

        Err(ProxyError::acme(
            hostname,
            "set challenge ready",
            format!("challenge not found: {}", challenge.url),
        ))
    }

    async fn issue(&mut self, hostname: &str, key: &KeyPair) -> Result<String> {
        let csr = CertificateParams::new(vec![hostname.to_string()])
            .and_then(|params| params.serialize_request(key))
            .map_err(|e| ProxyError::acme(hostname, "build csr", e))?;

        self.order
            .finalize_csr(csr.der())
            .await
            .map_err(|e| ProxyError::acme(hostname, "finalize order", e))?;

        let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
        loop {
            match self.status().await? {
                OrderProgress::Valid => break,
                OrderProgress::Invalid => {
                    return Err(ProxyError::acme(hostname, "finalize order", "order became invalid"))
                }
                _ if tokio::time::Instant::now() > deadline => {
                    return Err(ProxyError::acme(
                        hostname,
                        "finalize order",
                        "timed out waiting for certificate",
                    ))
                }
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }

        self.order
            .certificate()
            .await
            .map_err(|e| ProxyError::acme(hostname, "download certificate", e))?
            .ok_or_else(|| ProxyError::acme(hostname, "download certificate", "no certificate in response"))
    }
}
