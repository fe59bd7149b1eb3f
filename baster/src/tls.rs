//! TLS termination
//!
//! The server name from the ClientHello selects the certificate, which may
//! have to be issued before the handshake can continue. The handshake is
//! therefore split with [`LazyConfigAcceptor`]: read the ClientHello, ask the
//! [`AcmeManager`] for a certificate, then finish with a per-hostname
//! `ServerConfig`.

use rustls::server::Acceptor;
use rustls::{Certificate, PrivateKey, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

use crate::acme::AcmeManager;
use crate::certs::Bundle;
use crate::error::{ProxyError, Result};

/// Upper bound on receiving the ClientHello after the TCP accept
pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a rustls server config serving `bundle`, with HTTP/2 and HTTP/1.1
pub fn server_config(bundle: &Bundle) -> Result<Arc<ServerConfig>> {
    let chain: Vec<Certificate> = bundle.chain.iter().cloned().map(Certificate).collect();
    let key = PrivateKey(bundle.key_der.clone());

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Run the server side of a handshake, picking the certificate by SNI.
///
/// `hello_timeout` bounds reading the ClientHello only; certificate issuance
/// that follows is not subject to it.
pub async fn accept<IO>(
    stream: IO,
    acme: &AcmeManager,
    hello_timeout: Duration,
) -> Result<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let start = tokio::time::timeout(
        hello_timeout,
        LazyConfigAcceptor::new(Acceptor::default(), stream),
    )
    .await
    .map_err(|_| ProxyError::Tls("Timed out waiting for ClientHello".to_string()))?
    .map_err(|e| ProxyError::Tls(format!("Failed to read ClientHello: {}", e)))?;

    let server_name = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Tls("ClientHello without server name".to_string()))?;
    debug!(server_name = %server_name, "TLS handshake");

    let issued = acme.get_certificate(&server_name).await?;

    start
        .into_stream(issued.server_config.clone())
        .await
        .map_err(|e| ProxyError::Tls(format!("Handshake with {} failed: {}", server_name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs;

    #[test]
    fn test_server_config_from_self_signed() {
        let bundle = certs::self_signed("localhost").unwrap();
        let config = server_config(&bundle).unwrap();
        assert!(config.alpn_protocols.contains(&b"h2".to_vec()));
        assert!(config.alpn_protocols.contains(&b"http/1.1".to_vec()));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        use crate::acme::{AcmeTiming, Issuer};
        use crate::lock::DistributedLock;
        use crate::routing::RoutingTable;
        use crate::store::{KvStore, MemoryStore};
        use arc_swap::ArcSwap;

        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let acme = AcmeManager::new(
            Issuer::SelfSigned,
            store.clone(),
            DistributedLock::new(store),
            Arc::new(ArcSwap::from_pointee(RoutingTable::empty())),
            AcmeTiming::default(),
        );

        // The client end stays open but never writes
        let (_client, server) = tokio::io::duplex(1024);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            accept(server, &acme, Duration::from_millis(50)),
        )
        .await
        .expect("accept must give up on its own");
        assert!(matches!(result, Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_server_config_rejects_garbage_key() {
        let mut bundle = certs::self_signed("localhost").unwrap();
        bundle.key_der = vec![0, 1, 2];
        assert!(server_config(&bundle).is_err());
    }
}
