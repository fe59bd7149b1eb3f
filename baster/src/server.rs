//! Listeners
//!
//! The plain HTTP listener is served by axum directly. The HTTPS listener
//! accepts TCP connections, completes the SNI-driven handshake and hands the
//! stream to hyper.

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::acme::AcmeManager;
use crate::error::{ProxyError, Result};
use crate::proxy::{insecure_router, secure_router, ProxyState};
use crate::tls::CLIENT_HELLO_TIMEOUT;

/// Both listeners of one proxy replica
pub struct ProxyServer {
    state: Arc<ProxyState>,
    acme: Arc<AcmeManager>,
    insecure_addr: String,
    secure_addr: String,
}

impl ProxyServer {
    pub fn new(
        state: Arc<ProxyState>,
        acme: Arc<AcmeManager>,
        insecure_addr: impl Into<String>,
        secure_addr: impl Into<String>,
    ) -> Self {
        Self {
            state,
            acme,
            insecure_addr: insecure_addr.into(),
            secure_addr: secure_addr.into(),
        }
    }

    /// Serve until either listener fails
    pub async fn run(self) -> Result<()> {
        let insecure = TcpListener::bind(&self.insecure_addr).await?;
        let secure = TcpListener::bind(&self.secure_addr).await?;
        info!(
            insecure = %self.insecure_addr,
            secure = %self.secure_addr,
            "Listening"
        );

        tokio::select! {
            result = run_insecure(insecure, self.state.clone()) => result,
            result = run_secure(secure, self.state, self.acme) => result,
        }
    }
}

/// Serve plain HTTP on `listener`
pub async fn run_insecure(listener: TcpListener, state: Arc<ProxyState>) -> Result<()> {
    axum::serve(listener, insecure_router(state))
        .await
        .map_err(ProxyError::Io)
}

/// Serve HTTPS on `listener`, one task per connection
pub async fn run_secure(
    listener: TcpListener,
    state: Arc<ProxyState>,
    acme: Arc<AcmeManager>,
) -> Result<()> {
    let router = secure_router(state);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        let acme = acme.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match crate::tls::accept(stream, &acme, CLIENT_HELLO_TIMEOUT).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(peer = %addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = service_fn(move |req| router.clone().oneshot(req));
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                error!(peer = %addr, error = %e, "Error serving connection");
            }
        });
    }
}
