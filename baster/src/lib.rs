//! baster: edge reverse proxy with automatic TLS
//!
//! Terminates HTTP and HTTPS for a set of domains, routes each request to a
//! backend by hostname and path prefix, and obtains certificates from an ACME
//! server on first use. Replicas share certificates, challenge tokens and
//! issuance locks through a key-value store.
//!
//! # Features
//!
//! - Routing table hot-reloaded from a versioned settings source
//! - HTTP to HTTPS upgrade, hard redirects, per-path insecure access
//! - External authentication and redirect services
//! - CORS, forwarded headers and per-domain header injection
//! - Distributed ACME issuance with HTTP-01 challenges and renewal
//! - Request telemetry with pluggable sinks
//!
//! # Example routing settings
//!
//! ```toml
//! [acme]
//! email = "admin@example.com"
//!
//! [auth]
//! endpoint = "http://auth.internal/check"
//!
//! [domains.web]
//! hostname = "www.example.com"
//! service = "web.internal:8080"
//! cors = { origins = ["https://app.example.com"] }
//!
//! [[domains.web.paths]]
//! match = "/api"
//! service = "api.internal:8080"
//! ```

pub mod acme;
pub mod certs;
pub mod challenge;
pub mod config;
pub mod error;
pub mod external;
pub mod lock;
pub mod monitoring;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod settings;
pub mod source;
pub mod store;
pub mod tls;
pub mod watcher;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use server::ProxyServer;
