//! Error types for baster

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Key-value store failure, tagged with the operation and key
    #[error("Store error during {operation} of {key}: {message}")]
    Store {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// ACME protocol failure for a hostname
    #[error("ACME error during {operation} for {hostname}: {message}")]
    Acme {
        hostname: String,
        operation: &'static str,
        message: String,
    },

    /// The ACME server offered no challenge type we can answer
    #[error("No supported challenge type found for {hostname}: offered {offered:?}")]
    NoHttp01Challenge {
        hostname: String,
        offered: Vec<String>,
    },

    /// Certificate is invalid for the requested hostname
    #[error("Invalid certificate for {hostname}: {reason}")]
    InvalidCertificate { hostname: String, reason: String },

    /// Hostname is not part of the routing table
    #[error("Unknown service hostname: {0}")]
    HostNotAllowed(String),

    /// External collaborator (auth, redirects, telemetry) failure
    #[error("External service {service} failed: {message}")]
    External {
        service: &'static str,
        message: String,
    },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    pub(crate) fn store(
        operation: &'static str,
        key: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> Self {
        Self::Store {
            operation,
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn acme(
        hostname: impl Into<String>,
        operation: &'static str,
        err: impl std::fmt::Display,
    ) -> Self {
        Self::Acme {
            hostname: hostname.into(),
            operation,
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid_certificate(hostname: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCertificate {
            hostname: hostname.to_string(),
            reason: reason.into(),
        }
    }
}
