//! Process configuration for baster
//!
//! Loaded from an optional TOML file, then overridden by `BASTER__`
//! environment variables (`BASTER__STORE__URL=redis://...`). Every field has
//! a default. Routing is configured separately, see [`crate::settings`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// Main proxy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub certificates: CertificatesConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain HTTP listener (redirects, ACME challenges, insecure paths)
    pub insecure_addr: String,
    /// HTTPS listener
    pub secure_addr: String,
    /// Backend and external call timeout in seconds
    pub timeout_seconds: u64,
}

/// Routing settings source
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Path of the routing settings TOML file
    pub path: String,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Shared key-value store
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Redis URL
    pub url: String,
    /// Key prefix shared by every replica
    pub prefix: String,
    pub timeout_ms: u64,
}

/// Certificate lifecycle
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CertificatesConfig {
    /// Self-sign certificates instead of using ACME
    pub self_signed: bool,
    pub lock_retry_seconds: u64,
    pub lock_stale_seconds: u64,
    pub issuance_backoff_seconds: u64,
    pub challenge_timeout_seconds: u64,
    pub renewal_interval_seconds: u64,
    pub renew_before_days: i64,
}

/// Telemetry sinks
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub flush_interval_seconds: u64,
    /// Queue capacity per sink
    pub backlog: usize,
    /// Write measurements to the log
    pub log: bool,
    /// POST measurements to this endpoint
    pub http_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            insecure_addr: "0.0.0.0:80".to_string(),
            secure_addr: "0.0.0.0:443".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: "/etc/baster/settings.toml".to_string(),
            poll_interval_seconds: 30,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "baster".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            self_signed: false,
            lock_retry_seconds: 30,
            lock_stale_seconds: 24 * 60 * 60,
            issuance_backoff_seconds: 30,
            challenge_timeout_seconds: 5 * 60,
            renewal_interval_seconds: 12 * 60 * 60,
            renew_before_days: 30,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            flush_interval_seconds: 10,
            backlog: 1000,
            log: true,
            http_endpoint: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "baster=info,tower_http=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BASTER")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ProxyError::Config(format!("Failed to load config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Local development: in-memory store, self-signed certificates,
    /// unprivileged ports
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                insecure_addr: "127.0.0.1:8080".to_string(),
                secure_addr: "127.0.0.1:8443".to_string(),
                timeout_seconds: 30,
            },
            source: SourceConfig {
                path: "settings.dev.toml".to_string(),
                poll_interval_seconds: 5,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                ..StoreConfig::default()
            },
            certificates: CertificatesConfig {
                self_signed: true,
                ..CertificatesConfig::default()
            },
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig {
                level: "baster=debug,tower_http=debug".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("server.insecure_addr", &self.server.insecure_addr),
            ("server.secure_addr", &self.server.secure_addr),
        ] {
            addr.parse::<std::net::SocketAddr>().map_err(|e| {
                ProxyError::Config(format!("Invalid {} '{}': {}", name, addr, e))
            })?;
        }

        if self.store.backend == StoreBackend::Redis {
            url::Url::parse(&self.store.url).map_err(|e| {
                ProxyError::Config(format!("Invalid store URL '{}': {}", self.store.url, e))
            })?;
        }

        if let Some(endpoint) = &self.monitoring.http_endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                ProxyError::Config(format!("Invalid monitoring endpoint '{}': {}", endpoint, e))
            })?;
        }

        let certs = &self.certificates;
        for (name, value) in [
            ("server.timeout_seconds", self.server.timeout_seconds),
            ("source.poll_interval_seconds", self.source.poll_interval_seconds),
            ("store.timeout_ms", self.store.timeout_ms),
            ("certificates.lock_retry_seconds", certs.lock_retry_seconds),
            ("certificates.lock_stale_seconds", certs.lock_stale_seconds),
            ("certificates.issuance_backoff_seconds", certs.issuance_backoff_seconds),
            ("certificates.challenge_timeout_seconds", certs.challenge_timeout_seconds),
            ("certificates.renewal_interval_seconds", certs.renewal_interval_seconds),
            ("monitoring.flush_interval_seconds", self.monitoring.flush_interval_seconds),
            ("monitoring.backlog", self.monitoring.backlog as u64),
        ] {
            if value == 0 {
                return Err(ProxyError::Config(format!("{} must be positive", name)));
            }
        }
        if certs.renew_before_days <= 0 {
            return Err(ProxyError::Config(
                "certificates.renew_before_days must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_seconds)
    }
}

impl CertificatesConfig {
    pub fn timing(&self) -> crate::acme::AcmeTiming {
        crate::acme::AcmeTiming {
            issuance_backoff: Duration::from_secs(self.issuance_backoff_seconds),
            challenge_timeout: Duration::from_secs(self.challenge_timeout_seconds),
            renewal_interval: Duration::from_secs(self.renewal_interval_seconds),
            renew_before: chrono::Duration::days(self.renew_before_days),
            ..crate::acme::AcmeTiming::default()
        }
    }
}
