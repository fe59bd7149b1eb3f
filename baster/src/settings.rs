//! Routing settings document
//!
//! The document served by the configuration source. Parsed from TOML and
//! turned into a [`RoutingTable`](crate::routing::RoutingTable) on every
//! reload.
//!
//! ```toml
//! [acme]
//! email = "admin@example.com"
//! staging = false
//!
//! [auth]
//! endpoint = "http://auth.internal/check"
//!
//! [redirects]
//! apply = "http://redirects.internal/apply"
//!
//! [domains.web]
//! hostname = "www.example.com"
//! service = "web.internal:8080"
//! hop_headers = { "X-Internal-Token" = "" }
//!
//! [domains.web.cors]
//! origins = ["https://app.example.com"]
//!
//! [[domains.web.paths]]
//! match = "/api"
//! service = "api.internal:8080"
//! monitoring = { name = "api", tags = { team = "core" } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{ProxyError, Result};

/// Routing settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub acme: AcmeSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub redirects: RedirectSettings,
    /// Domains keyed by their configuration name
    #[serde(default)]
    pub domains: BTreeMap<String, DomainSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AcmeSettings {
    /// Contact email of the ACME account
    #[serde(default)]
    pub email: String,
    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub staging: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthSettings {
    /// External authentication endpoint, empty to disable
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RedirectSettings {
    /// External redirect rewriting endpoint, empty to disable
    #[serde(default)]
    pub apply: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DomainSettings {
    pub hostname: String,
    /// Backend address, `host:port`
    #[serde(default)]
    pub service: String,
    /// Host header sent to the backend
    #[serde(default)]
    pub virtual_hostname: Option<String>,
    /// Redirect every request to this URL
    #[serde(default)]
    pub redirect: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub paths: Vec<PathSettings>,
    #[serde(default)]
    pub cors: CorsSettings,
    /// Static headers sent to the backend; an empty value removes the header
    #[serde(default)]
    pub hop_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CorsSettings {
    #[serde(default)]
    pub origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PathSettings {
    /// Path prefix
    #[serde(rename = "match")]
    pub match_prefix: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub exact_match: bool,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringSettings {
    /// Name reported instead of the domain name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Settings {
    /// Parse a TOML document
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| ProxyError::Config(format!("Failed to parse settings: {}", e)))
    }

    /// Reject settings that cannot be served
    pub fn validate(&self) -> Result<()> {
        if self.acme.email.trim().is_empty() {
            return Err(ProxyError::Config("acme email required".to_string()));
        }

        let mut seen = HashSet::new();
        for (name, domain) in &self.domains {
            let hostname = domain.hostname.trim().to_ascii_lowercase();
            if hostname.is_empty() {
                return Err(ProxyError::Config(format!("domain {}: hostname required", name)));
            }
            if !seen.insert(hostname.clone()) {
                return Err(ProxyError::Config(format!(
                    "domain {}: hostname {} is already used",
                    name, hostname
                )));
            }
            let no_redirect = domain.redirect.as_deref().map_or(true, |r| r.trim().is_empty());
            if domain.service.trim().is_empty() && no_redirect {
                return Err(ProxyError::Config(format!(
                    "domain {}: service or redirect required",
                    name
                )));
            }
            for path in &domain.paths {
                if !path.match_prefix.starts_with('/') {
                    return Err(ProxyError::Config(format!(
                        "domain {}: path {:?} must start with /",
                        name, path.match_prefix
                    )));
                }
            }
        }

        Ok(())
    }
}
