//! Routing table
//!
//! Immutable snapshot of the routing settings: hostname to [`Domain`], and
//! within a domain request path to backend. A new table is built on every
//! configuration change and published through [`SharedRouting`].

use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::settings::Settings;

/// Routing table shared between the watcher and request handlers
pub type SharedRouting = Arc<ArcSwap<RoutingTable>>;

/// A served hostname
#[derive(Debug, Clone)]
pub struct Domain {
    /// Configuration name
    pub name: String,
    pub hostname: String,
    /// Default backend, `host:port`
    pub service: String,
    pub virtual_hostname: Option<String>,
    pub redirect: Option<String>,
    pub allow_insecure: bool,
    /// First match wins
    pub paths: Vec<Path>,
    pub cors_origins: Vec<String>,
    pub hop_headers: BTreeMap<String, String>,
}

/// Path-specific routing inside a domain
#[derive(Debug, Clone)]
pub struct Path {
    pub match_prefix: String,
    pub service: String,
    pub allow_insecure: bool,
    pub exact_match: bool,
    pub monitoring_name: Option<String>,
    pub monitoring_tags: BTreeMap<String, String>,
}

impl Path {
    /// Whether a request path is routed here.
    ///
    /// One trailing slash is ignored on both sides.
    pub fn matches(&self, path: &str) -> bool {
        let path = trim_slash(path);
        let prefix = trim_slash(&self.match_prefix);
        if self.exact_match {
            path == prefix
        } else {
            path.starts_with(prefix)
        }
    }
}

fn trim_slash(s: &str) -> &str {
    s.strip_suffix('/').unwrap_or(s)
}

/// Resolved destination of a request
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub service: &'a str,
    pub allow_insecure: bool,
    /// Name reported to monitoring
    pub monitoring_name: &'a str,
    pub monitoring_tags: Option<&'a BTreeMap<String, String>>,
}

impl Domain {
    /// Route for a request path, falling back to the domain defaults
    pub fn resolve(&self, path: &str) -> Route<'_> {
        match self.paths.iter().find(|p| p.matches(path)) {
            Some(p) => Route {
                service: &p.service,
                allow_insecure: p.allow_insecure,
                monitoring_name: p.monitoring_name.as_deref().unwrap_or(&self.name),
                monitoring_tags: Some(&p.monitoring_tags),
            },
            None => Route {
                service: &self.service,
                allow_insecure: self.allow_insecure,
                monitoring_name: &self.name,
                monitoring_tags: None,
            },
        }
    }

    /// Whether CORS is granted to `origin`
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.cors_origins.iter().any(|o| o == origin)
    }
}

/// Hostname to domain snapshot
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    /// Version of the configuration this table was built from
    pub version: String,
    /// External authentication endpoint
    pub auth_endpoint: Option<String>,
    /// External redirect rewriting endpoint
    pub redirects_endpoint: Option<String>,
    domains: HashMap<String, Domain>,
}

impl RoutingTable {
    /// Empty table, serves nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate settings and build a table from them
    pub fn build(settings: &Settings, version: &str) -> Result<Self> {
        settings.validate()?;

        let mut domains = HashMap::with_capacity(settings.domains.len());
        for (name, d) in &settings.domains {
            let hostname = d.hostname.trim().to_ascii_lowercase();
            let paths = d
                .paths
                .iter()
                .map(|p| Path {
                    match_prefix: p.match_prefix.clone(),
                    service: p.service.clone().unwrap_or_else(|| d.service.clone()),
                    allow_insecure: p.allow_insecure || d.allow_insecure,
                    exact_match: p.exact_match,
                    monitoring_name: p.monitoring.name.clone(),
                    monitoring_tags: p.monitoring.tags.clone(),
                })
                .collect();

            domains.insert(
                hostname.clone(),
                Domain {
                    name: name.clone(),
                    hostname,
                    service: d.service.clone(),
                    virtual_hostname: d.virtual_hostname.clone().filter(|v| !v.is_empty()),
                    redirect: d.redirect.clone().filter(|r| !r.trim().is_empty()),
                    allow_insecure: d.allow_insecure,
                    paths,
                    cors_origins: d.cors.origins.clone(),
                    hop_headers: d.hop_headers.clone(),
                },
            );
        }

        Ok(Self {
            version: version.to_string(),
            auth_endpoint: non_empty(&settings.auth.endpoint),
            redirects_endpoint: non_empty(&settings.redirects.apply),
            domains,
        })
    }

    /// Domain serving a `Host` header value. Case-insensitive, port ignored.
    pub fn lookup(&self, host: &str) -> Option<&Domain> {
        let hostname = strip_port(host).to_ascii_lowercase();
        self.domains.get(&hostname)
    }

    /// All domains, in no particular order
    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.domains.values()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// `example.com:8443` -> `example.com`; bracketed IPv6 literals are kept whole
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        let settings = Settings::parse(
            r#"
[acme]
email = "admin@example.com"

[domains.web]
hostname = "www.example.com"
service = "web:80"
allow_insecure = false

[[domains.web.paths]]
match = "/api/"
service = "api:80"
monitoring = { name = "api" }

[[domains.web.paths]]
match = "/api/v2"
service = "never:80"

[[domains.web.paths]]
match = "/status"
exact_match = true
allow_insecure = true

[domains.legacy]
hostname = "Legacy.Example.com"
service = "legacy:80"
allow_insecure = true

[[domains.legacy.paths]]
match = "/static"
service = "cdn:80"
"#,
        )
        .unwrap();
        RoutingTable::build(&settings, "v1").unwrap()
    }

    #[test]
    fn test_lookup_exact_hostname() {
        let table = table();
        assert_eq!(table.version, "v1");
        assert_eq!(table.lookup("www.example.com").unwrap().name, "web");
        assert_eq!(table.lookup("WWW.example.com:8443").unwrap().name, "web");
        assert_eq!(table.lookup("legacy.example.com").unwrap().name, "legacy");
        assert!(table.lookup("example.com").is_none());
        assert!(table.lookup("api.www.example.com").is_none());
    }

    #[test]
    fn test_resolve_first_prefix_wins() {
        let table = table();
        let web = table.lookup("www.example.com").unwrap();

        let route = web.resolve("/api/v2/users");
        assert_eq!(route.service, "api:80");
        assert_eq!(route.monitoring_name, "api");

        // Trailing slash ignored on the prefix
        assert_eq!(web.resolve("/api").service, "api:80");
        assert_eq!(web.resolve("/").service, "web:80");
        assert_eq!(web.resolve("/other").monitoring_name, "web");
    }

    #[test]
    fn test_resolve_exact_match() {
        let table = table();
        let web = table.lookup("www.example.com").unwrap();

        let route = web.resolve("/status/");
        assert_eq!(route.service, "web:80");
        assert!(route.allow_insecure);
        assert!(!web.resolve("/status/deep").allow_insecure);
    }

    #[test]
    fn test_paths_inherit_insecure() {
        let table = table();
        let legacy = table.lookup("legacy.example.com").unwrap();
        let route = legacy.resolve("/static/app.js");
        assert_eq!(route.service, "cdn:80");
        assert!(route.allow_insecure);
    }

    #[test]
    fn test_build_rejects_invalid() {
        let settings = Settings::parse("[domains.a]\nhostname = \"a\"\nservice = \"a:80\"\n").unwrap();
        assert!(RoutingTable::build(&settings, "v2").is_err());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }
}
