//! Request dispatcher
//!
//! Every request on both listeners runs the same pipeline: domain lookup,
//! hard redirect, HTTPS upgrade, external auth, external redirects, CORS,
//! then forwarding to the resolved backend.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Uri, Version},
    response::IntoResponse,
    routing::{any, get},
    Router,
};
use chrono::Utc;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::acme::AcmeManager;
use crate::challenge::{challenge_handler, CHALLENGE_ROUTE};
use crate::error::Result;
use crate::external::{AuthDecision, ExternalClient};
use crate::monitoring::{Measurement, Monitor};
use crate::routing::{Domain, Route, SharedRouting};

/// HTTP client type for forwarding requests
type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

/// User agent of the load balancer health checker, never recorded
const HEALTH_CHECKER_USER_AGENT: &str = "GoogleHC/1.0";

const HEALTH_BODY: &str = "baster is ok\n";

/// Connection-scoped headers never forwarded to the backend
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shared proxy state
pub struct ProxyState {
    /// Current routing table
    pub routing: SharedRouting,
    /// HTTP client for forwarding
    pub client: HttpClient,
    /// Auth and redirect collaborators
    pub external: ExternalClient,
    pub monitor: Arc<dyn Monitor>,
    /// Challenge responses, absent when certificates are self-signed
    pub acme: Option<Arc<AcmeManager>>,
    /// Backend timeout
    pub timeout: Duration,
}

impl ProxyState {
    pub fn new(
        routing: SharedRouting,
        monitor: Arc<dyn Monitor>,
        acme: Option<Arc<AcmeManager>>,
        timeout: Duration,
    ) -> Result<Self> {
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Ok(Self {
            routing,
            client,
            external: ExternalClient::new(timeout)?,
            monitor,
            acme,
            timeout,
        })
    }
}

/// Router state: the shared state plus the listener it serves
#[derive(Clone)]
pub struct Dispatch {
    pub state: Arc<ProxyState>,
    /// Whether the listener terminates TLS
    pub secure: bool,
}

/// Router for the HTTPS listener
pub fn secure_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", any(health_endpoint))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(Dispatch {
            state,
            secure: true,
        })
}

/// Router for the plain HTTP listener, which also answers ACME challenges
pub fn insecure_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", any(health_endpoint))
        .route(CHALLENGE_ROUTE, get(challenge_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(Dispatch {
            state,
            secure: false,
        })
}

/// Health check endpoint
async fn health_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        HEALTH_BODY,
    )
}

/// Request facts kept for the completion record
struct Exchange {
    start: Instant,
    method: Method,
    host: String,
    /// Host as sent by the client, port and case preserved
    requested_host: String,
    url: String,
    referer: String,
    user_agent: String,
    secure: bool,
}

impl Exchange {
    fn new(req: &Request, host: &str, requested_host: &str, secure: bool) -> Self {
        let scheme = if secure { "https" } else { "http" };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Self {
            start: Instant::now(),
            method: req.method().clone(),
            host: host.to_string(),
            requested_host: requested_host.to_string(),
            url: format!("{}://{}{}", scheme, host, path_and_query),
            referer: header_str(req.headers(), header::REFERER).to_string(),
            user_agent: header_str(req.headers(), header::USER_AGENT).to_string(),
            secure,
        }
    }

    /// Log the outcome and record a measurement
    fn complete(
        &self,
        monitor: &dyn Monitor,
        domain: &Domain,
        route: &Route<'_>,
        status: StatusCode,
        response_size: u64,
    ) {
        if self.user_agent == HEALTH_CHECKER_USER_AGENT {
            return;
        }
        let latency_ms = self.start.elapsed().as_millis() as u64;

        info!(
            domain = %domain.name,
            backend = %route.service,
            host = %self.host,
            method = %self.method,
            url = %self.url,
            status = status.as_u16(),
            response_size,
            latency_ms,
            referer = %self.referer,
            user_agent = %self.user_agent,
            secure = self.secure,
            "request"
        );

        monitor.record(Measurement {
            domain: route.monitoring_name.to_string(),
            method: self.method.to_string(),
            status: status.as_u16(),
            time: Utc::now(),
            latency_ms,
            url: self.url.clone(),
            tags: route.monitoring_tags.cloned().unwrap_or_default(),
            referer: self.referer.clone(),
        });
    }
}

/// Main proxy handler - runs the pipeline for one request
async fn proxy_handler(State(dispatch): State<Dispatch>, req: Request) -> Response<Body> {
    let state = &dispatch.state;
    let table = state.routing.load_full();

    let requested_host = request_host(&req);
    let Some(domain) = table.lookup(&requested_host) else {
        warn!(host = %requested_host, "Service not found");
        return (StatusCode::NOT_FOUND, "baster: service not found\n").into_response();
    };
    let host = domain.hostname.as_str();
    let exchange = Exchange::new(&req, host, &requested_host, dispatch.secure);
    let route = domain.resolve(req.uri().path());
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if let Some(target) = &domain.redirect {
        let location = format!("{}{}", target.trim_end_matches('/'), path_and_query);
        let response = redirect(StatusCode::MOVED_PERMANENTLY, &location);
        exchange.complete(state.monitor.as_ref(), domain, &route, response.status(), 0);
        return response;
    }

    if !dispatch.secure && !route.allow_insecure {
        let location = format!("https://{}{}", host, path_and_query);
        debug!(host, location = %location, "Upgrading insecure request");
        let response = redirect(StatusCode::MOVED_PERMANENTLY, &location);
        exchange.complete(state.monitor.as_ref(), domain, &route, response.status(), 0);
        return response;
    }

    if let Some(endpoint) = &table.auth_endpoint {
        let authorization = header_str(req.headers(), header::AUTHORIZATION);
        let decision = state
            .external
            .authorize(endpoint, host, &exchange.url, authorization)
            .await;
        let response = match decision {
            Ok(AuthDecision::Allow) => None,
            Ok(AuthDecision::Deny { status, body }) => {
                Some((status, body).into_response())
            }
            Ok(AuthDecision::Redirect(location)) => Some(redirect(StatusCode::FOUND, &location)),
            Err(e) => {
                error!(host, url = %exchange.url, error = %e, "Auth service failed");
                Some(StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        };
        if let Some(response) = response {
            exchange.complete(state.monitor.as_ref(), domain, &route, response.status(), 0);
            return response;
        }
    }

    if let Some(endpoint) = &table.redirects_endpoint {
        match state.external.rewrite(endpoint, &exchange.url).await {
            Ok(Some(destination)) => {
                let response = redirect(StatusCode::MOVED_PERMANENTLY, &destination);
                exchange.complete(state.monitor.as_ref(), domain, &route, response.status(), 0);
                return response;
            }
            Ok(None) => {}
            Err(e) => {
                // Redirects are best effort, serve the original URL
                warn!(host, url = %exchange.url, error = %e, "Redirect service failed");
            }
        }
    }

    let cors_origin = req
        .headers()
        .get(header::ORIGIN)
        .filter(|origin| {
            origin
                .to_str()
                .map(|o| domain.allows_origin(o))
                .unwrap_or(false)
        })
        .cloned();

    if let Some(origin) = &cors_origin {
        if req.method() == Method::OPTIONS {
            let mut response = StatusCode::OK.into_response();
            apply_cors(response.headers_mut(), origin);
            apply_preflight(response.headers_mut(), req.headers());
            exchange.complete(state.monitor.as_ref(), domain, &route, response.status(), 0);
            return response;
        }
    }

    let forward_req = match rewrite_request(req, domain, &route, &exchange) {
        Ok(r) => r,
        Err(e) => {
            error!(host, backend = %route.service, error = %e, "Invalid forward URI");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response();
        }
    };
    debug!(host, backend = %route.service, uri = %forward_req.uri(), "Forwarding");

    let mut response = match tokio::time::timeout(state.timeout, state.client.request(forward_req)).await {
        Ok(Ok(response)) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Ok(Err(e)) => {
            error!(host, backend = %route.service, error = %e, "transport error");
            bad_gateway()
        }
        Err(_) => {
            error!(host, backend = %route.service, timeout_secs = state.timeout.as_secs(), "transport error");
            bad_gateway()
        }
    };

    if let Some(origin) = &cors_origin {
        apply_cors(response.headers_mut(), origin);
    }

    let response_size = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    exchange.complete(
        state.monitor.as_ref(),
        domain,
        &route,
        response.status(),
        response_size,
    );

    response
}

/// Point the request at the backend
fn rewrite_request(
    req: Request,
    domain: &Domain,
    route: &Route<'_>,
    exchange: &Exchange,
) -> std::result::Result<Request, axum::http::Error> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    parts.uri = Uri::builder()
        .scheme("http")
        .authority(route.service)
        .path_and_query(path_and_query)
        .build()?;
    // The backend connection is always HTTP/1.1
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let upstream_host = domain.virtual_hostname.as_deref().unwrap_or(route.service);
    headers.insert(header::HOST, HeaderValue::from_str(upstream_host)?);
    headers.insert("x-forwarded-host", HeaderValue::from_str(&exchange.requested_host)?);
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if exchange.secure { "https" } else { "http" }),
    );

    // Applied last so they override anything above
    for (name, value) in &domain.hop_headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            warn!(domain = %domain.name, header = %name, "Invalid hop header name");
            continue;
        };
        if value.is_empty() {
            headers.remove(&name);
        } else {
            headers.insert(name, HeaderValue::from_str(value)?);
        }
    }

    Ok(Request::from_parts(parts, body))
}

fn apply_cors(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
}

fn apply_preflight(headers: &mut HeaderMap, request: &HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    let allowed = request
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("Authorization, Content-Type"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allowed);
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
}

fn redirect(status: StatusCode, location: &str) -> Response<Body> {
    match HeaderValue::from_str(location) {
        Ok(location) => (status, [(header::LOCATION, location)]).into_response(),
        Err(_) => {
            error!(location, "Invalid redirect location");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn bad_gateway() -> Response<Body> {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

/// Host of the request, from the Host header or the HTTP/2 authority
fn request_host(req: &Request) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_string()
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::Monitoring;
    use crate::routing::RoutingTable;
    use crate::settings::Settings;
    use arc_swap::ArcSwap;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(settings: &str) -> Arc<ProxyState> {
        let settings = Settings::parse(settings).unwrap();
        let table = RoutingTable::build(&settings, "test").unwrap();
        let routing = Arc::new(ArcSwap::from_pointee(table));
        Arc::new(
            ProxyState::new(
                routing,
                Arc::new(Monitoring::disabled()),
                None,
                Duration::from_secs(5),
            )
            .unwrap(),
        )
    }

    const SETTINGS: &str = r#"
[acme]
email = "admin@example.com"

[domains.web]
hostname = "www.example.com"
service = "127.0.0.1:9"
virtual_hostname = "web.internal"
hop_headers = { "X-Secret" = "", "X-Env" = "prod" }

[[domains.web.paths]]
match = "/open"
allow_insecure = true
"#;

    #[tokio::test]
    async fn test_health_before_lookup() {
        let router = secure_router(test_state(SETTINGS));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("host", "unknown.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_unknown_host_404() {
        let router = secure_router(test_state(SETTINGS));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("host", "unknown.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_insecure_upgrade() {
        let router = insecure_router(test_state(SETTINGS));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/a/b?x=1")
                    .header("host", "www.example.com:80")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://www.example.com/a/b?x=1"
        );
    }

    #[test]
    fn test_rewrite_request_headers() {
        let settings = Settings::parse(SETTINGS).unwrap();
        let table = RoutingTable::build(&settings, "test").unwrap();
        let domain = table.lookup("www.example.com").unwrap();
        let route = domain.resolve("/x");

        let req = Request::builder()
            .uri("/x?y=2")
            .header("host", "WWW.Example.com:8443")
            .header("x-secret", "client supplied")
            .header("connection", "keep-alive, x-drop")
            .header("x-drop", "1")
            .header("te", "trailers")
            .body(Body::empty())
            .unwrap();
        let exchange = Exchange::new(&req, "www.example.com", "WWW.Example.com:8443", true);
        let out = rewrite_request(req, domain, &route, &exchange).unwrap();

        assert_eq!(out.uri().to_string(), "http://127.0.0.1:9/x?y=2");
        let h = out.headers();
        assert_eq!(h[header::HOST], "web.internal");
        assert_eq!(h["x-forwarded-host"], "WWW.Example.com:8443");
        assert_eq!(h["x-forwarded-proto"], "https");
        assert_eq!(h["x-env"], "prod");
        assert!(h.get("x-secret").is_none());
        assert!(h.get("x-drop").is_none());
        assert!(h.get("connection").is_none());
        assert!(h.get("te").is_none());
    }
}
