//! External authentication and redirect services

use axum::body::Bytes;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Outcome of an authentication check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    /// Forward the auth service response to the client
    Deny { status: StatusCode, body: Bytes },
    /// Send the client to this location
    Redirect(String),
}

#[derive(Serialize)]
struct RedirectRequest<'a> {
    source: &'a str,
}

#[derive(Deserialize)]
struct RedirectResponse {
    #[serde(default)]
    destination: String,
}

/// HTTP client for the auth and redirect collaborators
#[derive(Clone)]
pub struct ExternalClient {
    http: reqwest::Client,
}

impl ExternalClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Http(e.to_string()))?;
        Ok(Self { http })
    }

    /// Ask the auth service whether the request may proceed
    pub async fn authorize(
        &self,
        endpoint: &str,
        hostname: &str,
        url: &str,
        authorization: &str,
    ) -> Result<AuthDecision> {
        let response = self
            .http
            .get(endpoint)
            .query(&[
                ("hostname", hostname),
                ("url", url),
                ("authorization", authorization),
            ])
            .send()
            .await
            .map_err(|e| external("auth", e))?;

        let status = response.status();
        debug!(hostname, status = status.as_u16(), "Auth service answered");

        match status {
            StatusCode::OK => Ok(AuthDecision::Allow),
            StatusCode::FORBIDDEN => {
                let body = response.bytes().await.map_err(|e| external("auth", e))?;
                Ok(AuthDecision::Deny { status, body })
            }
            StatusCode::FOUND => {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|l| l.to_str().ok())
                    .ok_or_else(|| external("auth", "redirect without location"))?;
                Ok(AuthDecision::Redirect(location.to_string()))
            }
            other => Err(external("auth", format!("unexpected status {}", other))),
        }
    }

    /// Ask the redirect service for a new location of `source`.
    ///
    /// Returns `None` when the URL stays where it is.
    pub async fn rewrite(&self, endpoint: &str, source: &str) -> Result<Option<String>> {
        let response = self
            .http
            .post(endpoint)
            .json(&RedirectRequest { source })
            .send()
            .await
            .map_err(|e| external("redirects", e))?;

        if !response.status().is_success() {
            return Err(external(
                "redirects",
                format!("unexpected status {}", response.status()),
            ));
        }

        let reply: RedirectResponse = response.json().await.map_err(|e| external("redirects", e))?;
        if reply.destination.is_empty() || reply.destination == source {
            return Ok(None);
        }
        Ok(Some(reply.destination))
    }
}

fn external(service: &'static str, err: impl std::fmt::Display) -> ProxyError {
    ProxyError::External {
        service,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> ExternalClient {
        ExternalClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_authorize_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/check"))
            .and(query_param("hostname", "ok.example.com"))
            .and(query_param("url", "https://ok.example.com/x"))
            .and(query_param("authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("hostname", "deny.example.com"))
            .respond_with(ResponseTemplate::new(403).set_body_string("nope"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("hostname", "login.example.com"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "https://sso.test/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("hostname", "broken.example.com"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let endpoint = format!("{}/check", server.uri());
        let c = client();

        assert_eq!(
            c.authorize(&endpoint, "ok.example.com", "https://ok.example.com/x", "Bearer t")
                .await
                .unwrap(),
            AuthDecision::Allow
        );
        assert_eq!(
            c.authorize(&endpoint, "deny.example.com", "u", "").await.unwrap(),
            AuthDecision::Deny {
                status: StatusCode::FORBIDDEN,
                body: Bytes::from_static(b"nope"),
            }
        );
        assert_eq!(
            c.authorize(&endpoint, "login.example.com", "u", "").await.unwrap(),
            AuthDecision::Redirect("https://sso.test/".to_string())
        );
        assert!(c.authorize(&endpoint, "broken.example.com", "u", "").await.is_err());
    }

    #[tokio::test]
    async fn test_rewrite() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({"source": "https://a.test/old"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"destination": "https://a.test/new"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({"source": "https://a.test/same"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"destination": "https://a.test/same"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({"source": "https://a.test/none"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let c = client();
        let endpoint = server.uri();
        assert_eq!(
            c.rewrite(&endpoint, "https://a.test/old").await.unwrap(),
            Some("https://a.test/new".to_string())
        );
        assert_eq!(c.rewrite(&endpoint, "https://a.test/same").await.unwrap(), None);
        assert_eq!(c.rewrite(&endpoint, "https://a.test/none").await.unwrap(), None);
    }
}
