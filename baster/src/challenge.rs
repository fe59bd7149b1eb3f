//! HTTP-01 challenge responder
//!
//! Key authorizations are published in the shared cache under
//! `token.<token>`, so whichever replica receives the validation request can
//! answer it.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};

use crate::proxy::Dispatch;

/// Route of the challenge responder on the plain HTTP listener
pub const CHALLENGE_ROUTE: &str = "/.well-known/acme-challenge/:token";

/// Cache key of a challenge token
pub fn token_key(token: &str) -> String {
    format!("token.{}", token)
}

/// Answer `GET /.well-known/acme-challenge/<token>`
pub async fn challenge_handler(
    State(dispatch): State<Dispatch>,
    Path(token): Path<String>,
) -> Response {
    let Some(acme) = dispatch.state.acme.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match acme.challenge_response(&token).await {
        Ok(Some(key_authorization)) => {
            info!(token = %token, "Answering ACME challenge");
            (
                [(header::CONTENT_TYPE, "text/plain")],
                Body::from(key_authorization),
            )
                .into_response()
        }
        Ok(None) => {
            warn!(token = %token, "Unknown ACME challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            error!(token = %token, error = %e, "Cannot read ACME challenge token");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
