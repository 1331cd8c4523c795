//! Shared-token authentication.
//!
//! Every endpoint, the WebSocket upgrade included, requires an `Auth-Token`
//! header equal to the configured token. A missing or wrong token is answered
//! exactly like an unknown tunnel (`404`), so probing reveals nothing about
//! which tunnels exist.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Header carrying the shared token.
pub const AUTH_HEADER: &str = "auth-token";

/// Axum middleware that rejects requests whose `Auth-Token` header does not
/// match the [`AuthToken`] extension.
///
/// A missing extension is a wiring bug and answers `500`.
pub async fn require_token(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<AuthToken>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "server configuration error\n",
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if !constant_time_eq(expected.0.as_bytes(), provided) {
        return (StatusCode::NOT_FOUND, "not found\n").into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension carrying the expected token, layered onto the router so
/// [`require_token`] can read it without touching `AppState`.
#[derive(Clone)]
pub struct AuthToken(pub String);
