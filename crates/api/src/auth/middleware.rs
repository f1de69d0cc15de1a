//! Basic-auth middleware for provider webhooks

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use subtle::ConstantTimeEq;

use crate::error::ApiError;

/// Shared secret the billing provider presents on every webhook
#[derive(Clone)]
pub struct WebhookCredentials {
    username: String,
    password: String,
}

impl std::fmt::Debug for WebhookCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl WebhookCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check an `Authorization: Basic ...` header value.
    ///
    /// Both halves are always compared so timing does not reveal which one
    /// was wrong.
    pub fn verify_header(&self, value: &str) -> bool {
        let Some((scheme, encoded)) = value.split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return false;
        };

        let username_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let password_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        (username_ok & password_ok).into()
    }
}

/// Middleware that rejects webhooks without valid credentials
pub async fn require_webhook_auth(
    State(credentials): State<WebhookCredentials>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|value| credentials.verify_header(value))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Webhook authentication failed");
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}
