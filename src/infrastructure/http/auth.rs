//! Bearer-token middleware
//!
//! Every API route is gated on a shared-secret bearer token unless
//! authentication was disabled in configuration. The health endpoint is not
//! behind this layer.

use axum::{
    extract::{Request, State},
    http::header::{AUTHORIZATION, WWW_AUTHENTICATE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::infrastructure::http::server::AppState;
use crate::infrastructure::http::types::ApiError;

/// Immutable auth policy derived from configuration at startup.
#[derive(Clone)]
pub struct AuthSettings {
    token: Option<std::sync::Arc<str>>,
    disabled: bool,
}

impl AuthSettings {
    /// Build the policy. Disabling auth is a deliberate configuration
    /// choice; the caller logs it at startup.
    pub fn new(token: Option<String>, disabled: bool) -> Self {
        Self {
            token: token.map(Into::into),
            disabled,
        }
    }

    /// Whether token checks are bypassed entirely.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn authorized(&self, header: Option<&str>) -> bool {
        if self.disabled {
            return true;
        }
        let Some(expected) = self.token.as_deref() else {
            // Enabled but no secret configured: nothing can match.
            return false;
        };
        let Some(provided) = header.and_then(|value| value.strip_prefix("Bearer ")) else {
            return false;
        };
        token_eq(provided, expected)
    }
}

/// Compare tokens without short-circuiting on the first mismatched byte.
fn token_eq(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Middleware gating API routes on the bearer token.
pub async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if state.auth.authorized(header) {
        return next.run(request).await;
    }

    debug!(path = %request.uri().path(), "rejecting unauthenticated request");
    let mut response = ApiError::unauthorized().into_response();
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        axum::http::HeaderValue::from_static("Bearer"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_auth_accepts_anything() {
        let auth = AuthSettings::new(None, true);
        assert!(auth.authorized(None));
        assert!(auth.authorized(Some("Bearer whatever")));
    }

    #[test]
    fn enabled_auth_requires_exact_token() {
        let auth = AuthSettings::new(Some("s3cret".to_string()), false);
        assert!(auth.authorized(Some("Bearer s3cret")));
        assert!(!auth.authorized(Some("Bearer wrong")));
        assert!(!auth.authorized(Some("s3cret")));
        assert!(!auth.authorized(None));
    }

    #[test]
    fn enabled_auth_without_secret_rejects_all() {
        let auth = AuthSettings::new(None, false);
        assert!(!auth.authorized(Some("Bearer anything")));
        assert!(!auth.authorized(None));
    }

    #[test]
    fn token_eq_rejects_prefixes() {
        assert!(!token_eq("s3c", "s3cret"));
        assert!(!token_eq("s3cret0", "s3cret"));
        assert!(token_eq("s3cret", "s3cret"));
    }
}
