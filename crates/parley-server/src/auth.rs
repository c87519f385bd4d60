//! Admission authentication.
//!
//! Every HTTP surface, including the websocket upgrade, resolves the caller
//! to a verified `Identity` before doing anything else. The bearer token is
//! read from the `Authorization` header, or from the `token` query parameter
//! for browser websocket clients that cannot set headers.

use crate::config::AuthConfig;
use crate::handlers::AppState;
use crate::metrics;
use async_trait::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use parley_core::Identity;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token in the header or query.
    #[error("missing bearer token")]
    MissingToken,

    /// Token was present but not accepted.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token has expired.
    #[error("token has expired")]
    Expired,

    /// Token verified but names no user.
    #[error("token has no subject")]
    NoSubject,
}

impl AuthError {
    /// Short label for metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing",
            AuthError::InvalidToken(_) => "invalid",
            AuthError::Expired => "expired",
            AuthError::NoSubject => "no_subject",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": "UNAUTHORIZED",
            "message": self.to_string(),
        });
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(body),
        )
            .into_response()
    }
}

/// Resolves a bearer token to a verified identity.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Verify `token`.
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// JWT claims carried by an access token.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
}

/// Verifies HS256 JWTs and takes the user id from the `sub` claim.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create an authenticator for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 5;

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => {
                    AuthError::InvalidToken("bad signature".to_string())
                }
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::NoSubject);
        }
        Ok(Identity::verified(data.claims.sub))
    }
}

/// Looks tokens up in a fixed table.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    /// Create an authenticator from a token to user id table.
    #[must_use]
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .map(Identity::verified)
            .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))
    }
}

/// Build the authenticator selected by configuration.
#[must_use]
pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match &config.jwt_secret {
        Some(secret) => {
            debug!("Using JWT authentication");
            Arc::new(JwtAuthenticator::new(secret))
        }
        None => {
            if config.tokens.is_empty() {
                warn!("No JWT secret and no static tokens configured; every client will be rejected");
            }
            Arc::new(StaticTokenAuthenticator::new(config.tokens.clone()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pick the bearer token from the headers, falling back to the query.
#[must_use]
pub fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    from_header
        .or(query_token.filter(|t| !t.is_empty()))
        .map(str::to_string)
}

/// Extractor for an authenticated caller.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();

        let result = match bearer_token(&parts.headers, query.token.as_deref()) {
            Some(token) => state.authenticator.authenticate(&token).await,
            None => Err(AuthError::MissingToken),
        };

        match result {
            Ok(identity) => Ok(Authenticated(identity)),
            Err(e) => {
                warn!(path = %parts.uri.path(), error = %e, "Authentication failed");
                metrics::record_auth_failure(e.reason());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: u64,
    }

    const FAR_FUTURE: u64 = 4_102_444_800; // 2100-01-01

    fn sign(secret: &str, sub: &str, exp: u64) -> String {
        encode(
            &Header::default(),
            &TestClaims { sub, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_jwt_subject_becomes_identity() {
        let auth = JwtAuthenticator::new("s3cret");
        let identity = auth.authenticate(&sign("s3cret", "u1", FAR_FUTURE)).await.unwrap();
        assert_eq!(identity.user_id(), "u1");
    }

    #[tokio::test]
    async fn test_jwt_rejects_wrong_secret() {
        let auth = JwtAuthenticator::new("s3cret");
        let result = auth.authenticate(&sign("other", "u1", FAR_FUTURE)).await;
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_jwt_rejects_expired() {
        let auth = JwtAuthenticator::new("s3cret");
        let result = auth.authenticate(&sign("s3cret", "u1", 1_000)).await;
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_jwt_rejects_empty_subject() {
        let auth = JwtAuthenticator::new("s3cret");
        let result = auth.authenticate(&sign("s3cret", "", FAR_FUTURE)).await;
        assert!(matches!(result, Err(AuthError::NoSubject)));
    }

    #[tokio::test]
    async fn test_jwt_rejects_garbage() {
        let auth = JwtAuthenticator::new("s3cret");
        assert!(auth.authenticate("not.a.jwt").await.is_err());
    }

    #[tokio::test]
    async fn test_static_tokens() {
        let auth = StaticTokenAuthenticator::new(HashMap::from([(
            "alice-token".to_string(),
            "u1".to_string(),
        )]));
        assert_eq!(auth.authenticate("alice-token").await.unwrap().user_id(), "u1");
        assert!(matches!(
            auth.authenticate("mallory").await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_prefers_jwt() {
        let config = AuthConfig {
            jwt_secret: Some("s3cret".to_string()),
            tokens: HashMap::from([("alice-token".to_string(), "u1".to_string())]),
        };
        let auth = from_config(&config);
        assert!(auth.authenticate("alice-token").await.is_err());
        assert!(auth.authenticate(&sign("s3cret", "u2", FAR_FUTURE)).await.is_ok());
    }

    #[test]
    fn test_bearer_token_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers, Some("xyz")).as_deref(), Some("abc"));
    }

    #[test]
    fn test_bearer_token_from_query() {
        let headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers, Some("xyz")).as_deref(), Some("xyz"));
        assert_eq!(bearer_token(&headers, Some("")), None);
        assert_eq!(bearer_token(&headers, None), None);
    }

    #[test]
    fn test_non_bearer_header_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dTE6cHc="));
        assert_eq!(bearer_token(&headers, None), None);
    }

    #[test]
    fn test_rejection_is_unauthorized() {
        let response = AuthError::MissingToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
