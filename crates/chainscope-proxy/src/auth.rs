//! Request authentication for the proxy.
//!
//! Two variants of one capability: capability tokens (embedded mode) and
//! JWTs validated against a remote JWKS (standalone deployment). The variant
//! is chosen once at construction; swapping modes requires a restart.
//!
//! Every failure surfaces to clients as a 401 with the same generic body —
//! which check failed is logged, never disclosed.

use std::sync::Arc;

use thiserror::Error;

use crate::jwt::{JwtClaims, JwtValidator};
use crate::tokens::TokenStore;

/// Generic body returned on every authentication failure.
pub const UNAUTHORIZED_BODY: &str = "invalid or expired token";

/// Identity attached to an authenticated request.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Stable caller identity: the JWT subject, or the execution id in token
    /// mode.
    pub user_id: String,
    /// Execution id, token mode only.
    pub execution_id: Option<String>,
    /// Caller email, JWT mode only.
    pub email: Option<String>,
    /// Full claims, JWT mode only.
    pub claims: Option<JwtClaims>,
}

/// Why authentication failed. Detail is for logs; clients always see
/// [`UNAUTHORIZED_BODY`].
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("missing Authorization header")]
    MissingHeader,

    /// Header present but not `Bearer <token>`.
    #[error("invalid Authorization header format")]
    MalformedHeader,

    /// The bearer token did not validate.
    #[error("token validation failed: {0}")]
    InvalidToken(String),
}

/// Authenticator variants.
pub enum Authenticator {
    /// Per-execution capability tokens (embedded proxy).
    Token(Arc<TokenStore>),
    /// JWTs verified against a JWKS (standalone deployment).
    Jwt(Arc<JwtValidator>),
}

impl Authenticator {
    /// Mode name for logging.
    pub fn mode(&self) -> &'static str {
        match self {
            Authenticator::Token(_) => "token",
            Authenticator::Jwt(_) => "jwt",
        }
    }

    /// Start background work (token sweeper / JWKS refresher).
    ///
    /// Fatal when the JWT validator cannot complete its initial JWKS fetch.
    pub async fn start(&self) -> anyhow::Result<()> {
        match self {
            Authenticator::Token(store) => {
                store.start();
                Ok(())
            }
            Authenticator::Jwt(validator) => {
                validator.start().await?;
                Ok(())
            }
        }
    }

    /// Stop background work. Idempotent.
    pub async fn stop(&self) {
        match self {
            Authenticator::Token(store) => store.stop().await,
            Authenticator::Jwt(validator) => validator.stop().await,
        }
    }

    /// Authenticate a request from its headers.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<AuthContext, AuthError> {
        let auth = headers
            .get(http::header::AUTHORIZATION)
            .ok_or(AuthError::MissingHeader)?
            .to_str()
            .map_err(|_| AuthError::MalformedHeader)?;

        let token = auth
            .strip_prefix("Bearer ")
            .ok_or(AuthError::MalformedHeader)?;

        match self {
            Authenticator::Token(store) => {
                let execution_id = store
                    .validate(token)
                    .ok_or_else(|| AuthError::InvalidToken("unknown or expired token".into()))?;

                Ok(AuthContext {
                    // The execution id doubles as the user id for consistent
                    // keying downstream.
                    user_id: execution_id.clone(),
                    execution_id: Some(execution_id),
                    email: None,
                    claims: None,
                })
            }
            Authenticator::Jwt(validator) => {
                let claims = validator
                    .validate(token)
                    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

                Ok(AuthContext {
                    user_id: claims.subject.clone(),
                    execution_id: None,
                    email: Some(claims.email.clone()),
                    claims: Some(claims),
                })
            }
        }
    }
}
