//! Bearer-token authentication for the dashboard.
//!
//! Tokens are HS256 JWTs minted by `vault-workflow token`. When no secret is
//! configured the API is open.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vault_common::config::AuthConfig;
use vault_common::{Error, Result};

use crate::routes::ApiError;

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (reviewer name)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
    pub roles: Vec<String>,
}

/// Signing state shared across requests.
#[derive(Clone)]
pub struct AuthState {
    pub jwt_secret: Arc<String>,
    pub token_expiry_secs: u64,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("token_expiry_secs", &self.token_expiry_secs)
            .finish_non_exhaustive()
    }
}

impl AuthState {
    pub fn new(jwt_secret: impl Into<String>, token_expiry_secs: u64) -> Self {
        Self {
            jwt_secret: Arc::new(jwt_secret.into()),
            token_expiry_secs,
        }
    }

    /// `None` when no secret is configured.
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        config
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| Self::new(secret, config.token_expiry_secs))
    }

    /// Mint a token for `subject`.
    pub fn generate_token(&self, subject: &str, roles: Vec<String>) -> Result<String> {
        let now = chrono::Utc::now().timestamp() as usize;
        let exp = now + self.token_expiry_secs as usize;

        let claims = Claims {
            sub: subject.to_string(),
            exp,
            iat: now,
            roles,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| Error::Auth(format!("cannot sign token: {e}")))
    }

    /// Validate a token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| Error::Auth(format!("invalid token: {e}")))
    }
}

/// Reviewer identity attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub subject: String,
    pub roles: Vec<String>,
}

/// Require `Authorization: Bearer <jwt>` when a secret is configured.
pub async fn auth_middleware(
    State(auth): State<Option<AuthState>>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let Some(auth) = auth else {
        return Ok(next.run(request).await);
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| Error::Auth("missing bearer token".into()))?;

    let claims = auth.validate_token(&token)?;
    request.extensions_mut().insert(AuthUser {
        subject: claims.sub,
        roles: claims.roles,
    });
    Ok(next.run(request).await)
}
