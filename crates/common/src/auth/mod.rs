//! Authentication and authorization utilities
//!
//! Provides:
//! - API key generation and hashing
//! - JWT token generation and validation
//! - Principal extraction for axum handlers

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::errors::{AppError, Result};
use crate::store::ApiKeyStore;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, HeaderMap, HeaderName},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Prefix carried by every generated API key
pub const API_KEY_PREFIX: &str = "bsy_";

/// How the principal proved its identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Jwt,
    ApiKey { key_id: String },
}

/// Authenticated principal available to handlers
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Owning user for every store operation
    pub user_id: String,

    pub method: AuthMethod,

    /// Request ID for tracing
    pub request_id: String,
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,

    /// Issuer
    pub iss: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,
}

/// JWT token manager (HS512)
///
/// Issue and expiry times both come from the injected clock.
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_secs: i64,
    issuer: String,
    clock: Arc<dyn Clock>,
}

impl JwtManager {
    /// Create a new JWT manager with the given secret
    pub fn new(secret: &str, expiration_secs: u64, issuer: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration_secs: i64::try_from(expiration_secs).unwrap_or(i64::MAX),
            issuer: issuer.to_string(),
            clock,
        }
    }

    /// Generate a new JWT token for a user
    pub fn generate_token(&self, user_id: &str) -> Result<String> {
        let now = self.clock.now();
        let exp = Duration::try_seconds(self.expiration_secs)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let claims = JwtClaims {
            sub: user_id.to_string(),
            iss: self.issuer.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS512), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal {
                message: format!("Failed to generate token: {}", e),
            })
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<JwtClaims> {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        // Expiry is checked below against the injected clock
        validation.validate_exp = false;

        let claims = decode::<JwtClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| AppError::Unauthorized {
                message: "Invalid bearer token".to_string(),
            })?;

        if claims.exp <= self.clock.now().timestamp() {
            return Err(AppError::ExpiredToken);
        }
        Ok(claims)
    }
}

/// Hash an API key for storage
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new API key from 32 bytes of OS randomness
pub fn generate_api_key() -> String {
    let mut random_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut random_bytes);
    format!("{}{}", API_KEY_PREFIX, hex::encode(random_bytes))
}

/// Extract the token from an `Authorization: Bearer ...` header value
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolves request credentials to a principal
pub struct Authenticator {
    jwt: JwtManager,
    api_keys: Arc<dyn ApiKeyStore>,
    clock: Arc<dyn Clock>,
    api_key_header: HeaderName,
}

impl Authenticator {
    pub fn new(
        config: &AuthConfig,
        secret: &str,
        api_keys: Arc<dyn ApiKeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let api_key_header = HeaderName::from_bytes(config.api_key_header.as_bytes())
            .map_err(|e| AppError::Configuration {
                message: format!("Invalid API key header name: {}", e),
            })?;

        Ok(Self {
            jwt: JwtManager::new(
                secret,
                config.jwt_expiration_secs,
                &config.jwt_issuer,
                clock.clone(),
            ),
            api_keys,
            clock,
            api_key_header,
        })
    }

    pub fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    /// Try every presented credential; the first valid one wins
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<(String, AuthMethod)> {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer);
        let api_key = headers
            .get(&self.api_key_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty());

        let mut failure = AppError::Unauthorized {
            message: "Missing credentials".to_string(),
        };

        if let Some(token) = bearer {
            match self.jwt.validate_token(token) {
                Ok(claims) => return Ok((claims.sub, AuthMethod::Jwt)),
                Err(e) => failure = e,
            }
        }

        if let Some(key) = api_key {
            match self.api_keys.get_by_key(key).await {
                Ok(found) => {
                    if let Err(e) = self.api_keys.touch(&found.id, self.clock.now()).await {
                        tracing::warn!(error = %e, key_id = %found.id, "Failed to record API key use");
                    }
                    return Ok((found.user_id, AuthMethod::ApiKey { key_id: found.id }));
                }
                Err(e) if e.is_not_found() => failure = AppError::InvalidApiKey,
                Err(e) => return Err(e),
            }
        }

        Err(failure)
    }
}

/// Axum extractor for AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    Arc<Authenticator>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let authenticator = Arc::<Authenticator>::from_ref(state);
        let (user_id, method) = authenticator.authenticate(&parts.headers).await?;

        tracing::debug!(user_id = %user_id, method = ?method, request_id = %request_id, "Authenticated");

        Ok(AuthContext {
            user_id,
            method,
            request_id,
        })
    }
}
