use axum::http::HeaderMap;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use uuid::Uuid;

use huddle_types::api::Claims;

/// Verified identity bound to a request or a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no bearer credential supplied")]
    Missing,
    #[error("credential is invalid")]
    Invalid,
    #[error("credential has expired")]
    Expired,
}

/// Validates a signed bearer credential. Issuance and refresh live elsewhere.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, CredentialError>;
}

/// HS256 JWT credentials.
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a credential. Used by tooling and tests; production tokens come
    /// from the identity service sharing the same secret.
    pub fn issue(&self, user_id: Uuid, username: &str, ttl: Duration) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (Utc::now() + ttl).timestamp().max(0) as usize,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, CredentialError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Invalid,
            }
        })?;

        let expires_at = DateTime::<Utc>::from_timestamp(data.claims.exp as i64, 0)
            .ok_or(CredentialError::Invalid)?;

        Ok(Identity {
            user_id: data.claims.sub,
            username: data.claims.username,
            expires_at,
        })
    }
}

/// Bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// Handshake check: header first, then the `token` query parameter that
/// browser WebSocket clients have to fall back on.
///
/// Unlike REST calls, the handshake gets no expiry leeway: a connection
/// is closed with 4001 as soon as its credential runs out.
pub fn authenticate(
    verifier: &dyn CredentialVerifier,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Identity, CredentialError> {
    let token = bearer_token(headers)
        .or_else(|| query_token.map(str::to_string))
        .filter(|t| !t.is_empty())
        .ok_or(CredentialError::Missing)?;
    let identity = verifier.verify(&token)?;
    if identity.expires_at <= Utc::now() {
        return Err(CredentialError::Expired);
    }
    Ok(identity)
}
