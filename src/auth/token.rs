//! Signed bearer tokens (HS256 JWT).

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Role;
use crate::error::ApiError;

/// Token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly signed token and when it stops being valid.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signing and verification keys, derived once from the configured secret.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn issue(&self, user_id: Uuid, role: Role) -> Result<IssuedToken, ApiError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ApiError::internal(format!("token ttl out of range: {e}")))?;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| ApiError::internal("token expiry out of range"))?;
        let token = self.issue_until(user_id, role, expires_at)?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Signs a token expiring at an explicit instant.
    pub fn issue_until(
        &self,
        user_id: Uuid,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user_id,
            role,
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ApiError::internal(format!("failed to sign token: {e}")))
    }

    /// Checks signature and expiry.
    ///
    /// Expiry is reported as [`ApiError::ExpiredCredential`]; every other
    /// failure (bad signature, malformed token, wrong algorithm) as
    /// [`ApiError::InvalidCredential`].
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ApiError::ExpiredCredential,
                _ => ApiError::InvalidCredential,
            })
    }
}
