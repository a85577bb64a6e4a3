//! HMAC-signed access and refresh token issuance and verification.

use chrono::{DateTime, Utc};
use jwt_simple::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::error::AuthError;

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformClaims {
    pub token_type: TokenKind,
}

#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub user_id: Uuid,
    pub kind: TokenKind,
    pub token_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenIssuer {
    key: HS256Key,
    pub access_token_expiry: u64,
    pub refresh_token_expiry: u64,
    pub issuer: String,
    pub audience: String,
    clock_skew_secs: u64,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], config: &JwtConfig) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::Validation(format!(
                "JWT secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        Ok(Self {
            key: HS256Key::from_bytes(secret),
            access_token_expiry: config.access_token_expiry_secs,
            refresh_token_expiry: config.refresh_token_expiry_secs,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            clock_skew_secs: config.clock_skew_secs,
        })
    }

    /// Accepts either a raw secret or one prefixed with `base64:`.
    pub fn from_config(config: &JwtConfig) -> Result<Self, AuthError> {
        use base64::Engine;

        let secret = match config.secret.strip_prefix("base64:") {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| AuthError::Validation(format!("JWT secret is not base64: {}", e)))?,
            None => config.secret.as_bytes().to_vec(),
        };

        Self::new(&secret, config)
    }

    pub fn issue_pair(&self, user_id: Uuid) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let access_token = self.sign(user_id, TokenKind::Access, self.access_token_expiry)?;
        let refresh_token = self.sign(user_id, TokenKind::Refresh, self.refresh_token_expiry)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at: now + chrono::Duration::seconds(self.access_token_expiry as i64),
            refresh_expires_at: now + chrono::Duration::seconds(self.refresh_token_expiry as i64),
        })
    }

    fn sign(&self, user_id: Uuid, kind: TokenKind, lifetime_secs: u64) -> Result<String, AuthError> {
        let claims = Claims::with_custom_claims(
            PlatformClaims { token_type: kind },
            Duration::from_secs(lifetime_secs),
        )
        .with_subject(user_id)
        .with_issuer(&self.issuer)
        .with_audience(&self.audience)
        .with_jwt_id(Uuid::new_v4());

        self.key
            .authenticate(claims)
            .map_err(|e| AuthError::internal("sign token", e))
    }

    /// Fails closed: any decoding, signature, claim or type mismatch is `InvalidToken`.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<VerifiedToken, AuthError> {
        let options = VerificationOptions {
            allowed_issuers: Some(HashSet::from([self.issuer.clone()])),
            allowed_audiences: Some(HashSet::from([self.audience.clone()])),
            time_tolerance: Some(Duration::from_secs(self.clock_skew_secs)),
            ..Default::default()
        };

        let claims = self
            .key
            .verify_token::<PlatformClaims>(token, Some(options))
            .map_err(|e| {
                debug!(error = %e, "Token verification failed");
                AuthError::InvalidToken
            })?;

        if claims.custom.token_type != expected {
            debug!(
                expected = expected.as_str(),
                actual = claims.custom.token_type.as_str(),
                "Token type mismatch"
            );
            return Err(AuthError::InvalidToken);
        }

        let user_id = claims
            .subject
            .as_deref()
            .and_then(|sub| Uuid::parse_str(sub).ok())
            .ok_or(AuthError::InvalidToken)?;

        Ok(VerifiedToken {
            user_id,
            kind: claims.custom.token_type,
            token_id: claims.jwt_id.unwrap_or_default(),
            issued_at: claims.issued_at.map(|t| t.as_secs() as i64).unwrap_or(0),
            expires_at: claims.expires_at.map(|t| t.as_secs() as i64).unwrap_or(0),
        })
    }

    pub fn verify_access_token(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        self.verify(token, TokenKind::Refresh)
    }
}
