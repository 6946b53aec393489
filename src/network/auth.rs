//! JWT Identity Verification
//!
//! Validates tokens from external auth providers. The server never
//! issues tokens; when no secret or key is configured, identification
//! is accepted on the claimed username alone.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format (external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if token verification is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Standard JWT claims we expect from auth providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, which must match the username the client claims.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (auth provider).
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Verification is configured but no token was supplied.
    #[error("token required")]
    TokenRequired,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// The token subject doesn't match the claimed username.
    #[error("token subject does not match username")]
    SubjectMismatch,
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Verify a client's claimed identity. Without configured keys any
/// username is accepted; with them, a token whose subject matches the
/// username is required.
pub fn verify_identity(
    username: &str,
    token: Option<&str>,
    config: &AuthConfig,
) -> Result<(), AuthError> {
    if !config.is_configured() {
        return Ok(());
    }
    let token = token.ok_or(AuthError::TokenRequired)?;
    let claims = validate_token(token, config)?;
    if claims.sub != username {
        return Err(AuthError::SubjectMismatch);
    }
    Ok(())
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {e}")))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::TokenRequired);
    };

    let claims = token_data.claims;
    if claims.sub.is_empty() {
        return Err(AuthError::DecodeError("empty sub claim".into()));
    }

    // Manual expiry check covers tokens that omit exp from validation.
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn claims_for(sub: &str) -> TokenClaims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        TokenClaims {
            sub: sub.into(),
            exp: now + 3600,
            iat: now,
            iss: Some("test-issuer".into()),
            aud: Some(serde_json::json!("test-audience")),
        }
    }

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn hs_config() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    #[test]
    fn unconfigured_accepts_any_username() {
        let config = AuthConfig::default();
        assert!(verify_identity("alice", None, &config).is_ok());
    }

    #[test]
    fn configured_requires_token() {
        let result = verify_identity("alice", None, &hs_config());
        assert!(matches!(result, Err(AuthError::TokenRequired)));
    }

    #[test]
    fn matching_subject_accepted() {
        let token = sign(&claims_for("alice"), SECRET);
        assert!(verify_identity("alice", Some(&token), &hs_config()).is_ok());
    }

    #[test]
    fn mismatched_subject_rejected() {
        let token = sign(&claims_for("mallory"), SECRET);
        let result = verify_identity("alice", Some(&token), &hs_config());
        assert!(matches!(result, Err(AuthError::SubjectMismatch)));
    }

    #[test]
    fn expired_token_rejected() {
        let mut claims = claims_for("alice");
        claims.exp = 1;
        let token = sign(&claims, SECRET);
        let result = validate_token(&token, &hs_config());
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = sign(&claims_for("alice"), "some-other-secret-key!!!!!!!");
        let result = validate_token(&token, &hs_config());
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn issuer_mismatch_rejected() {
        let token = sign(&claims_for("alice"), SECRET);
        let config = AuthConfig {
            issuer: Some("wrong-issuer".into()),
            ..hs_config()
        };
        let result = validate_token(&token, &config);
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn skip_expiry_accepts_stale_token() {
        let mut claims = claims_for("alice");
        claims.exp = 1;
        let token = sign(&claims, SECRET);
        let config = AuthConfig {
            skip_expiry: true,
            ..hs_config()
        };
        assert!(validate_token(&token, &config).is_ok());
    }
}
