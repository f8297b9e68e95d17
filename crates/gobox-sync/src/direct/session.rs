//! Session credentials for the direct channel.
//!
//! Issued once a temporary credential is redeemed; every later direct
//! request presents it as `Authorization: Bearer <token>` or in the
//! `gobox_session` cookie.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// `token_type` claim of every direct session token.
pub const SESSION_TOKEN_TYPE: &str = "direct_session";

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "gobox_session";

/// Session token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Who the session was issued to.
    pub sub: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// Unique token id
    pub jti: String,

    pub token_type: String,
}

/// HS256 signer and validator for session tokens.
pub struct SessionSigner {
    secret: Vec<u8>,
    lifetime: Duration,
}

impl SessionSigner {
    pub fn new(secret: impl Into<Vec<u8>>, lifetime: std::time::Duration) -> Self {
        SessionSigner {
            secret: secret.into(),
            lifetime: Duration::from_std(lifetime).unwrap_or_else(|_| Duration::hours(1)),
        }
    }

    /// Signer with a random per-process secret.
    pub fn random(lifetime: std::time::Duration) -> Self {
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self::new(secret, lifetime)
    }

    /// Issues a session token for `subject`.
    pub fn issue(&self, subject: &str) -> SyncResult<String> {
        self.issue_at(subject, Utc::now())
    }

    fn issue_at(&self, subject: &str, now: DateTime<Utc>) -> SyncResult<String> {
        let claims = SessionClaims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type: SESSION_TOKEN_TYPE.to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| SyncError::Internal(format!("Failed to sign session token: {}", e)))
    }

    /// Checks signature, expiry and token type. Never retried by callers.
    pub fn validate(&self, token: &str) -> SyncResult<SessionClaims> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        let token_data: TokenData<SessionClaims> = decode(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|e| SyncError::Unauthorized(format!("Invalid session token: {}", e)))?;

        if token_data.claims.token_type != SESSION_TOKEN_TYPE {
            return Err(SyncError::Unauthorized(
                "Expected a direct session token".to_string(),
            ));
        }
        Ok(token_data.claims)
    }
}

/// Extracts the token from a bearer `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}

/// Extracts the session token from a `Cookie` header value.
pub fn cookie_token(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}

/// `Set-Cookie` value handing `token` to a browser-style client.
pub fn session_cookie(token: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict",
        SESSION_COOKIE, token
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> SessionSigner {
        SessionSigner::new("test-secret", std::time::Duration::from_secs(600))
    }

    #[test]
    fn test_issue_and_validate() {
        let signer = signer();
        let token = signer.issue("client-1").unwrap();
        let claims = signer.validate(&token).unwrap();
        assert_eq!(claims.sub, "client-1");
        assert_eq!(claims.token_type, SESSION_TOKEN_TYPE);
        assert_eq!(claims.exp - claims.iat, 600);
    }

    #[test]
    fn test_rejects_foreign_and_expired_tokens() {
        let token = signer().issue("client-1").unwrap();
        let other = SessionSigner::new("another-secret", std::time::Duration::from_secs(600));
        assert!(matches!(other.validate(&token), Err(SyncError::Unauthorized(_))));

        let stale = signer()
            .issue_at("client-1", Utc::now() - Duration::hours(2))
            .unwrap();
        assert!(matches!(signer().validate(&stale), Err(SyncError::Unauthorized(_))));

        assert!(signer().validate("not-a-token").is_err());
    }

    #[test]
    fn test_header_extraction() {
        assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_token("Basic xyz"), None);
        assert_eq!(cookie_token("theme=dark; gobox_session=tok; x=1"), Some("tok"));
        assert_eq!(cookie_token("theme=dark"), None);
        assert!(session_cookie("tok").starts_with("gobox_session=tok;"));
    }
}
