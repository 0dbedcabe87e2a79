//! Session token issuance and verification
//!
//! Tokens are HS256 JWTs carrying `sub`, `iat`, `exp` and a random `jti`.
//! Nothing is stored server-side: a token is valid if its signature checks out
//! against the process signing secret and the current time is before `exp`.
//! Expiry is evaluated here rather than by `jsonwebtoken` so the outcome can be
//! reported separately from a bad signature.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Lifetime of every issued session token
pub const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    iat: i64,
    exp: i64,
    jti: String,
}

/// Freshly signed token plus the timestamps it carries
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub identity: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of verifying a presented token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVerdict {
    /// Signature valid and not yet expired; carries the bound identity
    Valid(String),
    /// Signature valid but `now >= exp`
    Expired,
    /// Malformed, wrongly signed, or wrong algorithm
    Invalid,
}

/// Signs and verifies session tokens with one process-wide secret
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: TimeDelta,
}

impl TokenService {
    pub fn new(secret: &SecretString) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is still required to be present; its value is checked in `verify_at`.
        validation.validate_exp = false;
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            validation,
            ttl: TimeDelta::hours(SESSION_TTL_HOURS),
        }
    }

    pub fn issue(&self, identity: &str) -> AppResult<IssuedToken> {
        self.issue_at(identity, Utc::now())
    }

    /// Issue a token as if the current time were `now`
    pub fn issue_at(&self, identity: &str, now: DateTime<Utc>) -> AppResult<IssuedToken> {
        let expires_at = now + self.ttl;
        let claims = SessionClaims {
            sub: identity.to_owned(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("token signing failed: {e}")))?;

        Ok(IssuedToken {
            token,
            identity: identity.to_owned(),
            issued_at: second_precision(now),
            expires_at: second_precision(expires_at),
        })
    }

    pub fn verify(&self, token: &str) -> TokenVerdict {
        self.verify_at(token, Utc::now())
    }

    /// Verify a token against the clock value `now`
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> TokenVerdict {
        let data = match jsonwebtoken::decode::<SessionClaims>(
            token.trim(),
            &self.decoding,
            &self.validation,
        ) {
            Ok(data) => data,
            Err(_) => return TokenVerdict::Invalid,
        };

        if now.timestamp() >= data.claims.exp {
            return TokenVerdict::Expired;
        }
        if data.claims.sub.is_empty() {
            return TokenVerdict::Invalid;
        }
        TokenVerdict::Valid(data.claims.sub)
    }

    /// Verify and convert failure outcomes into `AuthFailed`
    pub fn require_identity(&self, token: &str) -> AppResult<String> {
        match self.verify(token) {
            TokenVerdict::Valid(identity) => Ok(identity),
            TokenVerdict::Expired => Err(AppError::AuthFailed(
                "session token expired; call smtp_authenticate again".to_owned(),
            )),
            TokenVerdict::Invalid => Err(AppError::AuthFailed(
                "invalid session token".to_owned(),
            )),
        }
    }
}

fn second_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0).single().unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};
    use secrecy::SecretString;

    use super::{TokenService, TokenVerdict};
    use crate::errors::AppError;

    fn service(secret: &str) -> TokenService {
        TokenService::new(&SecretString::new(secret.to_owned().into()))
    }

    #[test]
    fn verify_returns_identity_right_after_issue() {
        let tokens = service("signing-secret");
        let issued = tokens.issue("admin").expect("issue");
        assert_eq!(tokens.verify(&issued.token), TokenVerdict::Valid("admin".to_owned()));
        assert_eq!(issued.expires_at - issued.issued_at, TimeDelta::hours(24));
    }

    #[test]
    fn token_past_expiry_is_reported_as_expired() {
        let tokens = service("signing-secret");
        let now = Utc::now();
        let issued = tokens.issue_at("admin", now).expect("issue");

        let just_before = now + TimeDelta::hours(24) - TimeDelta::seconds(1);
        assert_eq!(
            tokens.verify_at(&issued.token, just_before),
            TokenVerdict::Valid("admin".to_owned())
        );
        assert_eq!(
            tokens.verify_at(&issued.token, now + TimeDelta::hours(24)),
            TokenVerdict::Expired
        );
        assert_eq!(
            tokens.verify_at(&issued.token, now + TimeDelta::days(3)),
            TokenVerdict::Expired
        );
    }

    #[test]
    fn token_signed_with_other_secret_is_invalid() {
        let issued = service("secret-a").issue("admin").expect("issue");
        assert_eq!(service("secret-b").verify(&issued.token), TokenVerdict::Invalid);
    }

    #[test]
    fn tampered_or_garbage_tokens_are_invalid() {
        let tokens = service("signing-secret");
        let issued = tokens.issue("admin").expect("issue");
        let mut parts: Vec<&str> = issued.token.split('.').collect();
        let forged_payload = tokens.issue("mallory").expect("issue").token;
        parts[1] = forged_payload.split('.').nth(1).expect("payload segment");
        let spliced = parts.join(".");

        assert_eq!(tokens.verify(&spliced), TokenVerdict::Invalid);
        assert_eq!(tokens.verify("not-a-token"), TokenVerdict::Invalid);
        assert_eq!(tokens.verify(""), TokenVerdict::Invalid);
    }

    #[test]
    fn require_identity_distinguishes_messages() {
        let tokens = service("signing-secret");
        let expired = tokens
            .issue_at("admin", Utc::now() - TimeDelta::hours(25))
            .expect("issue");
        let err = tokens.require_identity(&expired.token).expect_err("expired");
        assert!(matches!(err, AppError::AuthFailed(ref m) if m.contains("expired")));

        let err = tokens.require_identity("junk").expect_err("invalid");
        assert!(matches!(err, AppError::AuthFailed(ref m) if m.contains("invalid")));
    }
}
