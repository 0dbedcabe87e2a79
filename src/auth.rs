//! Password authentication and session issuance
//!
//! Stored hashes are bcrypt. Lookup goes through [`PasswordDirectory`] so the
//! authenticator does not assume how many privileged users exist. Every
//! rejection carries the same message, whether the user is unknown, no hash is
//! configured, the hash is malformed, or the password is wrong. Each of those
//! paths also pays for one bcrypt verification, so timing does not tell them
//! apart either.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::config::generate_secret;
use crate::errors::{AppError, AppResult};
use crate::token::{IssuedToken, TokenService};

const REJECTED: &str = "username or password is incorrect";

/// Source of stored password hashes
pub trait PasswordDirectory: Send + Sync {
    /// bcrypt hash for `username`, or `None` if the user cannot log in
    fn password_hash(&self, username: &str) -> Option<SecretString>;
}

/// Directory with exactly one administrative entry
#[derive(Debug)]
pub struct SingleAdminDirectory {
    username: String,
    hash: Option<SecretString>,
}

impl SingleAdminDirectory {
    pub fn new(username: impl Into<String>, hash: Option<SecretString>) -> Self {
        Self {
            username: username.into(),
            hash,
        }
    }
}

impl PasswordDirectory for SingleAdminDirectory {
    fn password_hash(&self, username: &str) -> Option<SecretString> {
        if username != self.username {
            return None;
        }
        self.hash
            .as_ref()
            .map(|h| SecretString::new(h.expose_secret().into()))
    }
}

/// Verifies passwords and hands out session tokens
pub struct Authenticator {
    directory: Arc<dyn PasswordDirectory>,
    tokens: Arc<TokenService>,
    /// Latest session expiry per identity (bookkeeping only, never consulted for access)
    sessions: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Authenticator {
    pub fn new(directory: Arc<dyn PasswordDirectory>, tokens: Arc<TokenService>) -> Self {
        Self {
            directory,
            tokens,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Check `password` for `username` and issue a token on success
    ///
    /// bcrypt runs on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns `AuthFailed` with a uniform message on any mismatch.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &SecretString,
    ) -> AppResult<IssuedToken> {
        let stored = self.directory.password_hash(username);
        let candidate = SecretString::new(password.expose_secret().into());
        let matched = tokio::task::spawn_blocking(move || check_password(&candidate, stored.as_ref()))
            .await
            .map_err(|e| AppError::Internal(format!("password verification task failed: {e}")))?;

        if !matched {
            tracing::warn!(username, "authentication rejected");
            return Err(AppError::AuthFailed(REJECTED.to_owned()));
        }

        let issued = self.tokens.issue(username)?;
        self.sessions
            .lock()
            .await
            .insert(issued.identity.clone(), issued.expires_at);
        tracing::info!(username, expires_at = %issued.expires_at, "session issued");
        Ok(issued)
    }

    /// Identities whose most recent session has not yet expired
    pub async fn active_sessions_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, expires_at| *expires_at > now);
        sessions.len()
    }
}

/// Compare `candidate` to `stored`, spending one bcrypt verification either way
fn check_password(candidate: &SecretString, stored: Option<&SecretString>) -> bool {
    let verdict = stored
        .and_then(|stored| bcrypt::verify(candidate.expose_secret(), stored.expose_secret()).ok());
    if let Some(matched) = verdict {
        return matched;
    }
    if let Some(decoy) = decoy_hash() {
        let _ = bcrypt::verify(candidate.expose_secret(), decoy);
    }
    false
}

/// Hash of a random secret at the default cost; never matches any password
fn decoy_hash() -> Option<&'static str> {
    static DECOY: OnceLock<Option<String>> = OnceLock::new();
    DECOY
        .get_or_init(|| bcrypt::hash(generate_secret(), bcrypt::DEFAULT_COST).ok())
        .as_deref()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use chrono::{TimeDelta, Utc};
    use secrecy::SecretString;

    use super::{
        Authenticator, PasswordDirectory, SingleAdminDirectory, check_password, decoy_hash,
    };
    use crate::errors::AppError;
    use crate::token::{TokenService, TokenVerdict};

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_owned().into())
    }

    fn authenticator(hash: Option<&str>) -> (Authenticator, Arc<TokenService>) {
        let tokens = Arc::new(TokenService::new(&secret("signing-secret")));
        let directory = SingleAdminDirectory::new("admin", hash.map(secret));
        (
            Authenticator::new(Arc::new(directory), Arc::clone(&tokens)),
            tokens,
        )
    }

    fn hash(password: &str) -> String {
        bcrypt::hash(password, 4).expect("bcrypt hash")
    }

    #[tokio::test]
    async fn correct_password_yields_verifiable_token() {
        let stored = hash("correct-pw");
        let (auth, tokens) = authenticator(Some(&stored));

        let issued = auth
            .authenticate("admin", &secret("correct-pw"))
            .await
            .expect("must authenticate");
        assert_eq!(tokens.verify(&issued.token), TokenVerdict::Valid("admin".to_owned()));
        assert_eq!(auth.active_sessions_at(Utc::now()).await, 1);
        assert_eq!(
            auth.active_sessions_at(Utc::now() + TimeDelta::hours(25)).await,
            0
        );
    }

    #[tokio::test]
    async fn rejections_are_indistinguishable() {
        let stored = hash("correct-pw");
        let (configured, _) = authenticator(Some(&stored));
        let (unconfigured, _) = authenticator(None);
        let (malformed, _) = authenticator(Some("not-a-bcrypt-hash"));

        let wrong_pw = configured
            .authenticate("admin", &secret("nope"))
            .await
            .expect_err("wrong password");
        let wrong_user = configured
            .authenticate("root", &secret("correct-pw"))
            .await
            .expect_err("unknown user");
        let no_hash = unconfigured
            .authenticate("admin", &secret("correct-pw"))
            .await
            .expect_err("no hash configured");
        let bad_hash = malformed
            .authenticate("admin", &secret("correct-pw"))
            .await
            .expect_err("malformed hash");

        let messages = [wrong_pw, wrong_user, no_hash, bad_hash]
            .into_iter()
            .map(|e| {
                assert!(matches!(e, AppError::AuthFailed(_)));
                e.to_string()
            })
            .collect::<Vec<_>>();
        assert!(messages.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn single_admin_directory_only_knows_its_user() {
        let directory = SingleAdminDirectory::new("admin", Some(secret("$2b$04$x")));
        assert!(directory.password_hash("admin").is_some());
        assert!(directory.password_hash("Admin").is_none());
        assert!(SingleAdminDirectory::new("admin", None).password_hash("admin").is_none());
    }

    #[test]
    fn decoy_is_a_full_cost_hash() {
        let decoy = decoy_hash().expect("decoy hash");
        let parts = bcrypt::HashParts::from_str(decoy).expect("decoy must parse as bcrypt");
        assert_eq!(parts.get_cost(), bcrypt::DEFAULT_COST);
        assert_eq!(decoy_hash(), Some(decoy), "decoy is computed once");
    }

    #[test]
    fn check_password_rejects_without_a_usable_hash() {
        let stored = secret(&hash("correct-pw"));
        assert!(check_password(&secret("correct-pw"), Some(&stored)));
        assert!(!check_password(&secret("wrong"), Some(&stored)));
        assert!(!check_password(&secret("correct-pw"), None));
        assert!(!check_password(&secret("correct-pw"), Some(&secret("not-a-hash"))));
    }
}
