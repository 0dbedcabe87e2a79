//! Encrypted, connectivity-gated credential storage
//!
//! Records are written only after the plaintext credential has logged in to
//! the relay, so every stored credential was known-good at registration time.
//! A failed probe never creates or replaces a record. Registration and the
//! send path serialize per identity through [`CredentialStore::lock_identity`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::cipher::CipherService;
use crate::errors::{AppError, AppResult};
use crate::smtp::{MailCredential, MailTransport};

/// Stored credential; both fields are ciphertext
#[derive(Debug, Clone)]
pub struct EncryptedCredentialRecord {
    pub encrypted_mail_address: String,
    pub encrypted_app_password: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// In-memory identity → credential table
#[derive(Debug)]
pub struct CredentialStore {
    cipher: Arc<CipherService>,
    records: Mutex<HashMap<String, EncryptedCredentialRecord>>,
    /// One guard per identity; entries are never removed
    identity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(cipher: Arc<CipherService>) -> Self {
        Self {
            cipher,
            records: Mutex::new(HashMap::new()),
            identity_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the serialization guard for `identity`
    pub async fn lock_identity(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.identity_locks.lock().await;
            Arc::clone(locks.entry(identity.to_owned()).or_default())
        };
        lock.lock_owned().await
    }

    /// Probe the relay with the credential and store it encrypted on success
    ///
    /// Whitespace is stripped from `app_secret` (app passwords are often shown
    /// in groups of four). Replaces any earlier record for `identity`.
    ///
    /// # Errors
    ///
    /// - `AuthFailed` if the relay rejects the login
    /// - `Transport` for network, TLS, or timeout failures
    pub async fn register(
        &self,
        identity: &str,
        mail_address: &str,
        app_secret: &SecretString,
        transport: &dyn MailTransport,
    ) -> AppResult<EncryptedCredentialRecord> {
        let credential = MailCredential {
            address: mail_address.trim().to_owned(),
            secret: SecretString::new(normalize_app_secret(app_secret.expose_secret()).into()),
        };

        let _guard = self.lock_identity(identity).await;
        transport.connect_and_login(&credential).await?;

        let record = EncryptedCredentialRecord {
            encrypted_mail_address: self.cipher.encrypt(&credential.address)?,
            encrypted_app_password: self.cipher.encrypt(credential.secret.expose_secret())?,
            created_at: Utc::now(),
            last_used_at: None,
        };
        let replaced = self
            .records
            .lock()
            .await
            .insert(identity.to_owned(), record.clone())
            .is_some();
        tracing::info!(identity, replaced, "stored encrypted mail credential");
        Ok(record)
    }

    /// Fetch the record for `identity`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is registered.
    pub async fn lookup(&self, identity: &str) -> AppResult<EncryptedCredentialRecord> {
        self.records
            .lock()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no mail credential registered for '{identity}'; call smtp_register_credentials first"
                ))
            })
    }

    /// Decrypt a record into a usable credential
    pub fn reveal(&self, record: &EncryptedCredentialRecord) -> AppResult<MailCredential> {
        Ok(MailCredential {
            address: self.cipher.decrypt(&record.encrypted_mail_address)?,
            secret: SecretString::new(self.cipher.decrypt(&record.encrypted_app_password)?.into()),
        })
    }

    /// Mark the record for `identity` as used now
    pub async fn touch(&self, identity: &str) -> AppResult<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(identity)
            .ok_or_else(|| AppError::NotFound(format!("no mail credential registered for '{identity}'")))?;
        record.last_used_at = Some(Utc::now());
        Ok(())
    }

    /// Number of identities with a stored credential
    pub async fn registered_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

fn normalize_app_secret(secret: &str) -> String {
    secret.chars().filter(|c| !c.is_whitespace()).collect()
}
