//! SMTP transport operations
//!
//! Defines the [`MailTransport`] seam the credential and send paths depend on,
//! and [`SmtpRelay`], a timeout-bounded `lettre` implementation. Every
//! connection negotiates STARTTLS before authenticating. Failures are split
//! into `AuthFailed` (credential rejected) and `Transport` (network, protocol,
//! timeout; retryable).

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;

use crate::config::RelayConfig;
use crate::errors::{AppError, AppResult};

/// Plaintext mail credential, only held for the duration of one probe or send
#[derive(Debug, Clone)]
pub struct MailCredential {
    pub address: String,
    pub secret: SecretString,
}

/// Plain-text message to deliver
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub display_name: Option<String>,
}

/// Mail relay collaborator
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Connect, negotiate TLS, log in with `credential`, then disconnect
    async fn connect_and_login(&self, credential: &MailCredential) -> AppResult<()>;

    /// Deliver `message` from `credential.address`
    async fn send(&self, credential: &MailCredential, message: &OutgoingMessage) -> AppResult<()>;

    /// `host:port` of the relay, for status reporting
    fn endpoint(&self) -> String;
}

/// `lettre`-backed STARTTLS relay
#[derive(Debug, Clone)]
pub struct SmtpRelay {
    host: String,
    port: u16,
    timeout: Duration,
}

impl SmtpRelay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Build a single-use transport; no pooling, so every call re-authenticates
    fn transport(&self, credential: &MailCredential) -> AppResult<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| AppError::InvalidInput(format!("invalid SMTP host '{}': {e}", self.host)))?;
        Ok(builder
            .port(self.port)
            .timeout(Some(self.timeout))
            .credentials(Credentials::new(
                credential.address.clone(),
                credential.secret.expose_secret().to_owned(),
            ))
            .build())
    }
}

#[async_trait]
impl MailTransport for SmtpRelay {
    async fn connect_and_login(&self, credential: &MailCredential) -> AppResult<()> {
        let transport = self.transport(credential)?;
        let connected = timeout(self.timeout, transport.test_connection())
            .await
            .map_err(|_| AppError::Transport("SMTP login probe timed out".to_owned()))
            .and_then(|r| r.map_err(classify_smtp_error))?;

        if !connected {
            return Err(AppError::Transport(
                "SMTP server did not accept the test connection".to_owned(),
            ));
        }
        tracing::debug!(relay = %self.endpoint(), "SMTP login probe succeeded");
        Ok(())
    }

    async fn send(&self, credential: &MailCredential, message: &OutgoingMessage) -> AppResult<()> {
        let email = build_message(credential, message)?;
        let transport = self.transport(credential)?;
        let response = timeout(self.timeout, transport.send(email))
            .await
            .map_err(|_| AppError::Transport("SMTP send timed out".to_owned()))
            .and_then(|r| r.map_err(classify_smtp_error))?;

        if !response.is_positive() {
            return Err(AppError::Transport(format!(
                "SMTP server rejected message: {} {}",
                response.code(),
                response.message().collect::<Vec<_>>().join(" ")
            )));
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Assemble a plain-text UTF-8 message
pub fn build_message(credential: &MailCredential, message: &OutgoingMessage) -> AppResult<Message> {
    let from_addr: Address = credential
        .address
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("invalid sender address: {e}")))?;
    let to_addr: Address = message
        .to
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("invalid recipient address: {e}")))?;

    Message::builder()
        .from(Mailbox::new(message.display_name.clone(), from_addr))
        .to(Mailbox::new(None, to_addr))
        .subject(message.subject.as_str())
        .header(ContentType::TEXT_PLAIN)
        .body(message.body.clone())
        .map_err(|e| AppError::Internal(format!("failed to build message: {e}")))
}

/// SMTP reply codes that mean the credential itself was refused
const AUTH_REPLY_CODES: [&str; 3] = ["530", "534", "535"];

/// Map a `lettre` SMTP error to `AuthFailed` or `Transport`
fn classify_smtp_error(err: lettre::transport::smtp::Error) -> AppError {
    let msg = err.to_string();
    let auth_code = err
        .status()
        .is_some_and(|code| AUTH_REPLY_CODES.contains(&code.to_string().as_str()));
    let no_mechanism = err.is_client() && msg.to_ascii_lowercase().contains("authentication");

    if auth_code || no_mechanism {
        AppError::AuthFailed(msg)
    } else if err.is_timeout() {
        AppError::Transport(format!("SMTP timed out: {msg}"))
    } else {
        AppError::Transport(msg)
    }
}
