//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers 5 MCP tools. Every
//! sensitive tool verifies the session token, then passes the rate limiter,
//! before touching stored credentials or the relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use chrono::Utc;
use lettre::Address;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::service::RequestContext;
use rmcp::{Json, RoleServer, ServerHandler, tool, tool_handler, tool_router};
use secrecy::SecretString;

use crate::auth::{Authenticator, SingleAdminDirectory};
use crate::cipher::CipherService;
use crate::config::ServerConfig;
use crate::credentials::CredentialStore;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AuthenticateInput, Meta, RegisterCredentialsInput, RegistrationData, SecurityStatus,
    SendData, SendEmailInput, SessionData, SessionOnlyInput, SetupGuide, ToolEnvelope, rfc3339,
};
use crate::rate_limit::RateLimiter;
use crate::smtp::{MailTransport, OutgoingMessage, SmtpRelay};
use crate::token::{SESSION_TTL_HOURS, TokenService};

/// Maximum plain-text body size in bytes
const MAX_BODY_BYTES: usize = 1_000_000;
/// RFC 5322 line length limit, applied to the subject
const MAX_SUBJECT_CHARS: usize = 998;
/// Maximum sender display name length
const MAX_DISPLAY_NAME_CHARS: usize = 128;

const APP_PASSWORD_HELP_URL: &str = "https://myaccount.google.com/apppasswords";
const TWO_STEP_HELP_URL: &str = "https://myaccount.google.com/security";

/// How requests reach this server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Local pipe from the spawning client; always treated as secure
    Stdio,
    /// Plain streamable HTTP; secure only when a trusted proxy terminated TLS
    Http,
    /// Streamable HTTP over native TLS; always secure
    Https,
}

impl Channel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// SMTP MCP server
///
/// Owns every piece of shared state. Clones share the same tables, so all HTTP
/// sessions see one rate window and one credential store.
#[derive(Clone)]
pub struct MailSmtpServer {
    config: Arc<ServerConfig>,
    channel: Channel,
    tokens: Arc<TokenService>,
    authenticator: Arc<Authenticator>,
    limiter: Arc<RateLimiter>,
    credentials: Arc<CredentialStore>,
    transport: Arc<dyn MailTransport>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailSmtpServer {
    /// Create a server that talks to the configured SMTP relay
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `ENCRYPTION_KEY` is malformed.
    pub fn new(config: ServerConfig, channel: Channel) -> AppResult<Self> {
        let transport = Arc::new(SmtpRelay::new(&config.relay));
        Self::with_transport(config, channel, transport)
    }

    /// Create a server with an explicit mail transport
    pub fn with_transport(
        config: ServerConfig,
        channel: Channel,
        transport: Arc<dyn MailTransport>,
    ) -> AppResult<Self> {
        let security = &config.security;
        let cipher = Arc::new(CipherService::from_encoded_key(&security.encryption_key)?);
        let tokens = Arc::new(TokenService::new(&security.signing_secret));
        let directory = SingleAdminDirectory::new(
            security.admin_username.clone(),
            security.admin_password_hash.clone(),
        );
        let authenticator = Authenticator::new(Arc::new(directory), Arc::clone(&tokens));
        let limiter = RateLimiter::per_hour(security.rate_limit_per_hour);

        Ok(Self {
            channel,
            tokens,
            authenticator: Arc::new(authenticator),
            limiter: Arc::new(limiter),
            credentials: Arc::new(CredentialStore::new(cipher)),
            transport,
            config: Arc::new(config),
            tool_router: Self::tool_router(),
        })
    }

    /// Tool: Exchange username/password for a session token
    #[tool(
        name = "smtp_authenticate",
        description = "Authenticate with username and password; returns a session token valid for 24 hours"
    )]
    async fn authenticate(
        &self,
        Parameters(input): Parameters<AuthenticateInput>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<Json<ToolEnvelope<SessionData>>, ErrorData> {
        let started = Instant::now();
        let secure = self.channel_is_secure(ctx.extensions.get::<Parts>());
        finalize_tool(
            started,
            self.authenticate_impl(input, secure)
                .await
                .map(|data| ("Authenticated; session valid for 24 hours".to_owned(), data)),
        )
    }

    /// Tool: Verify and store mail credentials
    ///
    /// Logs in to the relay with the supplied credential before storing it.
    #[tool(
        name = "smtp_register_credentials",
        description = "Verify a mail address and app password against the SMTP relay and store them encrypted"
    )]
    async fn register_credentials(
        &self,
        Parameters(input): Parameters<RegisterCredentialsInput>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<Json<ToolEnvelope<RegistrationData>>, ErrorData> {
        let started = Instant::now();
        let secure = self.channel_is_secure(ctx.extensions.get::<Parts>());
        finalize_tool(
            started,
            self.register_impl(input, secure).await.map(|data| {
                (
                    format!("Credential for '{}' verified and stored", data.user_id),
                    data,
                )
            }),
        )
    }

    /// Tool: Send a plain-text email with stored credentials
    #[tool(
        name = "smtp_send_email",
        description = "Send a plain-text email using previously registered credentials"
    )]
    async fn send_email(
        &self,
        Parameters(input): Parameters<SendEmailInput>,
    ) -> Result<Json<ToolEnvelope<SendData>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.send_impl(input)
                .await
                .map(|data| (format!("Message sent to {}", data.to), data)),
        )
    }

    /// Tool: Report security configuration and usage
    #[tool(
        name = "smtp_security_status",
        description = "Report security settings, registered credential count and rate-limit usage"
    )]
    async fn security_status(
        &self,
        Parameters(input): Parameters<SessionOnlyInput>,
    ) -> Result<Json<ToolEnvelope<SecurityStatus>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.status_impl(input)
                .await
                .map(|data| ("Security status".to_owned(), data)),
        )
    }

    /// Tool: Explain how to obtain an app password and use the other tools
    #[tool(
        name = "smtp_setup_guide",
        description = "Step-by-step setup: app password, authentication, registration and sending; no session required"
    )]
    async fn setup_guide(&self) -> Result<Json<ToolEnvelope<SetupGuide>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(started, Ok(("Setup guide".to_owned(), self.guide())))
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailSmtpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Secure SMTP MCP server. Call smtp_authenticate first, then smtp_register_credentials once with the mail address and a 16-character app password, then smtp_send_email with the returned session_token. Call smtp_setup_guide for app password steps.",
        )
    }
}

/// Tool implementation methods
///
/// Private methods handle the actual business logic for each tool, separated
/// from the public `#[tool]` methods that handle response formatting.
impl MailSmtpServer {
    async fn authenticate_impl(
        &self,
        input: AuthenticateInput,
        secure: bool,
    ) -> AppResult<SessionData> {
        self.require_secure_channel(secure)?;
        let password = SecretString::new(input.password.into());
        let issued = self
            .authenticator
            .authenticate(input.username.trim(), &password)
            .await?;

        Ok(SessionData {
            session_token: issued.token,
            identity: issued.identity,
            issued_at: rfc3339(issued.issued_at),
            expires_at: rfc3339(issued.expires_at),
            ttl_hours: SESSION_TTL_HOURS,
        })
    }

    async fn register_impl(
        &self,
        input: RegisterCredentialsInput,
        secure: bool,
    ) -> AppResult<RegistrationData> {
        self.require_secure_channel(secure)?;
        let identity = self.gate(&input.session_token).await?;
        let user_id = resolve_user_id(input.user_name.as_deref(), &identity)?;
        let mail_address = input.mail_address.trim().to_owned();
        validate_address(&mail_address, "mail_address")?;

        let secret = SecretString::new(input.app_password.into());
        let record = self
            .credentials
            .register(&user_id, &mail_address, &secret, self.transport.as_ref())
            .await
            .map_err(|e| {
                tracing::warn!(identity, user_id, error = %e, "credential registration failed");
                with_remediation(e)
            })?;

        Ok(RegistrationData {
            user_id,
            mail_address,
            registered_at: rfc3339(record.created_at),
            encryption: "AES-256-GCM".to_owned(),
        })
    }

    async fn send_impl(&self, input: SendEmailInput) -> AppResult<SendData> {
        let identity = self.gate(&input.session_token).await?;
        let user_id = resolve_user_id(input.user_name.as_deref(), &identity)?;
        let to = input.to.trim().to_owned();
        validate_address(&to, "to")?;
        validate_text(&input.subject, MAX_SUBJECT_CHARS, "subject")?;
        if let Some(name) = &input.from_name {
            validate_text(name, MAX_DISPLAY_NAME_CHARS, "from_name")?;
        }
        if input.body.len() > MAX_BODY_BYTES {
            return Err(AppError::InvalidInput(format!(
                "body must be at most {MAX_BODY_BYTES} bytes"
            )));
        }

        let _guard = self.credentials.lock_identity(&user_id).await;
        let record = self.credentials.lookup(&user_id).await?;
        let credential = self.credentials.reveal(&record)?;
        let message = OutgoingMessage {
            to: to.clone(),
            subject: input.subject.clone(),
            body: input.body,
            display_name: input.from_name.filter(|n| !n.trim().is_empty()),
        };

        self.transport
            .send(&credential, &message)
            .await
            .map_err(|e| {
                tracing::warn!(identity, user_id, error = %e, "send failed");
                with_remediation(e)
            })?;
        self.credentials.touch(&user_id).await?;
        tracing::info!(identity, user_id, "message sent");

        Ok(SendData {
            user_id,
            from: credential.address,
            to,
            subject: input.subject,
            sent_at: rfc3339(Utc::now()),
        })
    }

    async fn status_impl(&self, input: SessionOnlyInput) -> AppResult<SecurityStatus> {
        let identity = self.tokens.require_identity(&input.session_token)?;
        let now = Utc::now();

        Ok(SecurityStatus {
            registered_credentials: self.credentials.registered_count().await,
            active_sessions: self.authenticator.active_sessions_at(now).await,
            require_https: self.config.security.require_https,
            encryption: "AES-256-GCM".to_owned(),
            token_algorithm: "HS256".to_owned(),
            session_ttl_hours: SESSION_TTL_HOURS,
            rate_limit_per_hour: self.limiter.limit(),
            rate_window_used: self.limiter.usage_at(&identity, now).await,
            relay: self.transport.endpoint(),
            identity,
        })
    }

    fn guide(&self) -> SetupGuide {
        let require_https = self.config.security.require_https;
        let mut steps = vec![
            format!("Enable 2-Step Verification on the mail account at {TWO_STEP_HELP_URL}"),
            format!("Create an app password for Mail at {APP_PASSWORD_HELP_URL} and copy the 16 characters"),
            "Call smtp_authenticate with the server username and password; keep the session_token (valid 24 hours)".to_owned(),
            "Call smtp_register_credentials with session_token, mail_address and app_password; user_name is optional".to_owned(),
            "Call smtp_send_email with session_token, to, subject and body".to_owned(),
        ];
        if self.channel == Channel::Http && require_https {
            steps.insert(
                2,
                "Reach this server through HTTPS: a TLS-terminating proxy on the same host, or one trusted via TRUST_PROXY_HEADERS".to_owned(),
            );
        }

        SetupGuide {
            transport: self.channel.as_str().to_owned(),
            mcp_path: (self.channel != Channel::Stdio).then(|| "/mcp".to_owned()),
            require_https,
            relay: self.transport.endpoint(),
            app_password_url: APP_PASSWORD_HELP_URL.to_owned(),
            steps,
        }
    }

    /// Verify the session token, then admit the identity through the limiter
    async fn gate(&self, session_token: &str) -> AppResult<String> {
        let identity = self.tokens.require_identity(session_token)?;
        if !self.limiter.admit(&identity).await {
            tracing::warn!(identity, "rate limit exceeded");
            return Err(AppError::RateLimited(format!(
                "at most {} operations per hour; try again later",
                self.limiter.limit()
            )));
        }
        Ok(identity)
    }

    fn require_secure_channel(&self, secure: bool) -> AppResult<()> {
        if self.config.security.require_https && !secure {
            return Err(AppError::InsecureTransport(
                "this server requires HTTPS; connect through a TLS-terminating proxy or set REQUIRE_HTTPS=false".to_owned(),
            ));
        }
        Ok(())
    }

    /// Whether the request arrived over a channel that protects secrets
    fn channel_is_secure(&self, parts: Option<&Parts>) -> bool {
        match self.channel {
            Channel::Stdio | Channel::Https => true,
            Channel::Http => parts.is_some_and(|parts| {
                is_https_request(parts, self.config.security.trust_proxy_headers)
            }),
        }
    }
}

/// A trusted proxy reported that the client connected over HTTPS
///
/// `X-Forwarded-Proto` is client-controlled, so it only counts when the peer is
/// a loopback proxy or `trust_any_peer` is set.
fn is_https_request(parts: &Parts, trust_any_peer: bool) -> bool {
    let trusted = trust_any_peer
        || parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .is_some_and(|ConnectInfo(peer)| peer.ip().to_canonical().is_loopback());
    trusted
        && parts
            .headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("https"))
}

/// Replace a bare relay authentication failure with remediation guidance
fn with_remediation(err: AppError) -> AppError {
    match err {
        AppError::AuthFailed(detail) => AppError::AuthFailed(format!(
            "mail relay rejected the credential ({detail}). Check that: \
             1) the address is spelled correctly; \
             2) you used a 16-character app password, not the account password; \
             3) 2-Step Verification is enabled on the account; \
             4) the app password has not been revoked. \
             Create an app password at {APP_PASSWORD_HELP_URL}"
        )),
        other => other,
    }
}

/// Milliseconds elapsed since `started`
fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Wrap a tool result into the standard envelope or MCP error
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

/// Pick the credential label: explicit `user_name` or the session identity
fn resolve_user_id(user_name: Option<&str>, identity: &str) -> AppResult<String> {
    match user_name.map(str::trim).filter(|u| !u.is_empty()) {
        Some(name) => {
            validate_user_name(name)?;
            Ok(name.to_owned())
        }
        None => Ok(identity.to_owned()),
    }
}

/// Validate credential label format
fn validate_user_name(user_name: &str) -> AppResult<()> {
    if user_name.is_empty() || user_name.len() > 64 {
        return Err(AppError::InvalidInput(
            "user_name must be 1..64 characters".to_owned(),
        ));
    }
    if !user_name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '@'))
    {
        return Err(AppError::InvalidInput(
            "user_name must match [A-Za-z0-9_.@-]+".to_owned(),
        ));
    }
    Ok(())
}

/// Validate an RFC 5322 mailbox address
fn validate_address(value: &str, field: &str) -> AppResult<()> {
    value
        .parse::<Address>()
        .map(|_| ())
        .map_err(|e| AppError::InvalidInput(format!("{field} is not a valid email address: {e}")))
}

/// Validate a header-bound text field: bounded length, no control characters
fn validate_text(value: &str, max_chars: usize, field: &str) -> AppResult<()> {
    if value.chars().count() > max_chars {
        return Err(AppError::InvalidInput(format!(
            "{field} must be at most {max_chars} characters"
        )));
    }
    validate_no_controls(value, field)
}

/// Reject control characters that could inject extra headers
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(char::is_control) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}
