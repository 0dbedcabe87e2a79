//! Input/output DTOs and schema-bearing types
//!
//! Defines all data structures used in MCP tool contracts. Each type is
//! annotated with `JsonSchema` for automatic schema generation. Inputs that
//! carry secrets do not derive `Debug`.

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Input: password login
#[derive(Clone, Deserialize, JsonSchema)]
pub struct AuthenticateInput {
    /// Administrative username
    pub username: String,
    /// Plaintext password (checked against the configured bcrypt hash)
    pub password: String,
}

/// Input: register mail credentials for the caller
#[derive(Clone, Deserialize, JsonSchema)]
pub struct RegisterCredentialsInput {
    /// Token returned by `smtp_authenticate`
    pub session_token: String,
    /// Mailbox address used to log in to the relay and as sender
    pub mail_address: String,
    /// App password for the mailbox (spaces are ignored)
    pub app_password: String,
    /// Optional label to store the credential under (defaults to the session identity)
    pub user_name: Option<String>,
}

/// Input: send a plain-text message
#[derive(Clone, Deserialize, JsonSchema)]
pub struct SendEmailInput {
    /// Token returned by `smtp_authenticate`
    pub session_token: String,
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Plain-text body (UTF-8)
    pub body: String,
    /// Optional sender display name
    pub from_name: Option<String>,
    /// Credential label chosen at registration (defaults to the session identity)
    pub user_name: Option<String>,
}

/// Input: session token only
#[derive(Clone, Deserialize, JsonSchema)]
pub struct SessionOnlyInput {
    /// Token returned by `smtp_authenticate`
    pub session_token: String,
}

/// Output of `smtp_authenticate`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionData {
    /// Bearer token to pass as `session_token` to other tools
    pub session_token: String,
    /// Identity bound to the token
    pub identity: String,
    /// Issue time (RFC 3339)
    pub issued_at: String,
    /// Expiry time (RFC 3339)
    pub expires_at: String,
    /// Token lifetime in hours
    pub ttl_hours: i64,
}

/// Output of `smtp_register_credentials`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegistrationData {
    /// Label the credential is stored under
    pub user_id: String,
    /// Registered mailbox address
    pub mail_address: String,
    /// Registration time (RFC 3339)
    pub registered_at: String,
    /// Storage cipher
    pub encryption: String,
}

/// Output of `smtp_send_email`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SendData {
    /// Credential label used
    pub user_id: String,
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Send time (RFC 3339)
    pub sent_at: String,
}

/// Output of `smtp_security_status`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SecurityStatus {
    /// Identity bound to the presented token
    pub identity: String,
    /// Number of labels with a stored credential
    pub registered_credentials: usize,
    /// Identities holding an unexpired session
    pub active_sessions: usize,
    /// Whether secret-bearing tools require a secure channel
    pub require_https: bool,
    /// Credential storage cipher
    pub encryption: String,
    /// Session token signature algorithm
    pub token_algorithm: String,
    /// Session token lifetime in hours
    pub session_ttl_hours: i64,
    /// Requests admitted per identity per hour
    pub rate_limit_per_hour: usize,
    /// Caller's admissions inside the current window
    pub rate_window_used: usize,
    /// Relay `host:port`
    pub relay: String,
}

/// Output of `smtp_setup_guide`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetupGuide {
    /// How this instance is reached: `stdio`, `http` or `https`
    pub transport: String,
    /// MCP endpoint path for the HTTP transports
    pub mcp_path: Option<String>,
    /// Whether password-bearing tools refuse insecure channels
    pub require_https: bool,
    /// Relay `host:port`
    pub relay: String,
    /// Where to create a mail app password
    pub app_password_url: String,
    /// Ordered steps from first login to first message
    pub steps: Vec<String>,
}

/// Format a timestamp as RFC 3339 with second precision
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
