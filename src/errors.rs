//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to the appropriate MCP `ErrorData` type so callers can
//! branch on a structured `code` instead of parsing messages.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Each variant is a distinct, actionable outcome for the caller: re-authenticate,
/// back off, re-register, or retry.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input or configuration (validation failed, malformed value)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// No credential registered for the identity
    #[error("not found: {0}")]
    NotFound(String),
    /// Bad or expired session token, bad password, or rejected mail credential
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Per-identity request window exhausted
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    /// Ciphertext is corrupt or was produced under a different key
    #[error("decryption failed: {0}")]
    Decryption(String),
    /// Network, protocol, or timeout failure talking to the mail relay
    #[error("mail transport error: {0}")]
    Transport(String),
    /// Secret-bearing request arrived over an unencrypted channel
    #[error("insecure transport: {0}")]
    InsecureTransport(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the same request may succeed if simply retried
    ///
    /// `RateLimited` is not retryable: the window only frees up as older
    /// requests age out, so callers must back off instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Convert to MCP `ErrorData`
    ///
    /// The data payload carries a stable `code` and a `retryable` flag.
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_params`
    /// - `NotFound` → `resource_not_found`
    /// - `AuthFailed` → `invalid_request`
    /// - `RateLimited` → `invalid_request`
    /// - `Decryption` → `internal_error`
    /// - `Transport` → `internal_error`
    /// - `InsecureTransport` → `invalid_request`
    /// - `Internal` → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let msg = self.to_string();
        let data = |code: &str| Some(json!({ "code": code, "retryable": self.is_retryable() }));
        match self {
            Self::InvalidInput(_) => ErrorData::invalid_params(msg, data("invalid_input")),
            Self::NotFound(_) => ErrorData::resource_not_found(msg, data("not_found")),
            Self::AuthFailed(_) => ErrorData::invalid_request(msg, data("auth_failed")),
            Self::RateLimited(_) => ErrorData::invalid_request(msg, data("rate_limited")),
            Self::Decryption(_) => ErrorData::internal_error(msg, data("decryption_failed")),
            Self::Transport(_) => ErrorData::internal_error(msg, data("transport")),
            Self::InsecureTransport(_) => {
                ErrorData::invalid_request(msg, data("insecure_transport"))
            }
            Self::Internal(_) => ErrorData::internal_error(msg, data("internal")),
        }
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn error_data_carries_structured_code() {
        let data = AppError::RateLimited("10 per hour".to_owned()).to_error_data();
        let extra = data.data.expect("error data must carry code");
        assert_eq!(extra["code"], "rate_limited");
        assert_eq!(extra["retryable"], false);

        let data = AppError::Transport("timeout".to_owned()).to_error_data();
        let extra = data.data.expect("error data must carry code");
        assert_eq!(extra["retryable"], true);

        let data = AppError::Decryption("bad tag".to_owned()).to_error_data();
        let extra = data.data.expect("error data must carry code");
        assert_eq!(extra["code"], "decryption_failed");
        assert_eq!(extra["retryable"], false);
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(AppError::Transport("timeout".to_owned()).is_retryable());
        assert!(!AppError::RateLimited("x".to_owned()).is_retryable());
        assert!(!AppError::AuthFailed("x".to_owned()).is_retryable());
        assert!(!AppError::NotFound("x".to_owned()).is_retryable());
    }
}
