//! Configuration module for the SMTP relay and security settings
//!
//! All configuration is loaded from environment variables. Key material that is
//! absent is generated fresh for this process, which makes previously encrypted
//! records and issued tokens unusable after a restart.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Default relay host (Gmail submission endpoint)
pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
/// Default relay port (submission with STARTTLS)
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// SMTP relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay hostname
    pub host: String,
    /// Relay port (STARTTLS is always negotiated)
    pub port: u16,
    /// Timeout applied to each probe and send, in milliseconds
    pub timeout_ms: u64,
}

/// Security settings consumed by the token, cipher, auth and rate layers
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// HS256 signing secret for session tokens
    pub signing_secret: SecretString,
    /// URL-safe base64 encoding of a 32-byte AES key
    pub encryption_key: SecretString,
    /// Username of the privileged identity
    pub admin_username: String,
    /// bcrypt hash of the admin password; `None` disables authentication
    pub admin_password_hash: Option<SecretString>,
    /// Reject secret-bearing calls that did not arrive over a secure channel
    pub require_https: bool,
    /// Honor `X-Forwarded-Proto` from any peer, not only loopback proxies
    pub trust_proxy_headers: bool,
    /// Requests admitted per identity per trailing hour
    pub rate_limit_per_hour: usize,
}

/// PEM files for serving HTTPS directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Certificate chain, leaf first
    pub cert_path: PathBuf,
    /// PKCS#8, PKCS#1 or SEC1 private key
    pub key_path: PathBuf,
}

/// Server-wide configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub relay: RelayConfig,
    pub security: SecurityConfig,
    /// Native TLS for the HTTP transport; `None` serves plain HTTP
    pub tls: Option<TlsConfig>,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set to a malformed value.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// JWT_SECRET_KEY=Qm9vdHN0cmFwLXNpZ25pbmctc2VjcmV0
    /// ENCRYPTION_KEY=q0J9p0s0Cq2f8oQ0X3o2a7m8b1sXQw1b5b4p5b3C0aE=
    /// ADMIN_PASSWORD_HASH=$2b$12$...
    /// REQUIRE_HTTPS=true
    /// TRUST_PROXY_HEADERS=false
    /// SSL_CERTFILE=/etc/mail-smtp-mcp/cert.pem
    /// SSL_KEYFILE=/etc/mail-smtp-mcp/key.pem
    /// RATE_LIMIT_PER_HOUR=10
    /// MAIL_SMTP_HOST=smtp.gmail.com
    /// MAIL_SMTP_PORT=587
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let signing_secret = match optional_env("JWT_SECRET_KEY")? {
            Some(v) => v,
            None => {
                tracing::warn!("JWT_SECRET_KEY not set; generated an ephemeral signing secret");
                generate_secret()
            }
        };
        let encryption_key = match optional_env("ENCRYPTION_KEY")? {
            Some(v) => v,
            None => {
                tracing::warn!(
                    "ENCRYPTION_KEY not set; generated an ephemeral key, stored credentials will not survive a restart"
                );
                generate_secret()
            }
        };
        let admin_password_hash = optional_env("ADMIN_PASSWORD_HASH")?;
        if admin_password_hash.is_none() {
            tracing::warn!("ADMIN_PASSWORD_HASH not set; authentication is unavailable");
        }

        let rate_limit_per_hour = parse_usize_env("RATE_LIMIT_PER_HOUR", 10)?;
        if rate_limit_per_hour == 0 {
            return Err(AppError::invalid("RATE_LIMIT_PER_HOUR must be at least 1"));
        }

        Ok(Self {
            relay: RelayConfig {
                host: optional_env("MAIL_SMTP_HOST")?.unwrap_or_else(|| DEFAULT_SMTP_HOST.to_owned()),
                port: parse_u16_env("MAIL_SMTP_PORT", DEFAULT_SMTP_PORT)?,
                timeout_ms: parse_u64_env("MAIL_SMTP_TIMEOUT_MS", 30_000)?,
            },
            security: SecurityConfig {
                signing_secret: SecretString::new(signing_secret.into()),
                encryption_key: SecretString::new(encryption_key.into()),
                admin_username: optional_env("ADMIN_USERNAME")?
                    .unwrap_or_else(|| "admin".to_owned()),
                admin_password_hash: admin_password_hash.map(|v| SecretString::new(v.into())),
                require_https: parse_bool_env("REQUIRE_HTTPS", true)?,
                trust_proxy_headers: parse_bool_env("TRUST_PROXY_HEADERS", false)?,
                rate_limit_per_hour,
            },
            tls: tls_from_paths(optional_env("SSL_CERTFILE")?, optional_env("SSL_KEYFILE")?)?,
        })
    }
}

/// Pair the certificate and key paths; one without the other is an error
fn tls_from_paths(cert: Option<String>, key: Option<String>) -> AppResult<Option<TlsConfig>> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        })),
        (None, None) => Ok(None),
        _ => Err(AppError::invalid(
            "SSL_CERTFILE and SSL_KEYFILE must be set together",
        )),
    }
}

/// Generate 32 random bytes encoded as URL-safe base64
///
/// The output is usable both as a signing secret and as an `ENCRYPTION_KEY`.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// Read an optional environment variable; blank values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match optional_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a numeric environment variable with default fallback
fn parse_num_env<T: std::str::FromStr>(key: &str, default: T, kind: &str) -> AppResult<T> {
    match optional_env(key)? {
        Some(v) => v.parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!("invalid {kind} environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    parse_num_env(key, default, "u16")
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    parse_num_env(key, default, "u64")
}

fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    parse_num_env(key, default, "usize")
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE;

    use std::path::PathBuf;

    use super::{generate_secret, parse_bool_value, tls_from_paths};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn generated_secret_decodes_to_32_bytes() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert_eq!(URL_SAFE.decode(a).expect("valid base64").len(), 32);
    }

    #[test]
    fn tls_paths_must_come_in_pairs() {
        assert_eq!(tls_from_paths(None, None).expect("plain"), None);

        let tls = tls_from_paths(Some("cert.pem".to_owned()), Some("key.pem".to_owned()))
            .expect("pair")
            .expect("tls enabled");
        assert_eq!(tls.cert_path, PathBuf::from("cert.pem"));
        assert_eq!(tls.key_path, PathBuf::from("key.pem"));

        assert!(tls_from_paths(Some("cert.pem".to_owned()), None).is_err());
        assert!(tls_from_paths(None, Some("key.pem".to_owned())).is_err());
    }
}
