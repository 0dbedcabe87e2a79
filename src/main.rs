//! mail-smtp-mcp-rs: Secure SMTP MCP server
//!
//! This server lets an MCP client authenticate, register mail credentials, and
//! send email through an SMTP relay. Credentials are verified against the relay
//! before being stored, kept encrypted in memory, and every sensitive call is
//! gated by a session token and a per-identity rate limit.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with CLI parsing, env loading and serving
//! - [`config`]: Environment-driven configuration for relay and security settings
//! - [`errors`]: Application error model with MCP error mapping
//! - [`cipher`]: AES-256-GCM encryption of stored credentials
//! - [`token`]: Signed, time-limited session tokens
//! - [`rate_limit`]: Per-identity sliding-window limiter
//! - [`credentials`]: Connectivity-gated encrypted credential store
//! - [`auth`]: Password verification and session issuance
//! - [`smtp`]: Mail transport seam and `lettre` relay implementation
//! - [`server`]: MCP tool handlers with validation and orchestration
//! - [`models`]: Input/output DTOs and schema-bearing types
//! - [`http`]: Streamable HTTP transport
//! - [`tls`]: Native TLS listener for the HTTP transport
//! - [`keygen`]: Key material generation for `.env`

mod auth;
mod cipher;
mod config;
mod credentials;
mod errors;
mod http;
mod keygen;
mod models;
mod rate_limit;
mod server;
mod smtp;
mod tls;
mod token;

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand, ValueEnum};
use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use server::{Channel, MailSmtpServer};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mail-smtp-mcp-rs", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve MCP tools (default)
    Serve(ServeArgs),
    /// Print a `.env` block with fresh secrets and an admin password hash
    Keygen {
        /// Read the admin password from stdin instead of prompting
        #[arg(long)]
        password_stdin: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Transport to serve on
    #[arg(long, value_enum, default_value_t = TransportKind::Stdio)]
    transport: TransportKind,
    /// Listen address for the HTTP transport
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Stdio,
    Http,
}

/// Application entry point
///
/// Initializes tracing from environment (to stderr, since stdout carries the
/// stdio transport), loads config, and serves the MCP server.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// ADMIN_PASSWORD_HASH='$2b$12$...' \
/// ENCRYPTION_KEY=... \
/// JWT_SECRET_KEY=... \
/// SSL_CERTFILE=cert.pem SSL_KEYFILE=key.pem \
/// cargo run -- --transport http --bind 0.0.0.0:8000
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let args = match cli.command {
        Some(Command::Keygen { password_stdin }) => {
            keygen::run(password_stdin)?;
            return Ok(());
        }
        Some(Command::Serve(args)) => args,
        None => cli.serve,
    };

    let config = ServerConfig::load_from_env()?;
    match args.transport {
        TransportKind::Stdio => {
            let server = MailSmtpServer::new(config, Channel::Stdio)?;
            let service = server.serve(stdio()).await?;
            service.waiting().await?;
        }
        TransportKind::Http => {
            let tls = config.tls.clone();
            let channel = if tls.is_some() {
                Channel::Https
            } else {
                Channel::Http
            };
            if !config.security.require_https {
                tracing::warn!("REQUIRE_HTTPS=false; credentials may cross the network in cleartext");
            } else if channel == Channel::Http && !config.security.trust_proxy_headers {
                tracing::warn!(
                    "no SSL_CERTFILE/SSL_KEYFILE; login and registration only succeed through a loopback proxy forwarding https"
                );
            }
            let server = MailSmtpServer::new(config, channel)?;
            http::serve(server, args.bind, tls).await?;
        }
    }
    Ok(())
}
