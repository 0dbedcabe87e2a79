//! Streamable HTTP transport
//!
//! Serves the MCP endpoint at `/mcp` and a liveness probe at `/healthz`, over
//! native TLS when certificate files are configured and plain HTTP otherwise.
//! The peer address is attached to every request for the secure-channel check.
//! Every HTTP session gets a clone of the same server, so state is shared.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use axum::serve::ListenerExt;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use tokio_util::sync::CancellationToken;

use crate::config::TlsConfig;
use crate::errors::{AppError, AppResult};
use crate::server::MailSmtpServer;
use crate::tls::{TlsListener, load_server_config};

/// Build the HTTP router around a shared server instance
pub fn router(server: MailSmtpServer) -> Router {
    let mcp = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );
    Router::new()
        .route("/healthz", get(healthz))
        .nest_service("/mcp", mcp)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Bind `addr` and serve until Ctrl-C, over TLS when `tls` is set
pub async fn serve(server: MailSmtpServer, addr: SocketAddr, tls: Option<TlsConfig>) -> AppResult<()> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        trigger.cancel();
    });

    let app = router(server).into_make_service_with_connect_info::<SocketAddr>();
    let served = match tls {
        Some(tls) => {
            let listener = TlsListener::bind(addr, load_server_config(&tls)?)
                .await
                .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;
            tracing::info!(%addr, cert = %tls.cert_path.display(), "serving MCP over HTTPS at /mcp");
            axum::serve(listener.tap_io(|_| {}), app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;
            tracing::info!(%addr, "serving MCP over plain HTTP at /mcp");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    };
    served.map_err(|e| AppError::Internal(format!("HTTP server failed: {e}")))
}
