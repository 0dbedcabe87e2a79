//! Native TLS termination for the HTTP transport
//!
//! Loads a PEM certificate chain and private key into a `rustls` server config
//! and exposes [`TlsListener`], an `axum` listener that yields already
//! handshaken streams. Handshakes run on their own tasks with a deadline, so a
//! stalled client never blocks the accept loop.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::config::TlsConfig;
use crate::errors::{AppError, AppResult};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// Handshaken streams waiting for axum to pick them up
const PENDING_STREAMS: usize = 64;

type Accepted = (TlsStream<TcpStream>, SocketAddr);

/// Build a `rustls` server config from the configured PEM files
///
/// # Errors
///
/// Returns `InvalidInput` if a file is unreadable, holds no usable PEM item,
/// or the key does not match the certificate.
pub fn load_server_config(tls: &TlsConfig) -> AppResult<Arc<ServerConfig>> {
    let certs = read_certs(&tls.cert_path)?;
    let key = read_key(&tls.key_path)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::Internal(format!("TLS protocol setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::InvalidInput(format!("unusable TLS certificate or key: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn open(path: &Path) -> AppResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| AppError::InvalidInput(format!("cannot read {}: {e}", path.display())))
}

fn read_certs(path: &Path) -> AppResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            AppError::InvalidInput(format!("invalid certificate PEM in {}: {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> AppResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| {
            AppError::InvalidInput(format!("invalid private key PEM in {}: {e}", path.display()))
        })?
        .ok_or_else(|| {
            AppError::InvalidInput(format!("no private key found in {}", path.display()))
        })
}

/// TCP listener that completes the TLS handshake before handing streams to axum
#[derive(Debug)]
pub struct TlsListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Accepted>,
}

impl TlsListener {
    /// Bind `addr` and start accepting in the background
    pub async fn bind(addr: SocketAddr, config: Arc<ServerConfig>) -> io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        let (tx, incoming) = mpsc::channel(PENDING_STREAMS);
        tokio::spawn(accept_loop(tcp, TlsAcceptor::from(config), tx));
        Ok(Self {
            local_addr,
            incoming,
        })
    }
}

/// Runs until the listener is dropped
async fn accept_loop(tcp: TcpListener, acceptor: TlsAcceptor, tx: mpsc::Sender<Accepted>) {
    loop {
        let accepted = tokio::select! {
            () = tx.closed() => return,
            accepted = tcp.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, peer)).await;
                }
                Ok(Err(e)) => tracing::debug!(%peer, error = %e, "TLS handshake failed"),
                Err(_) => tracing::debug!(%peer, "TLS handshake timed out"),
            }
        });
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(accepted) => accepted,
            // accept loop is gone; axum expects accept to never fail
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use axum::Router;
    use axum::routing::get;
    use rustls::{ClientConfig, RootCertStore};
    use rustls_pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    use super::{TlsListener, load_server_config};
    use crate::config::TlsConfig;
    use crate::errors::AppError;

    struct Pem {
        _dir: tempfile::TempDir,
        tls: TlsConfig,
        cert: rcgen::CertifiedKey,
    }

    fn self_signed() -> Pem {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
            .expect("self-signed certificate");
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).expect("write cert");
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).expect("write key");
        Pem {
            _dir: dir,
            tls: TlsConfig {
                cert_path,
                key_path,
            },
            cert,
        }
    }

    #[tokio::test]
    async fn serves_https_from_pem_files() {
        let pem = self_signed();
        let config = load_server_config(&pem.tls).expect("server config");
        let listener = TlsListener::bind("127.0.0.1:0".parse().expect("addr"), config)
            .await
            .expect("bind");
        let addr = listener.local_addr;
        let app = Router::new().route("/", get(|| async { "secure" }));
        tokio::spawn(async move { axum::serve(listener, app).await });

        let mut roots = RootCertStore::empty();
        roots.add(pem.cert.cert.der().clone()).expect("trust cert");
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocols")
            .with_root_certificates(roots)
            .with_no_client_auth();

        let tcp = TcpStream::connect(addr).await.expect("connect");
        let mut stream = TlsConnector::from(Arc::new(client))
            .connect(ServerName::try_from("localhost").expect("server name"), tcp)
            .await
            .expect("handshake");
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write request");

        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        while !String::from_utf8_lossy(&response).contains("secure") {
            let n = stream.read(&mut chunk).await.expect("read response");
            assert!(n > 0, "connection closed before the body arrived");
            response.extend_from_slice(&chunk[..n]);
        }
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn missing_key_file_is_invalid_input() {
        let pem = self_signed();
        let tls = TlsConfig {
            key_path: PathBuf::from("/nonexistent/key.pem"),
            ..pem.tls.clone()
        };
        let err = load_server_config(&tls).expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(ref m) if m.contains("key.pem")));
    }

    #[test]
    fn certificate_file_without_key_is_rejected() {
        let pem = self_signed();
        let tls = TlsConfig {
            key_path: pem.tls.cert_path.clone(),
            ..pem.tls.clone()
        };
        let err = load_server_config(&tls).expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(ref m) if m.contains("no private key")));
    }
}
