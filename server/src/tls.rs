//! HTTP(S) listener plumbing
//!
//! Accepts TCP connections, terminates TLS with rustls when configured, and
//! hands each request to a [`RequestHandler`]. Used by the server for the
//! provisioning API and by the client for its demo page.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Private key error: {0}")]
    Key(String),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("Cannot bind {addr}: {source}")]
    Listener {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pause after a failed accept (EMFILE, ECONNABORTED, ...) before retrying
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Something that answers HTTP requests
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Body>) -> Response<Body>;
}

/// Build a server config from PEM certificate chain and key files
pub fn build_tls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("Failed to build TLS config: {}", e)))
}

/// Load certificates from PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| {
        TlsError::Certificate(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).filter_map(|r| r.ok()).collect();

    if certs.is_empty() {
        return Err(TlsError::Certificate(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load private key from PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::Key(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TlsError::Key(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| TlsError::Key(format!("No private key found in {}", path.display())))
}

/// Bind a TCP listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, TlsError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| TlsError::Listener {
            addr: addr.to_string(),
            source,
        })
}

/// Source of incoming connections
#[async_trait]
trait Incoming: Send + Sync {
    type Stream: Send + 'static;

    async fn accept(&self) -> std::io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Incoming for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Wait for the next connection. Accept errors are logged and retried after
/// a short pause; they never end the serve loop.
async fn next_connection<L: Incoming>(listener: &L, addr: &str) -> (L::Stream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(connection) => return connection,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Accept failed, retrying");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Serve HTTPS on `listener`. Runs until the task is dropped.
pub async fn serve_https(
    listener: TcpListener,
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
) {
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let addr = local_addr(&listener);
    info!("Listening on https://{}", addr);

    loop {
        let (stream, peer_addr) = next_connection(&listener, &addr).await;

        let acceptor = acceptor.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler.handle(req).await) }
                    });

                    let conn = hyper::server::conn::Http::new()
                        .http1_only(true)
                        .serve_connection(tls_stream, service);

                    if let Err(e) = conn.await {
                        debug!(peer = %peer_addr, "Connection error: {}", e);
                    }
                }
                Err(e) => {
                    warn!(peer = %peer_addr, "TLS handshake error: {}", e);
                }
            }
        });
    }
}

/// Serve plain HTTP on `listener` (behind a TLS-terminating proxy). Runs
/// until the task is dropped.
pub async fn serve_http(listener: TcpListener, handler: Arc<dyn RequestHandler>) {
    let addr = local_addr(&listener);
    info!("Listening on http://{}", addr);

    loop {
        let (stream, peer_addr) = next_connection(&listener, &addr).await;
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            });

            if let Err(e) = hyper::server::conn::Http::new()
                .http1_only(true)
                .serve_connection(stream, service)
                .await
            {
                debug!(peer = %peer_addr, "Connection error: {}", e);
            }
        });
    }
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use rcgen::{CertificateParams, KeyPair};
    use std::collections::VecDeque;
    use std::io::ErrorKind;
    use std::sync::Mutex;

    /// Replays scripted accept outcomes
    struct ScriptedIncoming {
        outcomes: Mutex<VecDeque<std::io::Result<u32>>>,
    }

    #[async_trait]
    impl Incoming for ScriptedIncoming {
        type Stream = u32;

        async fn accept(&self) -> std::io::Result<(u32, SocketAddr)> {
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(outcome) => outcome.map(|n| (n, SocketAddr::from(([10, 0, 0, 5], 40000)))),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_end_the_loop() {
        let incoming = ScriptedIncoming {
            outcomes: Mutex::new(VecDeque::from(vec![
                Err(std::io::Error::from_raw_os_error(24)), // EMFILE
                Err(std::io::Error::from(ErrorKind::ConnectionAborted)),
                Ok(7),
            ])),
        };

        let (stream, peer) = next_connection(&incoming, "127.0.0.1:0").await;
        assert_eq!(stream, 7);
        assert_eq!(peer.port(), 40000);
        assert!(incoming.outcomes.lock().unwrap().is_empty());
    }

    struct Hello;

    #[async_trait]
    impl RequestHandler for Hello {
        async fn handle(&self, _req: Request<Body>) -> Response<Body> {
            Response::new(Body::from("hello"))
        }
    }

    fn write_pair(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_build_tls_config() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_pair(dir.path());
        assert!(build_tls_config(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_pair(dir.path());

        assert!(matches!(
            load_certs(&dir.path().join("missing.pem")),
            Err(TlsError::Certificate(_))
        ));
        // A key file holds no certificates, a certificate file no key
        assert!(matches!(load_certs(&key_path), Err(TlsError::Certificate(_))));
        assert!(matches!(load_private_key(&cert_path), Err(TlsError::Key(_))));
    }

    #[tokio::test]
    async fn test_serve_https_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_pair(dir.path());
        let config = build_tls_config(&cert_path, &key_path).unwrap();

        let listener = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_https(listener, config, Arc::new(Hello)));

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let response = client
            .get(format!("https://localhost:{}/", port))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_serve_http_round_trip() {
        let listener = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_http(listener, Arc::new(Hello)));

        let body = reqwest::get(format!("http://127.0.0.1:{}/", port))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hello");
    }
}
