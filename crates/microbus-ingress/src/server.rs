//! HTTP listeners of the ingress.
//!
//! Each port gets its own accept loop. A port serves TLS when the files
//! `httpingress-{port}-cert.pem` and `httpingress-{port}-key.pem` are found
//! in the certificate directory, and plain HTTP otherwise.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use microbus_core::{BoxFuture, InFlightTracker, MicrobusError, MicrobusResult, Response, ShutdownSignal};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::middleware::{IngressContext, IngressRequest};

/// How long a stopping listener waits for open connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles a request received by a listener.
pub(crate) type Handler =
    Arc<dyn Fn(IngressContext, IngressRequest) -> BoxFuture<'static, Response> + Send + Sync>;

/// A running listener.
pub(crate) struct Listener {
    port: u16,
    secure: bool,
    shutdown: ShutdownSignal,
    connections: InFlightTracker,
    task: JoinHandle<()>,
}

impl Listener {
    /// Binds `port` on all interfaces and starts accepting connections.
    pub(crate) async fn start(
        port: u16,
        cert_dir: &Path,
        header_timeout: Duration,
        handler: Handler,
    ) -> MicrobusResult<Self> {
        let tls = load_tls(cert_dir, port)?;
        let secure = tls.is_some();
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .map_err(|e| MicrobusError::internal(format!("failed to bind port {port}: {e}")))?;
        info!(port = port, secure = secure, "Ingress listening");

        let shutdown = ShutdownSignal::new();
        let connections = InFlightTracker::new();
        let task = tokio::spawn(accept_loop(
            listener,
            port,
            tls,
            header_timeout,
            handler,
            shutdown.clone(),
            connections.clone(),
        ));
        Ok(Self {
            port,
            secure,
            shutdown,
            connections,
            task,
        })
    }

    /// The port listened on.
    pub(crate) const fn port(&self) -> u16 {
        self.port
    }

    /// Whether the listener serves TLS.
    pub(crate) const fn is_secure(&self) -> bool {
        self.secure
    }

    /// Stops accepting, then waits for open connections to finish their
    /// current request.
    pub(crate) async fn stop(self) {
        self.shutdown.trigger();
        if let Err(e) = self.task.await {
            warn!(port = self.port, error = %e, "Accept loop failed");
        }
        if !self.connections.wait_idle(DRAIN_TIMEOUT).await {
            warn!(
                port = self.port,
                open = self.connections.count(),
                "Connections still open after drain timeout"
            );
        }
        info!(port = self.port, "Ingress stopped listening");
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.port)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    tls: Option<TlsAcceptor>,
    header_timeout: Duration,
    handler: Handler,
    shutdown: ShutdownSignal,
    connections: InFlightTracker,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, remote_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(port = port, error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let token = connections.acquire();
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let _token = token;
                    let conn = Connection {
                        port,
                        remote_addr,
                        header_timeout,
                        handler,
                        shutdown,
                    };
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => conn.serve(stream, true).await,
                            Err(e) => debug!(port = port, remote = %remote_addr, error = %e, "TLS handshake failed"),
                        },
                        None => conn.serve(stream, false).await,
                    }
                });
            }
            () = shutdown.recv() => break,
        }
    }
}

struct Connection {
    port: u16,
    remote_addr: SocketAddr,
    header_timeout: Duration,
    handler: Handler,
    shutdown: ShutdownSignal,
}

impl Connection {
    async fn serve<S>(self, stream: S, secure: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            port,
            remote_addr,
            header_timeout,
            handler,
            shutdown,
        } = self;
        let service = service_fn(move |req: http::Request<Incoming>| {
            let handler = Arc::clone(&handler);
            let ctx = IngressContext::new(port, Some(remote_addr), secure);
            async move {
                let res = handler(ctx, req.map(BodyExt::boxed)).await;
                Ok::<_, Infallible>(res.map(Full::new))
            }
        });

        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(header_timeout)
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            () = shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            debug!(port = port, remote = %remote_addr, error = %e, "Connection closed with error");
        }
    }
}

/// Loads the certificate and key of `port`, if both files exist.
pub(crate) fn load_tls(dir: &Path, port: u16) -> MicrobusResult<Option<TlsAcceptor>> {
    let cert_path = dir.join(format!("httpingress-{port}-cert.pem"));
    let key_path = dir.join(format!("httpingress-{port}-key.pem"));
    if !cert_path.is_file() || !key_path.is_file() {
        return Ok(None);
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&cert_path)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MicrobusError::config_invalid(format!("{}: {e}", cert_path.display())))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&key_path)?))
        .map_err(|e| MicrobusError::config_invalid(format!("{}: {e}", key_path.display())))?
        .ok_or_else(|| MicrobusError::config_invalid(format!("no private key in {}", key_path.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| MicrobusError::config_invalid(format!("TLS config for port {port}: {e}")))?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_certificate_means_plain_http() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_tls(dir.path(), 443).unwrap().is_none());
    }

    #[test]
    fn test_garbage_certificate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("httpingress-443-cert.pem"), "not a certificate").unwrap();
        std::fs::write(dir.path().join("httpingress-443-key.pem"), "not a key").unwrap();
        assert!(load_tls(dir.path(), 443).is_err());
    }
}
