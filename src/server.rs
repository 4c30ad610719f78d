//! The relay listener
//!
//! One TCP port serves both kinds of peer. Each accepted connection gets its
//! own task: the TLS handshake decides whether it is a backend registering
//! itself or a public client, and it is handed to admission or to HTTP serving
//! accordingly.

use crate::admission::Admission;
use crate::pool::Pool;
use crate::router::Router;
use crate::session::SessionConfig;
use crate::tls::{Negotiated, TlsOverlay};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Default deadline for completing a TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The relay server: backend admission and public request routing on one port
pub struct RelayServer {
    bind_addr: SocketAddr,
    overlay: Arc<TlsOverlay>,
    router: Router,
    admission: Admission,
    shutdown_rx: watch::Receiver<bool>,
    handshake_timeout: Duration,
}

impl RelayServer {
    pub fn new(
        bind_addr: SocketAddr,
        overlay: TlsOverlay,
        session_config: SessionConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let pool = Pool::new(session_config.drain_timeout);
        Self {
            bind_addr,
            overlay: Arc::new(overlay),
            router: Router::new(pool.clone()),
            admission: Admission::new(pool, session_config),
            shutdown_rx,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Get the backend pool (for statistics)
    pub fn pool(&self) -> &Pool {
        self.admission.pool()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Relay listening for backends and clients");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let overlay = Arc::clone(&self.overlay);
                            let router = self.router.clone();
                            let admission = self.admission.clone();
                            let handshake_timeout = self.handshake_timeout;

                            tokio::spawn(async move {
                                handle_connection(stream, addr, overlay, router, admission, handshake_timeout).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    overlay: Arc<TlsOverlay>,
    router: Router,
    admission: Admission,
    handshake_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let negotiated = match tokio::time::timeout(handshake_timeout, overlay.accept(stream)).await {
        Ok(Ok(negotiated)) => negotiated,
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!(addr = %addr, timeout_secs = handshake_timeout.as_secs(), "TLS handshake timed out");
            return;
        }
    };

    match negotiated {
        Negotiated::Backend { stream, identity } => {
            debug!(addr = %addr, backend = %identity, "Backend negotiated relay protocol");
            admission.serve(stream, identity).await;
        }
        Negotiated::Client(stream) => {
            if let Err(e) = serve_client(stream, addr, router).await {
                debug!(addr = %addr, error = %e, "Client connection error");
            }
        }
    }
}

async fn serve_client<S>(stream: S, addr: SocketAddr, router: Router) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.handle(req, addr).await) }
    });

    // HTTP/1.1 or HTTP/2, whichever the client negotiated
    AutoBuilder::new(TokioExecutor::new())
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}
