//! Admin API for health checks and tunnel metrics

use crate::registry::Registry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Read-only admin server exposing registry counters
pub struct AdminServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    started_at: Instant,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind admin listener: {}", e))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            registry,
            started_at: Instant::now(),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let started_at = self.started_at;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, registry, started_at).await {
                                    debug!(addr = %addr, error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    registry: Arc<Registry>,
    started_at: Instant,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = Arc::clone(&registry);
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, registry, started_at)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("admin connection error: {}", e))?;

    Ok(())
}

fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<Registry>,
    started_at: Instant,
) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),
        (&Method::GET, "/status") => {
            let stats = registry.stats();
            let body = serde_json::json!({
                "uptime_seconds": started_at.elapsed().as_secs(),
                "active_tunnels": stats.active_tunnels,
                "pending_tunnels": stats.pending_tunnels,
                "active_connections": stats.active_connections,
                "waiting_requests": stats.waiting_requests,
                "version": VERSION,
            });
            json_response(StatusCode::OK, body.to_string())
        }
        _ => response(StatusCode::NOT_FOUND, "Not Found"),
    }
}
