//! Public server façade: the HTTP listener every tunnel is reached through
//!
//! Each inbound request is classified by the router and dispatched to the
//! allocator (new tunnels) or the proxy engine (registered tunnels). The
//! façade owns lifecycle: binding the public listener is fatal on failure,
//! and shutdown tears down the registry, which closes every tunnel listener
//! and registered connection behind it.

use crate::error::{gateway_response, GatewayErrorCode, ProxyBody};
use crate::proxy;
use crate::registry::Registry;
use crate::router::{self, Action};
use crate::tunnel::{TunnelAllocator, TunnelInfo};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The public-facing tunnel server
pub struct TunnelServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    allocator: Arc<TunnelAllocator>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelServer {
    /// Bind the public listener. Failure here is fatal for the process.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        registry: Arc<Registry>,
        allocator: Arc<TunnelAllocator>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind public listener: {}", e))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            registry,
            allocator,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "tunnel server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let allocator = Arc::clone(&self.allocator);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry, allocator).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("tunnel server shutting down");
                        break;
                    }
                }
            }
        }

        // Closes every tunnel listener and registered connection
        self.registry.clear();

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<Registry>,
    allocator: Arc<TunnelAllocator>,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let allocator = Arc::clone(&allocator);
        async move { Ok::<_, hyper::Error>(handle_request(req, registry, allocator).await) }
    });

    hyper::server::conn::http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<Registry>,
    allocator: Arc<TunnelAllocator>,
) -> Response<ProxyBody> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    debug!(host, method = %req.method(), uri = %req.uri(), "incoming request");

    match router::route(&path_and_query, &host, |id| registry.has(id)) {
        Action::NewTunnel(requested) => {
            let origin = if host.is_empty() { "localhost" } else { host.as_str() };
            match allocator.allocate(requested.as_deref(), origin).await {
                Ok(info) => allocation_response(&info),
                Err(e) => {
                    debug!(error = %e, "allocation failed");
                    gateway_response(e.code(), e.to_string())
                }
            }
        }
        Action::Proxy(id) => proxy::proxy_request(&registry, &id, req).await,
        Action::NotFound => gateway_response(
            GatewayErrorCode::TunnelNotFound,
            "no tunnel matches this request",
        ),
    }
}

fn allocation_response(info: &TunnelInfo) -> Response<ProxyBody> {
    let body = serde_json::to_string(info).unwrap_or_else(|_| {
        format!(
            r#"{{"id":"{}","url":"{}","port":{},"max_conn_count":{}}}"#,
            info.id, info.url, info.port, info.max_conn_count
        )
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
