//! Tunnel allocation: reservations, per-tunnel listeners, client intake
//!
//! Each allocation reserves an identifier, binds an ephemeral TCP listener
//! for the client's connections, and answers with the public URL derived
//! from whatever hostname the requester used to reach us. A reservation the
//! client never claims is reaped after a grace period; a claimed tunnel's
//! listener stays open until its last connection unregisters.

use crate::error::{AllocateError, ProxyBody};
use crate::id;
use crate::registry::Registry;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Retry budget for random identifier generation before giving up
const MAX_GENERATE_ATTEMPTS: usize = 10;

/// Result of a successful allocation, serialized as the allocation response
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub url: String,
    pub port: u16,
    pub max_conn_count: usize,
}

/// Creates tunnels and owns their listener tasks
pub struct TunnelAllocator {
    registry: Arc<Registry>,
    bind_host: String,
    grace_period: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelAllocator {
    pub fn new(
        registry: Arc<Registry>,
        bind_host: String,
        grace_period: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            bind_host,
            grace_period,
            shutdown_rx,
        }
    }

    /// Allocate a tunnel, generating an identifier unless the caller
    /// requested one. `origin` is the Host header the requester used; the
    /// published URL is formed from it so no domain is hardcoded.
    pub async fn allocate(
        &self,
        requested: Option<&str>,
        origin: &str,
    ) -> Result<TunnelInfo, AllocateError> {
        let (id, close_rx, epoch) = self.reserve_identifier(requested)?;

        let listener = match TcpListener::bind((self.bind_host.as_str(), 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.registry.expire_reservation(&id, epoch);
                return Err(AllocateError::Bind(e));
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                self.registry.expire_reservation(&id, epoch);
                return Err(AllocateError::Bind(e));
            }
        };

        let url = format!("http://{}.{}", id, origin);
        info!(id, port, url, "tunnel allocated");

        tokio::spawn(run_tunnel(
            listener,
            id.clone(),
            epoch,
            Arc::clone(&self.registry),
            close_rx,
            self.shutdown_rx.clone(),
            self.grace_period,
        ));

        Ok(TunnelInfo {
            id,
            url,
            port,
            max_conn_count: self.registry.max_conn_count(),
        })
    }

    /// Validate or generate an identifier and reserve it in the registry
    fn reserve_identifier(
        &self,
        requested: Option<&str>,
    ) -> Result<(String, watch::Receiver<bool>, u64), AllocateError> {
        match requested {
            Some(requested) => {
                if !id::validate(requested) {
                    return Err(AllocateError::InvalidIdentifier(requested.to_string()));
                }
                if self.registry.has(requested) {
                    return Err(AllocateError::IdentifierInUse(requested.to_string()));
                }
                // A reconnecting client may race its own stale reservation;
                // the newer request wins it
                self.registry.cancel_reservation(requested);
                let (close_tx, close_rx) = watch::channel(false);
                let epoch = self
                    .registry
                    .reserve(requested, close_tx)
                    .map_err(|_| AllocateError::IdentifierInUse(requested.to_string()))?;
                Ok((requested.to_string(), close_rx, epoch))
            }
            None => {
                for _ in 0..MAX_GENERATE_ATTEMPTS {
                    let candidate = id::generate();
                    let (close_tx, close_rx) = watch::channel(false);
                    if let Ok(epoch) = self.registry.reserve(&candidate, close_tx) {
                        return Ok((candidate, close_rx, epoch));
                    }
                }
                Err(AllocateError::IdentifierExhausted)
            }
        }
    }
}

/// Accept loop for one tunnel's listener. Runs until the grace period
/// expires unclaimed, the registry signals the tunnel is gone, or the
/// server shuts down.
async fn run_tunnel(
    listener: TcpListener,
    id: String,
    epoch: u64,
    registry: Arc<Registry>,
    mut close_rx: watch::Receiver<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    grace_period: Duration,
) {
    let grace_deadline = tokio::time::sleep(grace_period);
    tokio::pin!(grace_deadline);
    let mut claimed = false;

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    claimed = true;
                    debug!(id, peer = %peer, "client connection accepted");
                    spawn_registered_connection(Arc::clone(&registry), id.clone(), stream);
                }
                Err(e) => {
                    warn!(id, error = %e, "failed to accept tunnel connection");
                }
            },
            _ = &mut grace_deadline, if !claimed => {
                debug!(id, "no client connected within the grace period");
                // Epoch-checked so a newer reservation of the same
                // identifier is never reaped by this stale deadline
                registry.expire_reservation(&id, epoch);
                break;
            }
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!(id, "tunnel listener closed");
}

/// Drive one accepted client socket as an HTTP/1.1 client connection and
/// keep it registered for its lifetime.
fn spawn_registered_connection(registry: Arc<Registry>, id: String, stream: TcpStream) {
    tokio::spawn(async move {
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let (sender, conn) = match hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .handshake::<_, ProxyBody>(io)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                debug!(id, error = %e, "handshake on accepted connection failed");
                return;
            }
        };

        let conn_id = match registry.register(&id, sender) {
            Ok(conn_id) => conn_id,
            Err(e) => {
                // Dropping the socket is the rejection
                debug!(id, error = %e, "rejecting tunnel connection");
                return;
            }
        };

        if let Err(e) = conn.await {
            debug!(id, conn_id, error = %e, "tunnel connection ended with error");
        }
        registry.unregister(&id, conn_id);
    });
}
