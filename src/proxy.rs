//! Proxy engine: pairs public requests with registered client connections
//!
//! One exchange at a time flows over each registered connection. The request
//! is written verbatim as HTTP/1.1 and the response streamed back verbatim;
//! the engine never reinterprets payload bytes. A connection is released the
//! moment its response body is fully framed, at which point the oldest
//! queued request for the same tunnel is dispatched onto it.
//!
//! Release is owned by [`ConnectionLease`], an RAII guard threaded through
//! the response body, so every completion path - clean end, stream error,
//! requester disconnect - returns or discards the connection exactly once.

use crate::error::{gateway_response, GatewayErrorCode, ProxyBody};
use crate::registry::{AcquireOutcome, AcquiredConnection, Registry};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::client::conn::http1::SendRequest;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Forward one public request through the tunnel registered under `id`.
///
/// Suspends on the wait queue when every connection is busy; the held
/// response stays uncommitted until a connection frees up or the tunnel
/// goes away.
pub async fn proxy_request<B>(
    registry: &Arc<Registry>,
    id: &str,
    req: Request<B>,
) -> Response<ProxyBody>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let req = Request::from_parts(parts, body.boxed());

    let conn = match registry.acquire(id) {
        AcquireOutcome::Connection(conn) => conn,
        AcquireOutcome::Queued(rx) => {
            debug!(id, "waiting for a free tunnel connection");
            match rx.await {
                Ok(conn) => conn,
                Err(_) => {
                    return gateway_response(
                        GatewayErrorCode::TunnelDisconnected,
                        "tunnel closed while the request was queued",
                    );
                }
            }
        }
        AcquireOutcome::NotFound => {
            return gateway_response(
                GatewayErrorCode::TunnelNotFound,
                format!("no tunnel registered for '{}'", id),
            );
        }
    };

    dispatch(registry, id, conn, method, req).await
}

/// Run one exchange over an acquired connection
async fn dispatch(
    registry: &Arc<Registry>,
    id: &str,
    mut conn: AcquiredConnection,
    method: Method,
    req: Request<ProxyBody>,
) -> Response<ProxyBody> {
    debug!(id, conn_id = conn.conn_id, method = %method, "forwarding request");

    // A reused sender may still be flushing its previous exchange; a dead
    // one (socket dropped while idle) fails here instead of mid-request
    if let Err(e) = conn.sender.ready().await {
        warn!(id, conn_id = conn.conn_id, error = %e, "connection unusable before the exchange");
        registry.release(id, conn.conn_id, None, false);
        return gateway_response(
            GatewayErrorCode::TunnelDisconnected,
            "tunnel client dropped before the exchange",
        );
    }

    match conn.sender.send_request(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            let reusable = connection_survives(&method, parts.status, &parts.headers);
            let lease = ConnectionLease {
                registry: Arc::clone(registry),
                id: id.to_string(),
                conn_id: conn.conn_id,
                sender: Some(conn.sender),
                reusable: false,
            };
            let body = TrackedBody {
                inner: body,
                lease: Some(lease),
                reusable_on_end: reusable,
            };
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            warn!(id, conn_id = conn.conn_id, error = %e, "client connection failed before responding");
            registry.release(id, conn.conn_id, None, false);
            gateway_response(
                GatewayErrorCode::TunnelDisconnected,
                "tunnel client dropped during the exchange",
            )
        }
    }
}

/// Will the connection be usable for another exchange once this response
/// body ends? Responses without self-delimiting framing are terminated by
/// EOF, which consumes the socket; so does an explicit close or an upgrade.
fn connection_survives(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    if status.is_informational() {
        return false;
    }
    let close_requested = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("close"))
        .unwrap_or(false);
    if close_requested {
        return false;
    }
    if method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return true;
    }
    headers.contains_key(hyper::header::TRANSFER_ENCODING)
        || headers.contains_key(hyper::header::CONTENT_LENGTH)
}

/// Guard owning the acquired connection for the duration of one exchange.
/// On drop it either returns the connection to the free set (clean, framed
/// completion) or discards it (error, EOF-framed response, or the requester
/// walked away mid-stream).
struct ConnectionLease {
    registry: Arc<Registry>,
    id: String,
    conn_id: u64,
    sender: Option<SendRequest<ProxyBody>>,
    reusable: bool,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let sender = self.sender.take();
        if self.reusable {
            self.registry.release(&self.id, self.conn_id, sender, true);
        } else {
            self.registry.release(&self.id, self.conn_id, None, false);
        }
    }
}

/// Response body that releases its connection lease when the stream ends
struct TrackedBody {
    inner: Incoming,
    lease: Option<ConnectionLease>,
    reusable_on_end: bool,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if let Some(mut lease) = this.lease.take() {
                    lease.reusable = this.reusable_on_end;
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                // Mid-stream failure: the response is already committed, so
                // the stream just terminates; the connection is discarded.
                this.lease.take();
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
