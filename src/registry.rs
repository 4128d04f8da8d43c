//! Connection registry: the single owner of per-tunnel connection state
//!
//! The registry maps each tunnel identifier to its set of registered client
//! connections and the FIFO queue of public requests waiting for a free one.
//! All mutation goes through the operations here; entries are serialized by
//! a per-identifier mutex so unrelated tunnels never contend.
//!
//! A connection's `busy` state is represented by physically moving its send
//! handle out of the entry while an exchange is in flight, so a connection
//! can never be paired with two requests at once.

use crate::error::ProxyBody;
use dashmap::DashMap;
use hyper::client::conn::http1::SendRequest;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// One registered client connection, free when its sender is present
struct ConnSlot {
    conn_id: u64,
    sender: Option<SendRequest<ProxyBody>>,
}

/// A queued public request, parked until a connection frees up.
/// Dropping the receiving side cancels the wait; the pump skips dead waiters.
type Waiter = oneshot::Sender<AcquiredConnection>;

/// Per-identifier state: connection set plus FIFO wait queue
struct ClientEntry {
    connections: Vec<ConnSlot>,
    waiting: VecDeque<Waiter>,
    /// Signals the tunnel listener to close when the last connection is gone
    closer: watch::Sender<bool>,
}

/// A reservation between "tunnel allocated" and "first client connection".
/// The epoch distinguishes it from earlier reservations of the same
/// identifier, so a stale grace-period reaper cannot expire a newer one.
struct Reservation {
    closer: watch::Sender<bool>,
    epoch: u64,
}

/// A connection handed out for exactly one exchange
pub struct AcquiredConnection {
    pub conn_id: u64,
    pub sender: SendRequest<ProxyBody>,
}

/// Outcome of an acquire-or-enqueue attempt
pub enum AcquireOutcome {
    /// A free connection was available
    Connection(AcquiredConnection),
    /// All connections busy; the request is queued FIFO
    Queued(oneshot::Receiver<AcquiredConnection>),
    /// No tunnel is registered under this identifier
    NotFound,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReserveError {
    #[error("identifier is actively registered")]
    Active,
    #[error("identifier is already reserved")]
    Reserved,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("no reservation or registration exists for this identifier")]
    UnknownTunnel,
    #[error("tunnel is at its connection limit")]
    AtCapacity,
}

/// Counters reported by the admin endpoint
#[derive(Debug, Default, serde::Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_tunnels: usize,
    pub pending_tunnels: usize,
    pub active_connections: usize,
    pub waiting_requests: usize,
}

/// Registry of all tunnel state, shared across tasks behind an `Arc`
pub struct Registry {
    entries: DashMap<String, Mutex<ClientEntry>>,
    pending: DashMap<String, Reservation>,
    max_conn_count: usize,
    next_conn_id: AtomicU64,
    next_epoch: AtomicU64,
}

impl Registry {
    pub fn new(max_conn_count: usize) -> Self {
        Self {
            entries: DashMap::new(),
            pending: DashMap::new(),
            max_conn_count,
            next_conn_id: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
        }
    }

    pub fn max_conn_count(&self) -> usize {
        self.max_conn_count
    }

    /// True when at least one client connection is registered for `id`
    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Record a PendingTunnel reservation. The registry is the uniqueness
    /// authority: an identifier that is reserved or registered is taken.
    /// Returns the reservation's epoch for use with [`expire_reservation`].
    ///
    /// [`expire_reservation`]: Registry::expire_reservation
    pub fn reserve(&self, id: &str, closer: watch::Sender<bool>) -> Result<u64, ReserveError> {
        if self.entries.contains_key(id) {
            return Err(ReserveError::Active);
        }
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ReserveError::Reserved),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Reservation { closer, epoch });
                Ok(epoch)
            }
        }
    }

    /// Drop a reservation and close its listener. Returns whether one existed.
    pub fn cancel_reservation(&self, id: &str) -> bool {
        if let Some((_, reservation)) = self.pending.remove(id) {
            let _ = reservation.closer.send(true);
            debug!(id, "tunnel reservation cancelled");
            true
        } else {
            false
        }
    }

    /// Reap a reservation only while it is still the one the caller made.
    /// An identifier that was re-reserved in the meantime is left alone.
    pub fn expire_reservation(&self, id: &str, epoch: u64) -> bool {
        if let Some((_, reservation)) = self.pending.remove_if(id, |_, r| r.epoch == epoch) {
            let _ = reservation.closer.send(true);
            debug!(id, "tunnel reservation expired");
            true
        } else {
            false
        }
    }

    /// Add a client connection under `id`. The first connection consumes the
    /// pending reservation; if a request queue already exists, the new
    /// connection is immediately paired with the oldest waiter.
    pub fn register(
        &self,
        id: &str,
        sender: SendRequest<ProxyBody>,
    ) -> Result<u64, RegisterError> {
        match self.entries.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let mut entry = occupied.get().lock();
                if entry.connections.len() >= self.max_conn_count {
                    return Err(RegisterError::AtCapacity);
                }
                let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                entry.connections.push(ConnSlot {
                    conn_id,
                    sender: Some(sender),
                });
                Self::pump(&mut entry);
                debug!(id, conn_id, total = entry.connections.len(), "connection registered");
                Ok(conn_id)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let Some((_, reservation)) = self.pending.remove(id) else {
                    return Err(RegisterError::UnknownTunnel);
                };
                let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Mutex::new(ClientEntry {
                    connections: vec![ConnSlot {
                        conn_id,
                        sender: Some(sender),
                    }],
                    waiting: VecDeque::new(),
                    closer: reservation.closer,
                }));
                debug!(id, conn_id, "first connection registered, tunnel active");
                Ok(conn_id)
            }
        }
    }

    /// Remove a connection. Releasing the last one frees the identifier,
    /// closes the tunnel listener, and fails every still-queued request.
    pub fn unregister(&self, id: &str, conn_id: u64) {
        let now_empty = {
            let Some(entry) = self.entries.get(id) else {
                return;
            };
            let mut entry = entry.lock();
            let before = entry.connections.len();
            entry.connections.retain(|c| c.conn_id != conn_id);
            if entry.connections.len() == before {
                return;
            }
            debug!(id, conn_id, remaining = entry.connections.len(), "connection unregistered");
            entry.connections.is_empty()
        };
        if now_empty {
            self.remove_if_empty(id);
        }
    }

    /// Hand out a free connection for `id`, or enqueue the caller FIFO.
    /// Check and enqueue are one critical section: a release racing with
    /// this call either sees the waiter or leaves a connection free.
    pub fn acquire(&self, id: &str) -> AcquireOutcome {
        let Some(entry) = self.entries.get(id) else {
            return AcquireOutcome::NotFound;
        };
        let mut entry = entry.lock();
        for slot in entry.connections.iter_mut() {
            if let Some(sender) = slot.sender.take() {
                return AcquireOutcome::Connection(AcquiredConnection {
                    conn_id: slot.conn_id,
                    sender,
                });
            }
        }
        let (tx, rx) = oneshot::channel();
        entry.waiting.push_back(tx);
        debug!(id, queued = entry.waiting.len(), "all connections busy, request queued");
        AcquireOutcome::Queued(rx)
    }

    /// Return a connection after an exchange. A reusable connection goes back
    /// into the free set and is immediately offered to the oldest waiter; a
    /// consumed one is removed (its socket is already closed or closing).
    pub fn release(
        &self,
        id: &str,
        conn_id: u64,
        sender: Option<SendRequest<ProxyBody>>,
        reusable: bool,
    ) {
        let now_empty = {
            let Some(entry) = self.entries.get(id) else {
                return;
            };
            let mut entry = entry.lock();
            let Some(idx) = entry.connections.iter().position(|c| c.conn_id == conn_id) else {
                // Unregistered while the exchange was in flight
                return;
            };
            match (reusable, sender) {
                (true, Some(sender)) => {
                    entry.connections[idx].sender = Some(sender);
                    Self::pump(&mut entry);
                    false
                }
                _ => {
                    entry.connections.remove(idx);
                    debug!(id, conn_id, "connection consumed by exchange");
                    entry.connections.is_empty()
                }
            }
        };
        if now_empty {
            self.remove_if_empty(id);
        }
    }

    /// Pair free connections with queued requests, oldest first. Waiters
    /// whose requester has gone away are skipped without consuming a
    /// connection.
    fn pump(entry: &mut ClientEntry) {
        loop {
            let Some(idx) = entry.connections.iter().position(|c| c.sender.is_some()) else {
                break;
            };
            let Some(waiter) = entry.waiting.pop_front() else {
                break;
            };
            let Some(sender) = entry.connections[idx].sender.take() else {
                continue;
            };
            let conn_id = entry.connections[idx].conn_id;
            if let Err(returned) = waiter.send(AcquiredConnection { conn_id, sender }) {
                entry.connections[idx].sender = Some(returned.sender);
            }
        }
    }

    fn remove_if_empty(&self, id: &str) {
        let removed = self
            .entries
            .remove_if(id, |_, entry| entry.lock().connections.is_empty());
        if let Some((_, entry)) = removed {
            let entry = entry.into_inner();
            let _ = entry.closer.send(true);
            // Dropping the queue fails every parked waiter
            debug!(id, dropped_waiters = entry.waiting.len(), "tunnel released");
        }
    }

    /// Tear down everything: listeners, connections, queued requests.
    pub fn clear(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let entry = entry.into_inner();
                let _ = entry.closer.send(true);
            }
        }
        let reserved: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in reserved {
            self.cancel_reservation(&id);
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            active_tunnels: self.entries.len(),
            pending_tunnels: self.pending.len(),
            ..RegistryStats::default()
        };
        for item in self.entries.iter() {
            let entry = item.lock();
            stats.active_connections += entry.connections.len();
            stats.waiting_requests += entry.waiting.len();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper_util::rt::TokioIo;

    /// Build a real HTTP/1.1 send handle over an in-memory pipe. The far end
    /// is returned so the connection stays open for the test's duration.
    async fn test_sender() -> (SendRequest<ProxyBody>, tokio::io::DuplexStream) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(client_io))
            .await
            .expect("in-memory handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });
        (sender, server_io)
    }

    fn closer() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_reserve_register_lifecycle() {
        let registry = Registry::new(10);
        let (tx, _rx) = closer();

        assert!(registry.reserve("abcd", tx).is_ok());
        assert!(!registry.has("abcd"));
        assert_eq!(registry.stats().pending_tunnels, 1);

        let (sender, _io) = test_sender().await;
        registry.register("abcd", sender).unwrap();

        assert!(registry.has("abcd"));
        let stats = registry.stats();
        assert_eq!(stats.pending_tunnels, 0);
        assert_eq!(stats.active_tunnels, 1);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_reserve_rejects_taken_identifiers() {
        let registry = Registry::new(10);
        let (tx1, _rx1) = closer();
        registry.reserve("abcd", tx1).unwrap();

        let (tx2, _rx2) = closer();
        assert_eq!(registry.reserve("abcd", tx2), Err(ReserveError::Reserved));

        let (sender, _io) = test_sender().await;
        registry.register("abcd", sender).unwrap();

        let (tx3, _rx3) = closer();
        assert_eq!(registry.reserve("abcd", tx3), Err(ReserveError::Active));
    }

    #[tokio::test]
    async fn test_register_without_reservation_fails() {
        let registry = Registry::new(10);
        let (sender, _io) = test_sender().await;
        assert_eq!(
            registry.register("zzzz", sender).unwrap_err(),
            RegisterError::UnknownTunnel
        );
    }

    #[tokio::test]
    async fn test_connection_limit_enforced() {
        let registry = Registry::new(2);
        let (tx, _rx) = closer();
        registry.reserve("abcd", tx).unwrap();

        let (s1, _io1) = test_sender().await;
        let (s2, _io2) = test_sender().await;
        let (s3, _io3) = test_sender().await;
        registry.register("abcd", s1).unwrap();
        registry.register("abcd", s2).unwrap();
        assert_eq!(
            registry.register("abcd", s3).unwrap_err(),
            RegisterError::AtCapacity
        );
        assert_eq!(registry.stats().active_connections, 2);
    }

    #[tokio::test]
    async fn test_acquire_marks_connection_busy() {
        let registry = Registry::new(10);
        let (tx, _rx) = closer();
        registry.reserve("abcd", tx).unwrap();
        let (sender, _io) = test_sender().await;
        registry.register("abcd", sender).unwrap();

        // First acquire takes the only connection
        let conn = match registry.acquire("abcd") {
            AcquireOutcome::Connection(c) => c,
            _ => panic!("expected a free connection"),
        };

        // Second concurrent request must queue, never double-assign
        match registry.acquire("abcd") {
            AcquireOutcome::Queued(_) => {}
            _ => panic!("expected to queue while connection is busy"),
        }

        drop(conn);
    }

    #[tokio::test]
    async fn test_acquire_unknown_identifier() {
        let registry = Registry::new(10);
        match registry.acquire("none") {
            AcquireOutcome::NotFound => {}
            _ => panic!("expected NotFound"),
        }
    }

    #[tokio::test]
    async fn test_release_dispatches_waiters_fifo() {
        let registry = Registry::new(10);
        let (tx, _rx) = closer();
        registry.reserve("abcd", tx).unwrap();
        let (sender, _io) = test_sender().await;
        registry.register("abcd", sender).unwrap();

        let held = match registry.acquire("abcd") {
            AcquireOutcome::Connection(c) => c,
            _ => panic!("expected a free connection"),
        };

        let rx1 = match registry.acquire("abcd") {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!("expected queue"),
        };
        let mut rx2 = match registry.acquire("abcd") {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!("expected queue"),
        };
        assert_eq!(registry.stats().waiting_requests, 2);

        // Releasing hands the connection to the oldest waiter first
        registry.release("abcd", held.conn_id, Some(held.sender), true);
        let first = rx1.await.expect("first waiter served");
        assert!(rx2.try_recv().is_err(), "second waiter must not overtake");

        registry.release("abcd", first.conn_id, Some(first.sender), true);
        rx2.await.expect("second waiter served");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let registry = Registry::new(10);
        let (tx, _rx) = closer();
        registry.reserve("abcd", tx).unwrap();
        let (sender, _io) = test_sender().await;
        registry.register("abcd", sender).unwrap();

        let held = match registry.acquire("abcd") {
            AcquireOutcome::Connection(c) => c,
            _ => panic!("expected a free connection"),
        };

        let rx1 = match registry.acquire("abcd") {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!("expected queue"),
        };
        let rx2 = match registry.acquire("abcd") {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!("expected queue"),
        };

        // First requester goes away before a connection frees up
        drop(rx1);

        registry.release("abcd", held.conn_id, Some(held.sender), true);
        rx2.await.expect("next live waiter served");
    }

    #[tokio::test]
    async fn test_unregister_last_connection_frees_identifier() {
        let registry = Registry::new(10);
        let (tx, mut close_rx) = closer();
        registry.reserve("abcd", tx).unwrap();
        let (sender, _io) = test_sender().await;
        let conn_id = registry.register("abcd", sender).unwrap();

        // Park a request, then kill the only connection
        let held = match registry.acquire("abcd") {
            AcquireOutcome::Connection(c) => c,
            _ => panic!("expected a free connection"),
        };
        let rx = match registry.acquire("abcd") {
            AcquireOutcome::Queued(rx) => rx,
            _ => panic!("expected queue"),
        };
        drop(held);
        registry.unregister("abcd", conn_id);

        assert!(!registry.has("abcd"));
        // Queued request fails rather than hanging forever
        assert!(rx.await.is_err());
        // Tunnel listener is told to close
        close_rx.changed().await.expect("closer signalled");
        assert!(*close_rx.borrow());

        // Identifier is immediately available again
        let (tx2, _rx2) = closer();
        assert!(registry.reserve("abcd", tx2).is_ok());
    }

    #[tokio::test]
    async fn test_release_non_reusable_removes_connection() {
        let registry = Registry::new(10);
        let (tx, _rx) = closer();
        registry.reserve("abcd", tx).unwrap();
        let (sender, _io) = test_sender().await;
        registry.register("abcd", sender).unwrap();

        let held = match registry.acquire("abcd") {
            AcquireOutcome::Connection(c) => c,
            _ => panic!("expected a free connection"),
        };
        registry.release("abcd", held.conn_id, None, false);

        assert!(!registry.has("abcd"));
        assert_eq!(registry.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_cancel_reservation() {
        let registry = Registry::new(10);
        let (tx, mut rx) = closer();
        registry.reserve("abcd", tx).unwrap();

        assert!(registry.cancel_reservation("abcd"));
        assert!(!registry.cancel_reservation("abcd"));
        rx.changed().await.expect("closer signalled");
        assert!(*rx.borrow());
        assert_eq!(registry.stats().pending_tunnels, 0);
    }

    #[tokio::test]
    async fn test_expire_reservation_respects_epoch() {
        let registry = Registry::new(10);
        let (tx1, _rx1) = closer();
        let first = registry.reserve("abcd", tx1).unwrap();
        registry.cancel_reservation("abcd");
        let (tx2, _rx2) = closer();
        let second = registry.reserve("abcd", tx2).unwrap();

        // A reaper holding the replaced reservation's epoch is a no-op
        assert!(!registry.expire_reservation("abcd", first));
        assert_eq!(registry.stats().pending_tunnels, 1);

        assert!(registry.expire_reservation("abcd", second));
        assert_eq!(registry.stats().pending_tunnels, 0);
    }

    #[tokio::test]
    async fn test_clear_tears_down_everything() {
        let registry = Registry::new(10);

        let (tx1, mut close1) = closer();
        registry.reserve("abcd", tx1).unwrap();
        let (sender, _io) = test_sender().await;
        registry.register("abcd", sender).unwrap();

        let (tx2, mut close2) = closer();
        registry.reserve("wxyz", tx2).unwrap();

        registry.clear();

        assert_eq!(registry.stats(), RegistryStats::default());
        close1.changed().await.expect("active tunnel closed");
        close2.changed().await.expect("pending tunnel closed");
    }
}
