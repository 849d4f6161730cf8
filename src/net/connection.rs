//! Connection state machine and the accept loop.
//!
//! # Responsibilities
//! - Own exactly one TCP socket per connection
//! - Track lifecycle state (Idle → Accepting|Connecting → Established → Closed)
//! - Generate unique connection IDs for tracing
//! - Admit inbound sockets until the acceptor is closed
//!
//! Connections are handed upward as `Arc<Connection>`; the socket is torn
//! down when the last holder drops it, or earlier via [`Connection::close`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{MappedMutexGuard, MutexGuard as SocketGuard};

use crate::lifecycle::shutdown::ShutdownListener;
use crate::net::error::ConnectionError;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, no socket yet.
    Idle,
    /// Waiting in an accept on the listener.
    Accepting,
    /// Outbound connect in flight.
    Connecting,
    /// Socket has a live remote peer.
    Established,
    /// Socket released. Terminal.
    Closed,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle, Accepting) | (Idle, Connecting) => true,
            (Accepting, Established) | (Connecting, Established) => true,
            (from, Closed) => from != Closed,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    remote: Option<SocketAddr>,
}

/// A single TCP connection, inbound or outbound.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    lifecycle: Mutex<Lifecycle>,
    socket: tokio::sync::Mutex<Option<TcpStream>>,
}

impl Connection {
    fn new() -> Self {
        Self::in_state(ConnectionState::Idle)
    }

    /// A connection whose socket slot is handed to an in-flight accept.
    fn accepting() -> Self {
        Self::in_state(ConnectionState::Accepting)
    }

    fn in_state(state: ConnectionState) -> Self {
        Self {
            id: ConnectionId::next(),
            lifecycle: Mutex::new(Lifecycle { state, remote: None }),
            socket: tokio::sync::Mutex::new(None),
        }
    }

    /// Dial `endpoint`.
    pub async fn connect(endpoint: SocketAddr) -> Result<Arc<Self>, ConnectionError> {
        let mut connection = Self::new();
        connection.advance(ConnectionState::Idle, ConnectionState::Connecting)?;

        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                connection.establish(ConnectionState::Connecting, stream, endpoint)?;
                tracing::debug!(connection_id = %connection.id, remote = %endpoint, "Connected");
                Ok(Arc::new(connection))
            }
            Err(e) => {
                connection.close().await;
                Err(ConnectionError::Connect(e))
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state
    }

    /// Remote peer address. Only valid once established.
    pub fn remote_endpoint(&self) -> Result<SocketAddr, ConnectionError> {
        let lifecycle = self.lifecycle();
        match (lifecycle.state, lifecycle.remote) {
            (ConnectionState::Established, Some(remote)) => Ok(remote),
            (actual, _) => Err(ConnectionError::StateMismatch {
                expected: ConnectionState::Established,
                actual,
            }),
        }
    }

    /// Exclusive access to the socket for the protocol layer.
    pub async fn socket(&self) -> Result<MappedMutexGuard<'_, TcpStream>, ConnectionError> {
        SocketGuard::try_map(self.socket.lock().await, Option::as_mut).map_err(|_| ConnectionError::Closed)
    }

    /// Release the socket. Idempotent.
    ///
    /// Waits for any holder of [`socket`](Self::socket) to finish first.
    pub async fn close(&self) {
        if self.mark_closed() {
            self.socket.lock().await.take();
            tracing::trace!(connection_id = %self.id, "Connection closed");
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != from || !from.can_become(to) {
            return Err(ConnectionError::StateMismatch {
                expected: from,
                actual: lifecycle.state,
            });
        }
        lifecycle.state = to;
        Ok(())
    }

    /// Install the live socket. Only possible before the connection is shared.
    fn establish(&mut self, from: ConnectionState, stream: TcpStream, remote: SocketAddr) -> Result<(), ConnectionError> {
        self.advance(from, ConnectionState::Established)?;
        self.lifecycle().remote = Some(remote);
        *self.socket.get_mut() = Some(stream);
        Ok(())
    }

    /// Returns true if this call performed the transition to `Closed`.
    fn mark_closed(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == ConnectionState::Closed {
            return false;
        }
        lifecycle.state = ConnectionState::Closed;
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.mark_closed();
        self.socket.get_mut().take();
    }
}

/// Accept connections on `acceptor` until `closed` fires, handing each one
/// to `on_accepted`. Failed accepts are logged and retried after a backoff;
/// only closing the acceptor ends the loop. The listener is dropped on exit.
pub async fn accept_loop<F>(acceptor: TcpListener, mut closed: ShutdownListener, on_accepted: F)
where
    F: Fn(Arc<Connection>) + Send + 'static,
{
    let mut backoff = Backoff::new(Duration::from_millis(5), Duration::from_secs(1));

    loop {
        let mut connection = Connection::accepting();

        tokio::select! {
            _ = closed.triggered() => break,
            accepted = acceptor.accept() => match accepted {
                Ok((stream, remote)) => {
                    backoff.reset();
                    if let Err(e) = connection.establish(ConnectionState::Accepting, stream, remote) {
                        tracing::error!(error = %e, "Accepted socket rejected by connection state");
                        continue;
                    }
                    metrics::record_connection_accepted();
                    tracing::debug!(connection_id = %connection.id, remote = %remote, "Connection accepted");
                    on_accepted(Arc::new(connection));
                }
                Err(e) => {
                    metrics::record_accept_error();
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        consecutive_failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Accept failed"
                    );
                    tokio::select! {
                        _ = closed.triggered() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    tracing::info!(
        address = ?acceptor.local_addr().ok(),
        "Acceptor closed"
    );
}
