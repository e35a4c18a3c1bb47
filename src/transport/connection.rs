//! Handshaken connection and request correlation.
//!
//! A [`Connection`] wraps one transport after the `Hello` handshake
//! succeeded. It owns the transport's routing subscriptions and the pending
//! request table:
//!
//! - Responses are matched to pending requests by id; unmatched responses
//!   are dropped.
//! - Pings from the peer are answered with pongs.
//! - Other requests from the peer go to the optional [`RequestHandler`].
//! - A close notification fails every pending request with
//!   [`Error::TransportDisconnected`].
//!
//! # Teardown
//!
//! [`Connection::teardown`] is idempotent and runs in a fixed order: stop the
//! keepalive, drop external listeners, close the transport, fail whatever is
//! still pending, drop routing subscriptions.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::{Future, pending};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{Message, Request, Response};

use super::keepalive::Keepalive;
use super::listeners::Subscription;
use super::pending::PendingTable;
use super::router::{RequestHandler, dispatch};
use super::{CloseReason, Transport, TransportKind};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on the `Hello` handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// ConnectionState
// ============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `Hello` sent, echo not received yet.
    Connecting,
    /// Handshake complete; requests may be sent.
    Ready,
    /// Transport closed or connection torn down. Terminal.
    Closed,
}

// ============================================================================
// Connection
// ============================================================================

/// Internal shared state for a connection.
struct ConnectionInner {
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    pending: Arc<PendingTable>,
    /// Message and close routing owned by this connection.
    routes: Mutex<Vec<Subscription>>,
    /// Listeners installed by the owner (e.g. the pool's close listener).
    retained: Mutex<Vec<Subscription>>,
    keepalive: Mutex<Option<Keepalive>>,
    torn_down: AtomicBool,
}

impl ConnectionInner {
    fn mark_closed(&self, reason: &CloseReason) {
        let previous = mem::replace(&mut *self.state.lock(), ConnectionState::Closed);
        self.pending.fail_all(&Error::TransportDisconnected);

        if previous != ConnectionState::Closed {
            debug!(kind = %self.transport.kind(), ?reason, "Connection closed");
        }
    }

    fn route(&self, message: &Message, handler: Option<&Arc<dyn RequestHandler>>) {
        match message {
            Message::Hello(_) => trace!("Ignoring hello after handshake"),
            Message::Response(response) if response.id.is_ping() => {}
            Message::Response(response) => {
                self.pending.resolve(response.clone());
            }
            Message::Request(request) if message.is_ping() => {
                trace!(id = %request.id, "Answering ping");
                let _ = self.transport.send(Message::pong());
            }
            Message::Request(request) => {
                dispatch(Arc::clone(&self.transport), handler.cloned(), request.clone());
            }
        }
    }
}

/// A transport that completed the `Hello` handshake.
///
/// Cheap to clone; clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Connection {
    /// Performs the `Hello` handshake over `transport`.
    ///
    /// Routing is installed before `Hello` is sent, so the echo cannot be
    /// missed. `handler` answers requests initiated by the peer; without
    /// one they get a method-not-found reply.
    ///
    /// # Errors
    ///
    /// - [`Error::HandshakeTimeout`] if no echo arrives within
    ///   `handshake_timeout`
    /// - [`Error::HandshakeFailed`] if `Hello` cannot be sent or the
    ///   transport closes during the handshake
    ///
    /// The transport is closed on every error path.
    pub async fn establish(
        transport: Arc<dyn Transport>,
        handshake_timeout: Duration,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Self> {
        let inner = Arc::new(ConnectionInner {
            transport: Arc::clone(&transport),
            state: Mutex::new(ConnectionState::Connecting),
            pending: PendingTable::new(),
            routes: Mutex::new(Vec::new()),
            retained: Mutex::new(Vec::new()),
            keepalive: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });

        let (hello_tx, hello_rx) = oneshot::channel::<()>();
        let hello_slot = Arc::new(Mutex::new(Some(hello_tx)));

        let weak = Arc::downgrade(&inner);
        let hello = Arc::clone(&hello_slot);
        let messages = transport.subscribe(Arc::new(move |message: &Message| {
            if message.is_hello()
                && let Some(tx) = hello.lock().take()
            {
                let _ = tx.send(());
                return;
            }

            if let Some(inner) = weak.upgrade() {
                inner.route(message, handler.as_ref());
            }
        }));

        let weak = Arc::downgrade(&inner);
        let hello = Arc::clone(&hello_slot);
        let closes = transport.on_close(Arc::new(move |reason: &CloseReason| {
            hello.lock().take();
            if let Some(inner) = weak.upgrade() {
                inner.mark_closed(reason);
            }
        }));

        inner.routes.lock().extend([messages, closes]);
        let connection = Self { inner };

        if let Err(e) = transport.send(Message::hello()) {
            connection.teardown();
            return Err(Error::handshake_failed(format!("Could not send hello: {e}")));
        }
        trace!(kind = %transport.kind(), "Hello sent");

        match timeout(handshake_timeout, hello_rx).await {
            Ok(Ok(())) => {
                let mut state = connection.inner.state.lock();
                if *state != ConnectionState::Connecting || transport.is_closed() {
                    drop(state);
                    connection.teardown();
                    return Err(Error::handshake_failed("transport closed during handshake"));
                }
                *state = ConnectionState::Ready;
            }
            Ok(Err(_)) => {
                connection.teardown();
                return Err(Error::handshake_failed("transport closed during handshake"));
            }
            Err(_) => {
                connection.teardown();
                return Err(Error::handshake_timeout(
                    handshake_timeout.as_millis() as u64,
                ));
            }
        }

        debug!(kind = %transport.kind(), "Handshake completed");
        Ok(connection)
    }

    /// Sends `request` and waits up to `deadline` for its response.
    ///
    /// An error response from the peer is returned as `Ok`; inspect
    /// [`Response::is_error`].
    ///
    /// # Errors
    ///
    /// - [`Error::TransportDisconnected`] if the connection is not ready or
    ///   closes while waiting
    /// - [`Error::SendFailed`] if the transport rejects the message
    /// - [`Error::ResponseTimeout`] if `deadline` elapses
    /// - [`Error::TooManyPending`] if too many requests are in flight
    pub async fn request(&self, request: Request, deadline: Duration) -> Result<Response> {
        self.request_or_cancel(request, deadline, pending()).await
    }

    /// Like [`Connection::request`], also giving up when `cancel` completes.
    ///
    /// # Errors
    ///
    /// As [`Connection::request`], plus [`Error::Cancelled`].
    pub async fn request_or_cancel<C>(
        &self,
        request: Request,
        deadline: Duration,
        cancel: C,
    ) -> Result<Response>
    where
        C: Future<Output = ()>,
    {
        if request.id.is_ping() {
            return Err(Error::protocol("request id 0 is reserved for heartbeats"));
        }

        if self.state() != ConnectionState::Ready {
            return Err(Error::TransportDisconnected);
        }

        let id = request.id;
        let waiter = self.inner.pending.register(id)?;

        // A close that raced the registration has already drained the table.
        if self.inner.transport.is_closed() {
            return Err(Error::TransportDisconnected);
        }

        self.inner.transport.send(request.into())?;
        trace!(id = %id, "Request sent");

        waiter.wait_or_cancel(deadline, cancel).await
    }

    /// Attaches a keepalive monitor; it is stopped on teardown.
    pub fn attach_keepalive(&self, keepalive: Keepalive) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            keepalive.stop();
            return;
        }
        *self.inner.keepalive.lock() = Some(keepalive);
    }

    /// Keeps `subscription` alive until teardown.
    pub fn retain(&self, subscription: Subscription) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
        self.inner.retained.lock().push(subscription);
    }

    /// Tears the connection down. Idempotent.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let keepalive = self.inner.keepalive.lock().take();
        if let Some(keepalive) = keepalive {
            keepalive.stop();
        }

        let retained = mem::take(&mut *self.inner.retained.lock());
        drop(retained);

        self.inner.transport.close();
        self.inner.mark_closed(&CloseReason::Local);

        let routes = mem::take(&mut *self.inner.routes.lock());
        drop(routes);

        trace!(kind = %self.kind(), "Connection torn down");
    }

    /// Returns the underlying transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.transport)
    }

    /// Returns the transport family.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Returns the lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Returns `true` once the connection can no longer carry requests.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed || self.inner.transport.is_closed()
    }

    /// Returns the number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Returns `true` if both handles refer to the same connection.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// Tests
// ============================================================================
