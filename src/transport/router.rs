//! Server-side dispatch.
//!
//! The receiving side of every hop answers three kinds of traffic:
//!
//! | Incoming | Reply |
//! |----------|-------|
//! | `Hello` | `Hello` echo (completes the peer's handshake) |
//! | ping (id 0) | pong |
//! | any other request | handler result, or method-not-found |
//!
//! Hops are bidirectional: a router can also send its own requests to the
//! peer with [`Router::request`]. Responses are correlated by id through the
//! router's pending table.
//!
//! [`Router`] serves one transport; [`Server`] accepts transports from a
//! [`Hub`] and keeps a router per accepted transport.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::{Future, pending};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::client::RpcClient;
use crate::error::{Error, Result};
use crate::protocol::{Message, Request, RequestInit, Response, RpcError};

use super::hub::Hub;
use super::listeners::Subscription;
use super::pending::PendingTable;
use super::{CloseReason, Transport};

// ============================================================================
// RequestHandler
// ============================================================================

/// Application logic answering inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request.
    ///
    /// Returns `None` if the method is not handled here; the router then
    /// replies with a method-not-found error.
    async fn handle(&self, request: Request) -> Option<std::result::Result<Value, RpcError>>;
}

/// Answers `request` on `transport`.
///
/// Handler work runs on its own task so a slow handler never blocks
/// message delivery on the transport.
pub(crate) fn dispatch(
    transport: Arc<dyn Transport>,
    handler: Option<Arc<dyn RequestHandler>>,
    request: Request,
) {
    let Some(handler) = handler else {
        reply(&*transport, Response::err(request.id, RpcError::method_not_found(&request.method)));
        return;
    };

    tokio::spawn(async move {
        let id = request.id;
        let method = request.method.clone();

        let response = match handler.handle(request).await {
            Some(outcome) => Response::from_result(id, outcome),
            None => Response::err(id, RpcError::method_not_found(&method)),
        };

        reply(&*transport, response);
    });
}

fn reply(transport: &dyn Transport, response: Response) {
    let id = response.id;
    if let Err(e) = transport.send(response.into()) {
        debug!(id = %id, error = %e, "Could not deliver response");
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Requests initiated by the serving side.
struct Outbound {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    rpc: RpcClient,
}

impl Outbound {
    async fn request_or_cancel<C>(
        &self,
        init: RequestInit,
        deadline: Duration,
        cancel: C,
    ) -> Result<Response>
    where
        C: Future<Output = ()>,
    {
        let request = self.rpc.create(init);
        let id = request.id;
        let waiter = self.pending.register(id)?;

        if self.transport.is_closed() {
            return Err(Error::TransportDisconnected);
        }

        self.transport.send(request.into())?;
        trace!(id = %id, "Router request sent");

        waiter.wait_or_cancel(deadline, cancel).await
    }
}

// ============================================================================
// Router
// ============================================================================

/// Serves one transport.
///
/// Dropping the router stops serving but leaves the transport open; call
/// [`Router::close`] to close it as well.
pub struct Router {
    outbound: Arc<Outbound>,
    subscriptions: Vec<Subscription>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("kind", &self.outbound.transport.kind())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Starts serving `transport` with `handler`.
    #[must_use]
    pub fn serve(transport: Arc<dyn Transport>, handler: Arc<dyn RequestHandler>) -> Self {
        Self::serve_with(transport, Some(handler), Arc::new(AtomicBool::new(false)))
    }

    /// Starts serving; messages are ignored while `suspended` is set.
    pub(crate) fn serve_with(
        transport: Arc<dyn Transport>,
        handler: Option<Arc<dyn RequestHandler>>,
        suspended: Arc<AtomicBool>,
    ) -> Self {
        let pending = PendingTable::new();
        let weak: Weak<dyn Transport> = Arc::downgrade(&transport);
        let responses = Arc::downgrade(&pending);

        let messages = transport.subscribe(Arc::new(move |message: &Message| {
            if suspended.load(Ordering::SeqCst) {
                trace!("Suspended, ignoring message");
                return;
            }

            let Some(transport) = weak.upgrade() else {
                return;
            };

            match message {
                Message::Hello(_) => {
                    if let Err(e) = transport.send(Message::hello()) {
                        warn!(error = %e, "Could not echo hello");
                    }
                }
                Message::Request(request) if message.is_ping() => {
                    trace!(id = %request.id, "Answering ping");
                    let _ = transport.send(Message::pong());
                }
                Message::Request(request) => {
                    dispatch(transport, handler.clone(), request.clone());
                }
                Message::Response(response) if response.id.is_ping() => {}
                Message::Response(response) => {
                    if let Some(pending) = responses.upgrade() {
                        pending.resolve(response.clone());
                    }
                }
            }
        }));

        let waiters = Arc::downgrade(&pending);
        let closes = transport.on_close(Arc::new(move |_: &CloseReason| {
            if let Some(pending) = waiters.upgrade() {
                pending.fail_all(&Error::TransportDisconnected);
            }
        }));

        Self {
            outbound: Arc::new(Outbound {
                transport,
                pending,
                rpc: RpcClient::new(),
            }),
            subscriptions: vec![messages, closes],
        }
    }

    /// Sends a request to the peer and waits up to `deadline` for the reply.
    ///
    /// The request gets a fresh id. An error response from the peer is
    /// returned as `Ok`; inspect [`Response::is_error`].
    ///
    /// # Errors
    ///
    /// - [`Error::TransportDisconnected`] if the transport is or becomes
    ///   closed
    /// - [`Error::SendFailed`] if the transport rejects the message
    /// - [`Error::ResponseTimeout`] if `deadline` elapses
    /// - [`Error::TooManyPending`] if too many requests are in flight
    pub async fn request(&self, init: RequestInit, deadline: Duration) -> Result<Response> {
        self.outbound.request_or_cancel(init, deadline, pending()).await
    }

    /// Like [`Router::request`], also giving up when `cancel` completes.
    ///
    /// # Errors
    ///
    /// As [`Router::request`], plus [`Error::Cancelled`].
    pub async fn request_or_cancel<C>(
        &self,
        init: RequestInit,
        deadline: Duration,
        cancel: C,
    ) -> Result<Response>
    where
        C: Future<Output = ()>,
    {
        self.outbound.request_or_cancel(init, deadline, cancel).await
    }

    /// Returns the served transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.outbound.transport
    }

    /// Returns `true` once the served transport is closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.transport.is_closed()
    }

    /// Returns the number of outbound requests awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.outbound.pending.len()
    }

    /// Stops serving and closes the transport.
    ///
    /// Outbound requests still waiting fail with
    /// [`Error::TransportDisconnected`].
    pub fn close(self) {
        let Self {
            outbound,
            subscriptions,
        } = self;
        drop(subscriptions);
        outbound.transport.close();
        outbound.pending.fail_all(&Error::TransportDisconnected);
    }
}

// ============================================================================
// Server
// ============================================================================

/// Internal shared state for [`Server`].
struct ServerInner {
    handler: Arc<dyn RequestHandler>,
    routers: Mutex<Vec<Router>>,
    suspended: Arc<AtomicBool>,
    acceptor: Mutex<Option<Subscription>>,
}

impl ServerInner {
    /// Drops routers whose transport is gone and returns the newest open one.
    fn prune(&self) -> Option<Arc<Outbound>> {
        let mut routers = self.routers.lock();
        let before = routers.len();
        routers.retain(|router| !router.is_closed());

        if routers.len() < before {
            trace!(pruned = before - routers.len(), "Dropped closed routers");
        }

        routers.last().map(|router| Arc::clone(&router.outbound))
    }
}

/// Receiving context: accepts transports from a [`Hub`] and serves each.
///
/// A suspended server ignores everything, including handshakes and pings,
/// the way a background context that was put to sleep would.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("routers", &self.inner.routers.lock().len())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

impl Server {
    /// Accepts every transport opened through `hub`.
    #[must_use]
    pub fn listen<T>(hub: &Hub<T>, handler: Arc<dyn RequestHandler>) -> Self
    where
        T: Transport + Clone,
    {
        let inner = Arc::new(ServerInner {
            handler,
            routers: Mutex::new(Vec::new()),
            suspended: Arc::new(AtomicBool::new(false)),
            acceptor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let acceptor = hub.accept(move |remote: &T| {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let transport: Arc<dyn Transport> = Arc::new(remote.clone());
            debug!(kind = %transport.kind(), "Accepted transport");

            let router = Router::serve_with(
                transport,
                Some(Arc::clone(&inner.handler)),
                Arc::clone(&inner.suspended),
            );

            inner.prune();
            inner.routers.lock().push(router);
        });

        *inner.acceptor.lock() = Some(acceptor);
        Self { inner }
    }

    /// Sends a request to the most recently accepted open transport.
    ///
    /// # Errors
    ///
    /// - [`Error::Unavailable`] if no transport is open
    /// - whatever [`Router::request`] fails with
    pub async fn request(&self, init: RequestInit, deadline: Duration) -> Result<Response> {
        let outbound = self
            .inner
            .prune()
            .ok_or_else(|| Error::unavailable("no peer connected"))?;

        outbound.request_or_cancel(init, deadline, pending()).await
    }

    /// Stops answering anything until [`Server::resume`].
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
    }

    /// Resumes answering.
    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while suspended.
    #[inline]
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    /// Returns the number of open accepted transports.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.prune();
        self.inner.routers.lock().len()
    }

    /// Closes every accepted transport. The server keeps accepting.
    pub fn disconnect_all(&self) {
        let routers: Vec<Router> = self.inner.routers.lock().drain(..).collect();
        let count = routers.len();

        for router in routers {
            router.close();
        }

        debug!(count, "Disconnected all transports");
    }

    /// Stops accepting and closes every accepted transport.
    pub fn shutdown(&self) {
        self.inner.acceptor.lock().take();
        self.disconnect_all();
    }
}

// ============================================================================
// Tests
// ============================================================================
