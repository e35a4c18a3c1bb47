//! Message transport layer.
//!
//! This module defines the uniform capability every hop implements and the
//! machinery built on top of it: handshaken connections, the connection
//! pool, the keepalive monitor, and the server-side router.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  EventBus   ┌────────────────┐   Port    ┌──────────────┐  Channel  ┌──────────────┐
//! │ Page         │◄───────────►│ Content script │◄─────────►│ Background   │◄─────────►│ Foreground   │
//! │ (Provider)   │ DOM events  │ (Relay + pool) │  connect  │ (Router)     │ keepalive │ (pool)       │
//! └──────────────┘             └────────────────┘           └──────────────┘           └──────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `ConnectionPool::get` - slot empty, the pool asks its [`Connector`] to open a transport
//! 2. `Connection::establish` - send `Hello`, wait for the echo (bounded)
//! 3. Keepalive wired (if configured), close listener installed
//! 4. `Connection::request` - multiplex requests, correlate responses by id
//! 5. Close, heartbeat timeout or `delete` - teardown, slot back to empty
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `listeners` | Handler registries and [`Subscription`] handles |
//! | `wire` | Entangled in-process duplex used by ports and channels |
//! | `event_bus` | Named-event broadcast bus and its adapter |
//! | `port` | Message-passing port adapter (reports disconnects) |
//! | `channel` | Message-channel adapter (silent on disconnect) |
//! | `hub` | Rendezvous point standing in for `connect` APIs |
//! | `pending` | Request/response correlation table |
//! | `connection` | Handshaken connection with request correlation |
//! | `keepalive` | Ping/pong monitor |
//! | `pool` | Fixed-capacity single-flight connection pool |
//! | `router` | Server-side hello/ping/request dispatch |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Message;

// ============================================================================
// Submodules
// ============================================================================

/// Message-channel adapter.
pub mod channel;

/// Handshaken connection and request correlation.
pub mod connection;

/// Named-event bus adapter.
pub mod event_bus;

/// Rendezvous point for opening transports.
pub mod hub;

/// Ping/pong keepalive monitor.
pub mod keepalive;

/// Handler registries and subscriptions.
pub mod listeners;

/// Pending request table.
pub mod pending;

/// Fixed-capacity connection pool.
pub mod pool;

/// Message-passing port adapter.
pub mod port;

/// Server-side dispatch.
pub mod router;

mod wire;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{ChannelConnector, ChannelTransport};
pub use connection::{Connection, ConnectionState};
pub use event_bus::{BusRole, EventBus, EventBusTransport};
pub use hub::Hub;
pub use keepalive::{Keepalive, KeepaliveConfig};
pub use listeners::{Handler, Listeners, Subscription};
pub use pending::{MAX_PENDING_REQUESTS, PendingRequest, PendingTable};
pub use pool::{ConnectionPool, PoolOptions, SlotStatus};
pub use port::{PortConnector, PortTransport};
pub use router::{RequestHandler, Router, Server};

// ============================================================================
// Types
// ============================================================================

/// Handler for incoming messages.
pub type MessageHandler = Handler<Message>;

/// Handler for close notifications.
pub type CloseHandler = Handler<CloseReason>;

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on this end.
    Local,
    /// The peer went away.
    Remote,
}

/// Which adapter family a transport belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// DOM-style custom events on a shared bus.
    EventBus,
    /// Message-passing port with disconnect notification.
    Port,
    /// Message channel without disconnect notification.
    Channel,
}

impl TransportKind {
    /// Returns `true` if the peer going away is reported as a close event.
    ///
    /// Transports that return `false` need a keepalive monitor to notice a
    /// dead peer.
    #[inline]
    #[must_use]
    pub const fn reports_remote_close(&self) -> bool {
        matches!(self, Self::Port)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventBus => f.write_str("event-bus"),
            Self::Port => f.write_str("port"),
            Self::Channel => f.write_str("channel"),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// The four-operation capability every hop provides.
///
/// Implementations must deliver close notifications for local `close()`
/// calls as well, so requests in flight on a torn-down connection fail
/// instead of hanging.
pub trait Transport: Send + Sync + 'static {
    /// Returns the adapter family.
    fn kind(&self) -> TransportKind;

    /// Sends a message to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailed`](crate::Error::SendFailed) if the
    /// transport is closed or the peer is gone.
    fn send(&self, message: Message) -> Result<()>;

    /// Registers a handler for incoming messages.
    fn subscribe(&self, handler: MessageHandler) -> Subscription;

    /// Registers a handler for the close notification.
    fn on_close(&self, handler: CloseHandler) -> Subscription;

    /// Closes the transport. Idempotent.
    fn close(&self);

    /// Returns `true` once the transport is closed.
    fn is_closed(&self) -> bool;
}

/// Opens transports for a connection pool.
///
/// Each call returns a fresh, not yet handshaken transport.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new transport to the peer.
    ///
    /// # Errors
    ///
    /// - [`Error::Unavailable`](crate::Error::Unavailable) if the platform
    ///   API is momentarily unavailable
    /// - [`Error::HandshakeFailed`](crate::Error::HandshakeFailed) on any
    ///   other open failure
    async fn open(&self) -> Result<Arc<dyn Transport>>;
}

// ============================================================================
// Tests
// ============================================================================
