//! Hopwire - resilient pooled JSON-RPC across unreliable message hops.
//!
//! This library moves request/response traffic across a chain of
//! message-passing contexts (page, content script, background, foreground)
//! where any hop may be unavailable, torn down, or silently dead.
//!
//! # Architecture
//!
//! Every hop speaks the same envelopes over a [`Transport`](transport::Transport):
//!
//! - **Client role**: a [`PooledClient`] keeps handshaken connections in a
//!   fixed-size pool and retries through it
//! - **Server role**: a [`Router`](transport::Router) echoes handshakes,
//!   answers heartbeats, dispatches requests to a handler, and can send
//!   its own requests back to the peer
//!
//! Key design principles:
//!
//! - Every connection starts with a bounded `Hello` handshake
//! - Responses are matched by id; resends always use a fresh id
//! - A closed or silent connection is evicted and rebuilt in the background
//! - Failures are classified: cancel, retry after backoff, or skip to a
//!   fresh connection
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hopwire::protocol::RequestInit;
//! use hopwire::transport::{Hub, PortConnector};
//! use hopwire::{PooledClient, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let hub = Hub::new("background");
//!
//!     let client = PooledClient::builder(PortConnector::new(Arc::clone(&hub), "content_script"))
//!         .capacity(1)
//!         .build()?;
//!
//!     let chain_id = client.request(RequestInit::new("eth_chainId")).await?;
//!     println!("Chain: {chain_id}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bridge`] | Content-script [`Relay`] between page bus and upstream |
//! | [`client`] | [`PooledClient`], its builder and id allocation |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Request ids and slot generations |
//! | [`protocol`] | Wire envelopes |
//! | [`provider`] | Page-side [`Provider`] |
//! | [`retry`] | Failure classification and the retry loop |
//! | [`transport`] | Transports, connections, pool, keepalive, router |

// ============================================================================
// Modules
// ============================================================================

/// Content-script relay.
pub mod bridge;

/// Pooled client and id allocation.
///
/// Use [`PooledClient::builder()`] to create a configured client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire envelopes: requests, responses and the handshake sentinel.
pub mod protocol;

/// Page-side provider.
pub mod provider;

/// Failure classification and retry loop.
pub mod retry;

/// Transport layer.
///
/// Transport adapters plus the connection, pool and router machinery.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use bridge::{Relay, RelayHandle};
pub use client::{ClientBuilder, PooledClient, RpcClient, RpcCounter};
pub use provider::{Listener, Provider};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{Generation, RequestId};

// Protocol types
pub use protocol::{Message, Request, RequestInit, Response, RpcError};

// Retry types
pub use retry::{RetryPolicy, RetrySignal, classify, try_loop};
