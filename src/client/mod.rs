//! Caller-facing RPC client.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`RpcCounter`] | Process-wide, never reused request ids |
//! | [`RpcClient`] | Stamps request bodies with fresh ids |
//! | [`PooledClient`] | `try_request` over a pool, under the retry policy |
//! | [`ClientBuilder`] | Fluent configuration builder |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hopwire::protocol::RequestInit;
//! use hopwire::transport::{Hub, PortConnector};
//! use hopwire::PooledClient;
//!
//! # async fn example() -> hopwire::Result<()> {
//! let hub = Hub::new("background");
//! let client = PooledClient::builder(PortConnector::new(Arc::clone(&hub), "content_script"))
//!     .build()?;
//!
//! let response = client.try_request(RequestInit::new("eth_chainId")).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder for [`PooledClient`].
pub mod builder;

/// Pooled client with retry.
pub mod pooled;

/// Request id allocation.
pub mod rpc;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;
pub use pooled::PooledClient;
pub use rpc::{RpcClient, RpcCounter};
