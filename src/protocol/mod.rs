//! Wire protocol message types.
//!
//! This module defines the logical envelopes exchanged on every hop. They
//! are transport-agnostic: in-process adapters move [`Message`] values
//! directly, the event-bus adapter carries them as JSON text.
//!
//! # Protocol Overview
//!
//! | Message | Purpose |
//! |---------|---------|
//! | `Hello` | Handshake sentinel, echoed by the peer |
//! | `Request` | `{ id, method, params }` |
//! | `Response` | `{ id, result }` or `{ id, error: { code, message, data? } }` |
//!
//! Heartbeats are requests with method [`PING_METHOD`] and the reserved id
//! [`RequestId::PING`](crate::RequestId::PING); the pong is a success
//! response with the same id.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | The [`Message`] union and heartbeat helpers |
//! | `request` | Request, Response and error object types |

// ============================================================================
// Submodules
// ============================================================================

/// Message union and handshake sentinel.
pub mod message;

/// Request and Response envelope types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{Hello, Message, PING_METHOD};
pub use request::{Request, RequestInit, Response, RpcError};
