//! Error types for hopwire.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use hopwire::{Error, Result};
//!
//! async fn example(client: &PooledClient) -> Result<()> {
//!     let response = client.try_request(RequestInit::new("eth_chainId")).await?;
//!     let chain = response.into_result()?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::SlotOutOfRange`] |
//! | Acquisition | [`Error::Unavailable`], [`Error::HandshakeTimeout`], [`Error::HandshakeFailed`] |
//! | Connection | [`Error::TransportDisconnected`], [`Error::SendFailed`], [`Error::HeartbeatTimeout`] |
//! | Request | [`Error::ResponseTimeout`], [`Error::Cancelled`], [`Error::TooManyPending`], [`Error::Rpc`] |
//! | Protocol | [`Error::Protocol`], [`Error::Json`] |
//! | Retry | [`Error::RetriesExhausted`] |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;
use std::sync::Arc;

use thiserror::Error;

use crate::identifiers::RequestId;
use crate::protocol::RpcError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// `Error` is `Clone` so that one failed connection build can be reported to
/// every caller waiting on the same pool slot.
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client or pool configuration is invalid. Never retried.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Pool slot index outside the pool capacity.
    #[error("Slot {index} out of range (capacity {capacity})")]
    SlotOutOfRange {
        /// Requested slot index.
        index: usize,
        /// Fixed pool capacity.
        capacity: usize,
    },

    // ========================================================================
    // Acquisition Errors
    // ========================================================================
    /// Underlying platform API is momentarily unavailable.
    ///
    /// Returned when no peer is listening yet (e.g. the background context
    /// is still starting). Retried after a backoff delay.
    #[error("Transport unavailable: {message}")]
    Unavailable {
        /// Description of why the transport could not be opened.
        message: String,
    },

    /// Peer did not acknowledge the hello message in time.
    #[error("Handshake timeout after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Transport-level failure while opening or handshaking.
    #[error("Handshake failed: {message}")]
    HandshakeFailed {
        /// Description of the handshake failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Close observed while a request was in flight.
    #[error("Transport disconnected")]
    TransportDisconnected,

    /// Transport refused an outgoing message.
    #[error("Send failed: {message}")]
    SendFailed {
        /// Description of the send failure.
        message: String,
    },

    /// Keepalive deadline elapsed without a pong.
    #[error("Heartbeat timeout after {timeout_ms}ms")]
    HeartbeatTimeout {
        /// Milliseconds waited for the pong.
        timeout_ms: u64,
    },

    // ========================================================================
    // Request Errors
    // ========================================================================
    /// Caller deadline elapsed with no matching response.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    ResponseTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Caller-initiated abort.
    #[error("Request cancelled")]
    Cancelled,

    /// Too many in-flight requests on one pending table.
    #[error("Too many pending requests: {pending}/{max}")]
    TooManyPending {
        /// Current number of pending entries.
        pending: usize,
        /// Table capacity.
        max: usize,
    },

    /// Error object returned by the remote peer.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or unexpected envelope.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    // ========================================================================
    // Retry Errors
    // ========================================================================
    /// Retry loop gave up.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<Error>,
    },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a slot out of range error.
    #[inline]
    pub fn slot_out_of_range(index: usize, capacity: usize) -> Self {
        Self::SlotOutOfRange { index, capacity }
    }

    /// Creates an unavailable error.
    #[inline]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a handshake timeout error.
    #[inline]
    pub fn handshake_timeout(timeout_ms: u64) -> Self {
        Self::HandshakeTimeout { timeout_ms }
    }

    /// Creates a handshake failed error.
    #[inline]
    pub fn handshake_failed(message: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            message: message.into(),
        }
    }

    /// Creates a send failed error.
    #[inline]
    pub fn send_failed(message: impl Into<String>) -> Self {
        Self::SendFailed {
            message: message.into(),
        }
    }

    /// Creates a heartbeat timeout error.
    #[inline]
    pub fn heartbeat_timeout(timeout_ms: u64) -> Self {
        Self::HeartbeatTimeout { timeout_ms }
    }

    /// Creates a response timeout error.
    #[inline]
    pub fn response_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::ResponseTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a retries exhausted error.
    #[inline]
    pub fn retries_exhausted(attempts: u32, last: Error) -> Self {
        Self::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::HeartbeatTimeout { .. }
                | Self::ResponseTimeout { .. }
        )
    }

    /// Returns `true` if this error concerns connection acquisition.
    #[inline]
    #[must_use]
    pub fn is_acquisition_error(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::HandshakeTimeout { .. } | Self::HandshakeFailed { .. }
        )
    }

    /// Returns `true` if the connection that produced this error is unusable.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::TransportDisconnected | Self::SendFailed { .. } | Self::HeartbeatTimeout { .. }
        )
    }

    /// Returns `true` if the caller asked for this outcome.
    ///
    /// Caller deadlines and aborts are surfaced as-is and never retried.
    #[inline]
    #[must_use]
    pub fn is_caller_initiated(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. } | Self::Cancelled)
    }
}

// ============================================================================
// Tests
// ============================================================================
