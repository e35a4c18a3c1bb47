//! Wire message union.
//!
//! Everything a transport carries is a [`Message`]: the hello sentinel used
//! by the handshake, a request, or a response. Heartbeats are ordinary
//! requests and responses using the reserved [`RequestId::PING`] id.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Value, from_str, to_string};

use crate::error::Result;
use crate::identifiers::RequestId;

use super::{Request, RequestInit, Response};

// ============================================================================
// Constants
// ============================================================================

/// Reserved method name for heartbeat pings.
pub const PING_METHOD: &str = "hopwire_ping";

// ============================================================================
// Hello
// ============================================================================

/// Handshake sentinel.
///
/// Sent by the connecting side right after the transport opens and echoed
/// back by the peer. Serialized as the JSON string `"HELLO_WORLD"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hello {
    /// The only hello value.
    #[serde(rename = "HELLO_WORLD")]
    World,
}

// ============================================================================
// Message
// ============================================================================

/// Any envelope exchanged on a hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Request (has a `method`).
    Request(Request),
    /// Response (has `result` or `error`).
    Response(Response),
    /// Handshake sentinel.
    Hello(Hello),
}

impl Message {
    /// Creates the handshake message.
    #[inline]
    #[must_use]
    pub const fn hello() -> Self {
        Self::Hello(Hello::World)
    }

    /// Creates a heartbeat ping.
    #[inline]
    #[must_use]
    pub fn ping() -> Self {
        Self::Request(Request::with_id(RequestId::PING, RequestInit::new(PING_METHOD)))
    }

    /// Creates a heartbeat pong.
    #[inline]
    #[must_use]
    pub fn pong() -> Self {
        Self::Response(Response::ok(RequestId::PING, Value::Bool(true)))
    }

    /// Returns `true` for the handshake sentinel.
    #[inline]
    #[must_use]
    pub fn is_hello(&self) -> bool {
        matches!(self, Self::Hello(_))
    }

    /// Returns `true` for a heartbeat ping.
    #[inline]
    #[must_use]
    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Request(request) if request.id.is_ping() && request.method == PING_METHOD)
    }

    /// Returns `true` for a heartbeat pong.
    #[inline]
    #[must_use]
    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Response(response) if response.id.is_ping())
    }

    /// Parses a message from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the text is not a valid envelope.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(from_str(text)?)
    }

    /// Serializes the message to JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(to_string(self)?)
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

// ============================================================================
// Tests
// ============================================================================
