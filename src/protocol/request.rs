//! Request and Response envelope types.
//!
//! Defines the logical, transport-agnostic JSON-RPC envelopes exchanged on
//! every hop.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// RequestInit
// ============================================================================

/// Request body before an id has been assigned.
///
/// Turned into a [`Request`] by [`RpcClient::create`](crate::client::RpcClient::create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInit {
    /// Method name.
    pub method: String,

    /// Method parameters (opaque).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RequestInit {
    /// Creates a request body without params.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Value::Null,
        }
    }

    /// Sets the params.
    #[inline]
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

// ============================================================================
// Request
// ============================================================================

/// A request envelope.
///
/// # Format
///
/// ```json
/// { "id": 1, "method": "eth_chainId", "params": [] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Unique identifier for request/response correlation.
    pub id: RequestId,

    /// Method name.
    pub method: String,

    /// Method parameters (opaque).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    /// Creates a request with a specific id.
    #[inline]
    #[must_use]
    pub fn with_id(id: RequestId, init: RequestInit) -> Self {
        Self {
            id,
            method: init.method,
            params: init.params,
        }
    }

    /// Strips the id, keeping method and params.
    #[inline]
    #[must_use]
    pub fn into_init(self) -> RequestInit {
        RequestInit {
            method: self.method,
            params: self.params,
        }
    }

    /// Returns the first positional param, if params is a non-empty array.
    #[must_use]
    pub fn first_param(&self) -> Option<&Value> {
        self.params.as_array().and_then(|params| params.first())
    }
}

// ============================================================================
// RpcError
// ============================================================================

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    #[serde(default = "RpcError::default_code")]
    pub code: i64,

    /// Human readable message.
    pub message: String,

    /// Optional extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// The method does not exist on the peer.
    pub const METHOD_NOT_FOUND: i64 = -32601;

    /// Generic failure while processing the request.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Creates an error object.
    #[inline]
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a method not found error.
    #[inline]
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Creates an internal error.
    #[inline]
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    /// Attaches extra data.
    #[inline]
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Converts a local error into an error object for the wire.
    ///
    /// Remote errors keep their original code.
    #[must_use]
    pub fn rewrap(error: &Error) -> Self {
        match error {
            Error::Rpc(inner) => inner.clone(),
            other => Self::internal(other.to_string()),
        }
    }

    const fn default_code() -> i64 {
        Self::INTERNAL_ERROR
    }
}

// ============================================================================
// Response
// ============================================================================

/// A response envelope.
///
/// # Format
///
/// Success:
/// ```json
/// { "id": 1, "result": "0x1" }
/// ```
///
/// Error:
/// ```json
/// { "id": 1, "error": { "code": -32603, "message": "...", "data": null } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Matches the request `id`.
    pub id: RequestId,

    /// Result data (if success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error object (if error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Creates a success response.
    #[inline]
    #[must_use]
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    #[inline]
    #[must_use]
    pub fn err(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Creates a response from a handler outcome.
    #[inline]
    #[must_use]
    pub fn from_result(id: RequestId, result: std::result::Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(error) => Self::err(id, error),
        }
    }

    /// Returns the same response addressed to another id.
    #[inline]
    #[must_use]
    pub fn rewrap(self, id: RequestId) -> Self {
        Self { id, ..self }
    }

    /// Returns `true` if this is a success response.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns `true` if this is an error response.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Extracts the result value, returning error if response was error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rpc`] carrying the remote error object.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(Error::Rpc(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
