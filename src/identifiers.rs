//! Type-safe identifiers.
//!
//! Newtype wrappers keep request ids, slot generations and other integers
//! from being mixed up at compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// RequestId
// ============================================================================

/// Identifier correlating a request with its response.
///
/// Ids are allocated by [`RpcCounter`](crate::client::RpcCounter) and are
/// never reused within a process. Id `0` is reserved for heartbeat traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Reserved id shared by every ping and pong.
    pub const PING: Self = Self(0);

    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the reserved heartbeat id.
    #[inline]
    #[must_use]
    pub const fn is_ping(&self) -> bool {
        self.0 == Self::PING.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Build generation of a pool slot.
///
/// Bumped whenever a slot starts a build or is reset, so late results and
/// close events from a previous connection can be recognised and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u64);

impl Generation {
    /// Returns the following generation.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_transparent() {
        let json = serde_json::to_string(&RequestId::new(42)).expect("serialize");
        assert_eq!(json, "42");

        let id: RequestId = serde_json::from_str("42").expect("parse");
        assert_eq!(id.as_u64(), 42);
    }

    #[test]
    fn test_ping_is_reserved() {
        assert!(RequestId::PING.is_ping());
        assert!(!RequestId::new(1).is_ping());
    }

    #[test]
    fn test_generation_increments() {
        let generation = Generation::default();
        assert_eq!(generation.next().as_u64(), 1);
        assert!(generation.next() > generation);
    }
}
