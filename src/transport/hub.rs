//! Rendezvous point for opening transports.
//!
//! A [`Hub`] stands in for the platform call that reaches another execution
//! context (`runtime.connect`, posting a port to the active service
//! worker). The receiving context registers an accept handler; a connecting
//! context hands it one end of a fresh transport. With nobody listening the
//! connect fails with [`Error::Unavailable`], which retry loops treat as
//! transient.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};

use super::listeners::{Listeners, Subscription};

// ============================================================================
// Hub
// ============================================================================

/// Rendezvous point where one context accepts transports opened by another.
pub struct Hub<T> {
    /// Hub name, used in error messages and logs.
    name: String,
    /// Accept handlers of the receiving context.
    acceptors: Listeners<T>,
}

impl<T> fmt::Debug for Hub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Hub<T> {
    /// Creates a hub with no acceptor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            acceptors: Listeners::new(),
        })
    }

    /// Returns the hub name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the receiving context.
    ///
    /// The handler receives the remote end of every opened transport.
    pub fn accept(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.acceptors.add(Arc::new(handler))
    }

    /// Returns `true` if a receiving context is registered.
    #[inline]
    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.acceptors.is_empty()
    }

    /// Opens a transport pair and hands the remote end to the acceptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if no context accepts on this hub.
    pub fn connect(&self, open: impl FnOnce() -> (T, T)) -> Result<T> {
        if !self.is_listening() {
            return Err(Error::unavailable(format!(
                "Could not establish connection to '{}': receiving end does not exist",
                self.name
            )));
        }

        let (local, remote) = open();
        self.acceptors.emit(&remote);

        debug!(hub = %self.name, "Transport opened");

        Ok(local)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_connect_without_acceptor_is_unavailable() {
        let hub = Hub::<u32>::new("background");
        let result = hub.connect(|| (1, 2));

        assert!(matches!(result, Err(Error::Unavailable { .. })));
        assert!(!hub.is_listening());
    }

    #[test]
    fn test_connect_hands_remote_end_to_acceptor() {
        let hub = Hub::<u32>::new("background");
        let accepted = Arc::new(AtomicU32::new(0));
        let accepted_clone = Arc::clone(&accepted);

        let _sub = hub.accept(move |remote: &u32| {
            accepted_clone.store(*remote, Ordering::SeqCst);
        });

        let local = hub.connect(|| (1, 2)).expect("connect");
        assert_eq!(local, 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropping_acceptor_stops_listening() {
        let hub = Hub::<u32>::new("worker");
        let sub = hub.accept(|_| {});
        assert!(hub.is_listening());

        drop(sub);
        assert!(!hub.is_listening());
    }
}
