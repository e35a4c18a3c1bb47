//! Message-passing port adapter.
//!
//! Models a named runtime port: messages are delivered asynchronously and
//! each end is told when the other disconnects (or is dropped). Closing an
//! end locally also notifies that end's own close handlers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Message;

use super::hub::Hub;
use super::listeners::Subscription;
use super::wire::WireEnd;
use super::{CloseHandler, CloseReason, Connector, MessageHandler, Transport, TransportKind};

// ============================================================================
// PortTransport
// ============================================================================

/// One end of a named message-passing port.
#[derive(Clone)]
pub struct PortTransport {
    /// Port name given at connect time.
    name: Arc<str>,
    /// Underlying duplex end.
    end: Arc<WireEnd>,
}

impl fmt::Debug for PortTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortTransport")
            .field("name", &self.name)
            .field("closed", &self.end.is_closed())
            .finish()
    }
}

impl PortTransport {
    /// Creates two connected port ends sharing `name`.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn pair(name: &str) -> (Self, Self) {
        let name: Arc<str> = Arc::from(name);
        let (a, b) = WireEnd::pair(true);

        (
            Self {
                name: Arc::clone(&name),
                end: a,
            },
            Self { name, end: b },
        )
    }

    /// Returns the port name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for PortTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Port
    }

    fn send(&self, message: Message) -> Result<()> {
        self.end.send(message)
    }

    fn subscribe(&self, handler: MessageHandler) -> Subscription {
        self.end.subscribe(handler)
    }

    fn on_close(&self, handler: CloseHandler) -> Subscription {
        self.end.on_close(handler)
    }

    fn close(&self) {
        self.end.shutdown(CloseReason::Local);
    }

    fn is_closed(&self) -> bool {
        self.end.is_closed()
    }
}

// ============================================================================
// PortConnector
// ============================================================================

/// Opens named ports through a [`Hub`].
#[derive(Debug, Clone)]
pub struct PortConnector {
    hub: Arc<Hub<PortTransport>>,
    name: String,
}

impl PortConnector {
    /// Creates a connector opening ports called `name`.
    #[must_use]
    pub fn new(hub: Arc<Hub<PortTransport>>, name: impl Into<String>) -> Self {
        Self {
            hub,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Connector for PortConnector {
    async fn open(&self) -> Result<Arc<dyn Transport>> {
        let port = self.hub.connect(|| PortTransport::pair(&self.name))?;
        Ok(Arc::new(port))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use crate::error::Error;

    #[tokio::test]
    async fn test_peer_disconnect_is_reported() {
        let (local, remote) = PortTransport::pair("content_script->background");
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));

        let _sub = local.on_close(Arc::new(move |reason: &CloseReason| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(reason.clone());
            }
        }));

        remote.close();
        let reason = timeout(Duration::from_secs(1), rx)
            .await
            .expect("disconnect reported")
            .expect("sender alive");
        assert_eq!(reason, CloseReason::Remote);
    }

    #[tokio::test]
    async fn test_dropped_peer_counts_as_disconnect() {
        let (local, remote) = PortTransport::pair("foreground");
        drop(remote);

        timeout(Duration::from_secs(1), async {
            while !local.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("closed after peer drop");
    }

    #[tokio::test]
    async fn test_local_close_notifies_own_handlers() {
        let (local, _remote) = PortTransport::pair("foreground");
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        let _sub = local.on_close(Arc::new(move |reason: &CloseReason| {
            *seen_clone.lock() = Some(reason.clone());
        }));

        local.close();
        local.close();
        assert_eq!(*seen.lock(), Some(CloseReason::Local));
        assert_eq!(local.kind(), TransportKind::Port);
    }

    #[tokio::test]
    async fn test_connector_requires_listener() {
        let hub = Hub::new("background");
        let connector = PortConnector::new(Arc::clone(&hub), "foreground");

        let result = connector.open().await;
        assert!(matches!(result, Err(Error::Unavailable { .. })));

        let accepted = Arc::new(Mutex::new(Vec::new()));
        let accepted_clone = Arc::clone(&accepted);
        let _sub = hub.accept(move |port: &PortTransport| {
            accepted_clone.lock().push(port.clone());
        });

        let transport = connector.open().await.expect("open");
        assert!(!transport.is_closed());
        assert_eq!(accepted.lock()[0].name(), "foreground");
    }
}
