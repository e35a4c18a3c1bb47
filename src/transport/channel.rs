//! Message-channel adapter.
//!
//! Models a pair of entangled message-channel ports. Unlike
//! [`PortTransport`](super::PortTransport), a channel never fires close
//! handlers when the other end goes away. An end whose peer closed only
//! reports [`Transport::is_closed`] afterwards, and a suspended peer just
//! stops answering. Pools over channels should enable the keepalive monitor.

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
// ChannelTransport
// ============================================================================

/// One port of a message channel.
#[derive(Clone)]
pub struct ChannelTransport {
    end: Arc<WireEnd>,
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("closed", &self.end.is_closed())
            .finish()
    }
}

impl ChannelTransport {
    /// Creates the two ports of a new channel.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a, b) = WireEnd::pair(false);
        (Self { end: a }, Self { end: b })
    }
}

impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
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
// ChannelConnector
// ============================================================================

/// Creates channels and posts one port to the context accepting on a [`Hub`].
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    hub: Arc<Hub<ChannelTransport>>,
}

impl ChannelConnector {
    /// Creates a connector posting ports to `hub`.
    #[must_use]
    pub fn new(hub: Arc<Hub<ChannelTransport>>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self) -> Result<Arc<dyn Transport>> {
        let port = self.hub.connect(ChannelTransport::pair)?;
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

    #[tokio::test]
    async fn test_peer_close_is_silent() {
        let (local, remote) = ChannelTransport::pair();
        let closed = Arc::new(Mutex::new(false));
        let closed_clone = Arc::clone(&closed);

        let _sub = local.on_close(Arc::new(move |_: &CloseReason| {
            *closed_clone.lock() = true;
        }));

        remote.close();
        drop(remote);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!*closed.lock());
        assert!(local.is_closed());
        assert_eq!(local.kind(), TransportKind::Channel);
    }

    #[tokio::test]
    async fn test_connector_posts_remote_port() {
        let hub = Hub::new("service-worker");
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let accepted_clone = Arc::clone(&accepted);

        let _sub = hub.accept(move |port: &ChannelTransport| {
            accepted_clone.lock().push(port.clone());
        });

        let connector = ChannelConnector::new(hub);
        let transport = connector.open().await.expect("open");

        assert_eq!(transport.kind(), TransportKind::Channel);
        assert_eq!(accepted.lock().len(), 1);
    }
}
