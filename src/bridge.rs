//! Content-script relay.
//!
//! The relay sits between the page's event bus and the background hop:
//!
//! - page requests arriving on the bus are forwarded upstream through a
//!   [`PooledClient`] (with a fresh id) and answered on the bus with the
//!   page's original id
//! - notifications pushed down by the background are re-emitted on the bus
//!   as page events
//!
//! Every page request gets exactly one response: upstream failures become
//! error responses.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::client::PooledClient;
use crate::protocol::{Message, Request, Response, RpcError};
use crate::transport::event_bus::notification_event;
use crate::transport::{EventBus, EventBusTransport, RequestHandler, Subscription, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Upstream notifications re-emitted to the page by default.
pub const DEFAULT_NOTIFICATIONS: &[&str] = &[
    "connect",
    "disconnect",
    "accountsChanged",
    "chainChanged",
    "networkChanged",
];

// ============================================================================
// Relay
// ============================================================================

struct RelayInner {
    bus: Arc<EventBus>,
    notifications: FxHashSet<String>,
}

/// Bridges a page event bus to an upstream [`PooledClient`].
///
/// As a [`RequestHandler`] it answers upstream notifications; pass it to
/// [`ClientBuilder::handler`](crate::ClientBuilder::handler) so requests
/// pushed by the background reach the page.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("notifications", &self.inner.notifications)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Creates a relay re-emitting [`DEFAULT_NOTIFICATIONS`].
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_notifications(bus, DEFAULT_NOTIFICATIONS)
    }

    /// Creates a relay re-emitting only `notifications`.
    #[must_use]
    pub fn with_notifications(bus: Arc<EventBus>, notifications: &[&str]) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                bus,
                notifications: notifications.iter().map(|s| (*s).to_string()).collect(),
            }),
        }
    }

    /// Returns the page bus.
    #[inline]
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Returns `true` if `method` is re-emitted to the page.
    #[inline]
    #[must_use]
    pub fn relays_notification(&self, method: &str) -> bool {
        self.inner.notifications.contains(method)
    }

    /// Starts forwarding page requests through `client`.
    ///
    /// Forwarding stops when the returned handle is closed or dropped.
    #[must_use]
    pub fn install(&self, client: PooledClient) -> RelayHandle {
        let transport = EventBusTransport::content(Arc::clone(&self.inner.bus));
        let reply = transport.clone();

        let subscription = transport.subscribe(Arc::new(move |message: &Message| {
            let Message::Request(request) = message else {
                return;
            };

            forward(&client, &reply, request.clone());
        }));

        debug!("Relay installed");

        RelayHandle {
            transport,
            _subscription: subscription,
        }
    }
}

/// Forwards one page request upstream and answers it on the bus.
fn forward(client: &PooledClient, reply: &EventBusTransport, request: Request) {
    let page_id = request.id;

    let Ok(runtime) = Handle::try_current() else {
        warn!(id = %page_id, "No runtime to forward page request");
        send(reply, Response::err(page_id, RpcError::internal("relay is not running")));
        return;
    };

    let client = client.clone();
    let reply = reply.clone();

    runtime.spawn(async move {
        let method = request.method.clone();
        trace!(id = %page_id, method = %method, "Forwarding page request");

        let response = match client.try_request(request.into_init()).await {
            Ok(response) => response.rewrap(page_id),
            Err(e) => {
                warn!(id = %page_id, method = %method, error = %e, "Upstream request failed");
                Response::err(page_id, RpcError::rewrap(&e))
            }
        };

        send(&reply, response);
    });
}

fn send(reply: &EventBusTransport, response: Response) {
    let id = response.id;
    if let Err(e) = reply.send(Message::Response(response)) {
        debug!(id = %id, error = %e, "Dropping page response");
    }
}

#[async_trait]
impl RequestHandler for Relay {
    async fn handle(&self, request: Request) -> Option<std::result::Result<Value, RpcError>> {
        if !self.relays_notification(&request.method) {
            return None;
        }

        let detail = request.first_param().cloned().unwrap_or(Value::Null).to_string();
        trace!(method = %request.method, "Re-emitting notification to page");
        self.inner
            .bus
            .dispatch(&notification_event(&request.method), &detail);

        Some(Ok(Value::Null))
    }
}

// ============================================================================
// RelayHandle
// ============================================================================

/// Installed relay. Dropping it stops forwarding.
#[derive(Debug)]
pub struct RelayHandle {
    transport: EventBusTransport,
    _subscription: Subscription,
}

impl RelayHandle {
    /// Returns the content-side bus transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &EventBusTransport {
        &self.transport
    }

    /// Stops forwarding.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.transport.close();
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
    use serde_json::json;

    use crate::identifiers::RequestId;
    use crate::protocol::RequestInit;
    use crate::retry::RetryPolicy;
    use crate::transport::event_bus::{REQUEST_EVENT, RESPONSE_EVENT};
    use crate::transport::{Hub, PortConnector, PortTransport, Server};

    struct Background;

    #[async_trait]
    impl RequestHandler for Background {
        async fn handle(&self, request: Request) -> Option<std::result::Result<Value, RpcError>> {
            match request.method.as_str() {
                "eth_chainId" => Some(Ok(json!("0x1"))),
                _ => None,
            }
        }
    }

    fn responses(bus: &EventBus) -> (Arc<Mutex<Vec<Response>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = bus.listen(RESPONSE_EVENT, move |detail| {
            if let Ok(Message::Response(response)) = Message::decode(detail) {
                seen_clone.lock().push(response);
            }
        });
        (seen, sub)
    }

    fn page_request(bus: &EventBus, id: u64, method: &str) {
        let request = Request::with_id(RequestId::new(id), RequestInit::new(method));
        let detail = Message::Request(request).encode().expect("encode");
        bus.dispatch(REQUEST_EVENT, &detail);
    }

    async fn wait_for(seen: &Mutex<Vec<Response>>, count: usize) {
        while seen.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_forwards_with_page_id() {
        let hub = Hub::<PortTransport>::new("background");
        let _server = Server::listen(&hub, Arc::new(Background));
        let client = PooledClient::builder(PortConnector::new(Arc::clone(&hub), "content_script"))
            .build()
            .expect("client");

        let bus = EventBus::new();
        let (seen, _sub) = responses(&bus);
        let _relay = Relay::new(Arc::clone(&bus)).install(client);

        page_request(&bus, 7, "eth_chainId");
        wait_for(&seen, 1).await;

        let response = seen.lock()[0].clone();
        assert_eq!(response.id, RequestId::new(7));
        assert_eq!(response.result, Some(json!("0x1")));
    }

    #[tokio::test]
    async fn test_upstream_failure_becomes_error_response() {
        let hub = Hub::<PortTransport>::new("background");
        let client = PooledClient::builder(PortConnector::new(hub, "content_script"))
            .retry(
                RetryPolicy::new()
                    .base(Duration::from_millis(1))
                    .max_attempts(Some(2)),
            )
            .build()
            .expect("client");

        let bus = EventBus::new();
        let (seen, _sub) = responses(&bus);
        let _relay = Relay::new(Arc::clone(&bus)).install(client);

        page_request(&bus, 3, "eth_chainId");
        wait_for(&seen, 1).await;

        let response = seen.lock()[0].clone();
        assert_eq!(response.id, RequestId::new(3));
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_forwarding() {
        let hub = Hub::<PortTransport>::new("background");
        let client = PooledClient::builder(PortConnector::new(hub, "content_script"))
            .build()
            .expect("client");

        let bus = EventBus::new();
        let relay = Relay::new(Arc::clone(&bus)).install(client);
        assert_eq!(bus.listener_count(REQUEST_EVENT), 1);

        relay.close();
        assert_eq!(bus.listener_count(REQUEST_EVENT), 0);
    }

    #[tokio::test]
    async fn test_reemits_notifications() {
        let bus = EventBus::new();
        let relay = Relay::new(Arc::clone(&bus));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.listen(&notification_event("chainChanged"), move |detail| {
            seen_clone.lock().push(detail.to_string());
        });

        let request = Request::with_id(
            RequestId::new(9),
            RequestInit::new("chainChanged").with_params(json!(["0x89"])),
        );
        let result = relay.handle(request).await;

        assert_eq!(result, Some(Ok(Value::Null)));
        assert_eq!(*seen.lock(), vec!["\"0x89\"".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_notification_not_handled() {
        let relay = Relay::with_notifications(EventBus::new(), &["connect"]);
        assert!(relay.relays_notification("connect"));
        assert!(!relay.relays_notification("chainChanged"));

        let request = Request::with_id(RequestId::new(1), RequestInit::new("chainChanged"));
        assert_eq!(relay.handle(request).await, None);
    }
}
