//! Named-event bus adapter.
//!
//! The page and the content script share nothing but a broadcast event
//! bus: every listener of an event name sees every dispatched detail, and
//! dispatch runs listeners synchronously (DOM custom-event semantics).
//! Details are JSON text.
//!
//! [`EventBusTransport`] turns the bus into a [`Transport`]. Requests travel
//! on [`REQUEST_EVENT`], responses on [`RESPONSE_EVENT`]. Because responses
//! are broadcast, the page side only forwards responses whose id it sent
//! itself; everything else on the bus belongs to someone else and is
//! dropped.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::Message;

use super::listeners::{Listeners, Subscription};
use super::{CloseHandler, CloseReason, MessageHandler, Transport, TransportKind};

// ============================================================================
// Constants
// ============================================================================

/// Event carrying page requests.
pub const REQUEST_EVENT: &str = "hopwire:request";

/// Event carrying responses to page requests.
pub const RESPONSE_EVENT: &str = "hopwire:response";

/// Prefix of notification events re-emitted to the page.
pub const NOTIFICATION_PREFIX: &str = "hopwire:event:";

/// Returns the bus event name for a notification.
#[inline]
#[must_use]
pub fn notification_event(name: &str) -> String {
    format!("{NOTIFICATION_PREFIX}{name}")
}

// ============================================================================
// EventBus
// ============================================================================

/// Broadcast bus of named events with JSON text details.
#[derive(Default)]
pub struct EventBus {
    events: Mutex<FxHashMap<String, Listeners<String>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.events.lock().len())
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Listens to every dispatch of `name`.
    pub fn listen(
        &self,
        name: &str,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        let listeners = self
            .events
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();

        listeners.add(Arc::new(move |detail: &String| handler(detail)))
    }

    /// Runs every listener of `name` with `detail`, synchronously.
    pub fn dispatch(&self, name: &str, detail: &str) {
        let listeners = self.events.lock().get(name).cloned();

        match listeners {
            Some(listeners) => listeners.emit(&detail.to_string()),
            None => trace!(event = name, "No listener for event"),
        }
    }

    /// Returns the number of listeners of `name`.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.events.lock().get(name).map_or(0, Listeners::len)
    }
}

// ============================================================================
// BusRole
// ============================================================================

/// Which side of the bus a transport speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRole {
    /// Sends requests, receives its own responses.
    Page,
    /// Receives requests, sends responses.
    Content,
}

impl BusRole {
    const fn outgoing(&self) -> &'static str {
        match self {
            Self::Page => REQUEST_EVENT,
            Self::Content => RESPONSE_EVENT,
        }
    }

    const fn incoming(&self) -> &'static str {
        match self {
            Self::Page => RESPONSE_EVENT,
            Self::Content => REQUEST_EVENT,
        }
    }
}

// ============================================================================
// EventBusTransport
// ============================================================================

/// Internal shared state for a bus transport.
struct BusInner {
    bus: Arc<EventBus>,
    role: BusRole,
    messages: Listeners<Message>,
    closes: Listeners<CloseReason>,
    /// Ids sent by this page transport and not answered yet.
    outstanding: Mutex<FxHashSet<RequestId>>,
    /// Registration on the bus.
    listener: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

/// [`Transport`] over an [`EventBus`].
///
/// The bus has no notion of a peer going away; only a local `close()`
/// produces a close notification.
#[derive(Clone)]
pub struct EventBusTransport {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBusTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusTransport")
            .field("role", &self.inner.role)
            .field("outstanding", &self.outstanding_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventBusTransport {
    /// Creates the page side: sends requests, receives matching responses.
    #[must_use]
    pub fn page(bus: Arc<EventBus>) -> Self {
        Self::new(bus, BusRole::Page)
    }

    /// Creates the content side: receives requests, sends responses.
    #[must_use]
    pub fn content(bus: Arc<EventBus>) -> Self {
        Self::new(bus, BusRole::Content)
    }

    fn new(bus: Arc<EventBus>, role: BusRole) -> Self {
        let inner = Arc::new(BusInner {
            bus: Arc::clone(&bus),
            role,
            messages: Listeners::new(),
            closes: Listeners::new(),
            outstanding: Mutex::new(FxHashSet::default()),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let weak: Weak<BusInner> = Arc::downgrade(&inner);
        let subscription = bus.listen(role.incoming(), move |detail| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(detail);
            }
        });
        *inner.listener.lock() = Some(subscription);

        Self { inner }
    }

    /// Returns the bus role.
    #[inline]
    #[must_use]
    pub fn role(&self) -> BusRole {
        self.inner.role
    }

    /// Stops waiting for a response to `id`.
    ///
    /// Called when a request times out or is cancelled, so a late response
    /// is filtered out at the bus.
    pub fn forget(&self, id: RequestId) {
        self.inner.outstanding.lock().remove(&id);
    }

    /// Returns the number of requests still awaiting a response.
    #[inline]
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.inner.outstanding.lock().len()
    }
}

impl BusInner {
    /// Handles one incoming bus detail.
    fn receive(&self, detail: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let message = match Message::decode(detail) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed bus event");
                return;
            }
        };

        let accepted = match (self.role, &message) {
            (BusRole::Page, Message::Response(response)) => {
                self.outstanding.lock().remove(&response.id)
            }
            (BusRole::Content, Message::Request(_)) => true,
            _ => false,
        };

        if !accepted {
            trace!(role = ?self.role, "Ignoring bus event addressed to another party");
            return;
        }

        self.messages.emit(&message);
    }
}

impl Transport for EventBusTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventBus
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::send_failed("event bus transport is closed"));
        }

        let detail = message.encode()?;

        if self.inner.role == BusRole::Page
            && let Message::Request(request) = &message
        {
            self.inner.outstanding.lock().insert(request.id);
        }

        self.inner.bus.dispatch(self.inner.role.outgoing(), &detail);
        Ok(())
    }

    fn subscribe(&self, handler: MessageHandler) -> Subscription {
        self.inner.messages.add(handler)
    }

    fn on_close(&self, handler: CloseHandler) -> Subscription {
        self.inner.closes.add(handler)
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.listener.lock().take();
        self.inner.outstanding.lock().clear();
        self.inner.closes.emit(&CloseReason::Local);
        self.inner.messages.clear();
        self.inner.closes.clear();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::protocol::{Request, RequestInit, Response};

    fn collect(transport: &EventBusTransport) -> (Arc<Mutex<Vec<Message>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = transport.subscribe(Arc::new(move |message: &Message| {
            seen_clone.lock().push(message.clone());
        }));
        (seen, sub)
    }

    #[test]
    fn test_dispatch_is_synchronous_broadcast() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = Arc::clone(&seen);
        let _a = bus.listen("ping", move |d| seen_a.lock().push(format!("a:{d}")));
        let seen_b = Arc::clone(&seen);
        let _b = bus.listen("ping", move |d| seen_b.lock().push(format!("b:{d}")));

        bus.dispatch("ping", "1");
        bus.dispatch("other", "2");

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:1".to_string(), "b:1".to_string()]);
        assert_eq!(bus.listener_count("ping"), 2);
    }

    #[test]
    fn test_request_reaches_content_side() {
        let bus = EventBus::new();
        let page = EventBusTransport::page(Arc::clone(&bus));
        let content = EventBusTransport::content(Arc::clone(&bus));
        let (seen, _sub) = collect(&content);

        let request = Request::with_id(RequestId::new(11), RequestInit::new("eth_accounts"));
        page.send(request.clone().into()).expect("send");

        assert_eq!(*seen.lock(), vec![Message::Request(request)]);
        assert_eq!(page.outstanding_count(), 1);
    }

    #[test]
    fn test_page_filters_responses_by_sent_id() {
        let bus = EventBus::new();
        let page = EventBusTransport::page(Arc::clone(&bus));
        let content = EventBusTransport::content(Arc::clone(&bus));
        let (seen, _sub) = collect(&page);

        let request = Request::with_id(RequestId::new(21), RequestInit::new("eth_chainId"));
        page.send(request.into()).expect("send");

        content
            .send(Response::ok(RequestId::new(99), json!("foreign")).into())
            .expect("send");
        content
            .send(Response::ok(RequestId::new(21), json!("0x1")).into())
            .expect("send");
        content
            .send(Response::ok(RequestId::new(21), json!("duplicate")).into())
            .expect("send");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Message::Response(r) if r.id == RequestId::new(21)));
        assert_eq!(page.outstanding_count(), 0);
    }

    #[test]
    fn test_malformed_detail_is_dropped() {
        let bus = EventBus::new();
        let content = EventBusTransport::content(Arc::clone(&bus));
        let (seen, _sub) = collect(&content);

        bus.dispatch(REQUEST_EVENT, "{not json");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_forget_drops_late_response() {
        let bus = EventBus::new();
        let page = EventBusTransport::page(Arc::clone(&bus));
        let (seen, _sub) = collect(&page);

        let request = Request::with_id(RequestId::new(5), RequestInit::new("eth_call"));
        page.send(request.into()).expect("send");
        page.forget(RequestId::new(5));

        bus.dispatch(RESPONSE_EVENT, r#"{"id": 5, "result": null}"#);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_close_unregisters_from_bus() {
        let bus = EventBus::new();
        let page = EventBusTransport::page(Arc::clone(&bus));
        assert_eq!(bus.listener_count(RESPONSE_EVENT), 1);

        let closed = Arc::new(Mutex::new(None));
        let closed_clone = Arc::clone(&closed);
        let _sub = page.on_close(Arc::new(move |reason: &CloseReason| {
            *closed_clone.lock() = Some(reason.clone());
        }));

        page.close();
        assert_eq!(bus.listener_count(RESPONSE_EVENT), 0);
        assert_eq!(*closed.lock(), Some(CloseReason::Local));
        assert!(page.send(Message::hello()).is_err());
    }

    #[test]
    fn test_notification_event_name() {
        assert_eq!(notification_event("chainChanged"), "hopwire:event:chainChanged");
    }
}
