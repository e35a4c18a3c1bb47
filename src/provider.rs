//! Page-side provider.
//!
//! [`Provider`] is what page code talks to. It has two halves:
//!
//! - requests, sent over [`EventBusTransport::page`] and correlated through
//!   its own [`PendingTable`]
//! - a per-event subscriber registry fed by notifications the relay
//!   re-emits on the bus
//!
//! # Subscriber registry
//!
//! Each configured event holds an ordered list of listeners. Persistent
//! listeners ([`Provider::on`], [`Provider::prepend`]) are compared by
//! identity ([`Arc::ptr_eq`]): adding one twice keeps a single entry, and
//! prepending an existing one moves it to the front. Single-fire listeners
//! ([`Provider::once`], [`Provider::prepend_once`]) always get an entry of
//! their own, even when the same listener is already registered, and
//! [`Provider::off`] does not remove them. Events outside the configured set
//! are rejected.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::{Future, pending};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{trace, warn};

use crate::client::RpcClient;
use crate::error::Result;
use crate::identifiers::RequestId;
use crate::protocol::{Message, RequestInit, Response};
use crate::transport::connection::DEFAULT_REQUEST_TIMEOUT;
use crate::transport::event_bus::notification_event;
use crate::transport::{EventBus, EventBusTransport, PendingTable, Subscription, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Events a provider accepts subscribers for by default.
pub const DEFAULT_EVENTS: &[&str] = &[
    "connect",
    "disconnect",
    "chainChanged",
    "accountsChanged",
    "networkChanged",
];

// ============================================================================
// Types
// ============================================================================

/// Subscriber callback. Receives the notification payload.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

struct Entry {
    listener: Listener,
    once: bool,
}

#[derive(Default)]
struct Registry {
    by_event: FxHashMap<String, Vec<Entry>>,
    count: usize,
}

impl Registry {
    fn check(&self) {
        debug_assert_eq!(
            self.count,
            self.by_event.values().map(Vec::len).sum::<usize>(),
            "listener count out of sync"
        );
    }

    fn insert(&mut self, event: &str, listener: Listener, once: bool, front: bool) -> bool {
        let Some(entries) = self.by_event.get_mut(event) else {
            return false;
        };

        let existing = if once {
            None
        } else {
            entries
                .iter()
                .position(|entry| !entry.once && Arc::ptr_eq(&entry.listener, &listener))
        };

        match (existing, front) {
            (Some(_), false) => {}
            (Some(position), true) => {
                let entry = entries.remove(position);
                entries.insert(0, entry);
            }
            (None, false) => {
                entries.push(Entry { listener, once });
                self.count += 1;
            }
            (None, true) => {
                entries.insert(0, Entry { listener, once });
                self.count += 1;
            }
        }

        self.check();
        true
    }

    fn remove(&mut self, event: &str, listener: &Listener) -> bool {
        let Some(entries) = self.by_event.get_mut(event) else {
            return false;
        };

        let Some(position) = entries
            .iter()
            .position(|entry| !entry.once && Arc::ptr_eq(&entry.listener, listener))
        else {
            return false;
        };

        entries.remove(position);
        self.count -= 1;
        self.check();
        true
    }

    fn clear(&mut self, event: &str) -> usize {
        let Some(entries) = self.by_event.get_mut(event) else {
            return 0;
        };

        let removed = entries.len();
        entries.clear();
        self.count -= removed;
        self.check();
        removed
    }

    /// Snapshots the listeners of `event`, dropping once-entries.
    fn take_for_emit(&mut self, event: &str) -> Option<Vec<Listener>> {
        let entries = self.by_event.get_mut(event)?;

        let snapshot = entries
            .iter()
            .map(|entry| Arc::clone(&entry.listener))
            .collect();

        let before = entries.len();
        entries.retain(|entry| !entry.once);
        self.count -= before - entries.len();
        self.check();

        Some(snapshot)
    }
}

// ============================================================================
// Provider
// ============================================================================

struct ProviderInner {
    transport: EventBusTransport,
    rpc: RpcClient,
    pending: Arc<PendingTable>,
    registry: Mutex<Registry>,
    /// Bus and transport registrations.
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// Page-facing request and event API.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("pending", &self.inner.pending.len())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

/// Forgets an outstanding id at the bus when the request ends.
struct Outstanding<'a> {
    transport: &'a EventBusTransport,
    id: RequestId,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.transport.forget(self.id);
    }
}

impl Provider {
    /// Creates a provider accepting [`DEFAULT_EVENTS`].
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_events(bus, DEFAULT_EVENTS)
    }

    /// Creates a provider accepting subscribers for `events` only.
    #[must_use]
    pub fn with_events(bus: Arc<EventBus>, events: &[&str]) -> Self {
        let transport = EventBusTransport::page(Arc::clone(&bus));
        let pending = PendingTable::new();

        let mut registry = Registry::default();
        for event in events {
            registry.by_event.entry((*event).to_string()).or_default();
        }

        let inner = Arc::new(ProviderInner {
            transport,
            rpc: RpcClient::new(),
            pending,
            registry: Mutex::new(registry),
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut subscriptions = Vec::with_capacity(events.len() + 1);

        let table = Arc::clone(&inner.pending);
        subscriptions.push(inner.transport.subscribe(Arc::new(move |message: &Message| {
            if let Message::Response(response) = message {
                table.resolve(response.clone());
            }
        })));

        for event in events {
            let weak: Weak<ProviderInner> = Arc::downgrade(&inner);
            let name = (*event).to_string();

            subscriptions.push(bus.listen(&notification_event(event), move |detail| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };

                match serde_json::from_str::<Value>(detail) {
                    Ok(value) => {
                        Self { inner }.emit(&name, &value);
                    }
                    Err(e) => warn!(event = %name, error = %e, "Dropping malformed notification"),
                }
            }));
        }

        *inner.subscriptions.lock() = subscriptions;
        Self { inner }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Sends `init` and returns the matching response.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyPending`](crate::Error::TooManyPending) if the
    ///   pending table is full
    /// - [`Error::SendFailed`](crate::Error::SendFailed) if the provider's
    ///   transport is closed
    /// - [`Error::ResponseTimeout`](crate::Error::ResponseTimeout) after
    ///   the default request timeout
    pub async fn try_request(&self, init: RequestInit) -> Result<Response> {
        self.try_request_with_timeout(init, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Like [`Provider::try_request`], with an explicit deadline.
    ///
    /// # Errors
    ///
    /// See [`Provider::try_request`].
    pub async fn try_request_with_timeout(
        &self,
        init: RequestInit,
        timeout: Duration,
    ) -> Result<Response> {
        self.try_request_until(init, timeout, pending()).await
    }

    /// Like [`Provider::try_request_with_timeout`], aborted when `cancel`
    /// completes.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`](crate::Error::Cancelled) if `cancel` wins,
    /// otherwise see [`Provider::try_request`].
    pub async fn try_request_until<C>(
        &self,
        init: RequestInit,
        timeout: Duration,
        cancel: C,
    ) -> Result<Response>
    where
        C: Future<Output = ()>,
    {
        let request = self.inner.rpc.create(init);
        let id = request.id;

        let waiter = self.inner.pending.register(id)?;
        let _outstanding = Outstanding {
            transport: &self.inner.transport,
            id,
        };

        trace!(id = %id, method = %request.method, "Page request");
        self.inner.transport.send(Message::Request(request))?;

        waiter.wait_or_cancel(timeout, cancel).await
    }

    /// Sends `init` and returns the result value.
    ///
    /// # Errors
    ///
    /// [`Error::Rpc`](crate::Error::Rpc) for an error response, otherwise
    /// see [`Provider::try_request`].
    pub async fn request(&self, init: RequestInit) -> Result<Value> {
        self.try_request(init).await?.into_result()
    }

    /// Returns the number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    /// Appends `listener` to `event`.
    ///
    /// Returns `false` if `event` is not accepted by this provider.
    pub fn on(&self, event: &str, listener: Listener) -> bool {
        self.inner.registry.lock().insert(event, listener, false, false)
    }

    /// Appends `listener` to `event` for a single emission.
    ///
    /// Always adds a new entry, even if `listener` is already registered.
    pub fn once(&self, event: &str, listener: Listener) -> bool {
        self.inner.registry.lock().insert(event, listener, true, false)
    }

    /// Moves or inserts `listener` at the front of `event`.
    pub fn prepend(&self, event: &str, listener: Listener) -> bool {
        self.inner.registry.lock().insert(event, listener, false, true)
    }

    /// Like [`Provider::prepend`], for a single emission.
    pub fn prepend_once(&self, event: &str, listener: Listener) -> bool {
        self.inner.registry.lock().insert(event, listener, true, true)
    }

    /// Removes the persistent registration of `listener` from `event`.
    ///
    /// Returns `true` if it was registered. Single-fire entries stay until
    /// they fire or [`Provider::remove_all`] runs.
    pub fn off(&self, event: &str, listener: &Listener) -> bool {
        self.inner.registry.lock().remove(event, listener)
    }

    /// Removes every listener of `event`, returning how many there were.
    pub fn remove_all(&self, event: &str) -> usize {
        self.inner.registry.lock().clear(event)
    }

    /// Calls every listener of `event` with `value`, in order.
    ///
    /// Returns `true` if at least one listener was called.
    pub fn emit(&self, event: &str, value: &Value) -> bool {
        let Some(listeners) = self.inner.registry.lock().take_for_emit(event) else {
            return false;
        };

        for listener in &listeners {
            listener(value);
        }

        !listeners.is_empty()
    }

    /// Returns the listeners of `event`, in call order.
    #[must_use]
    pub fn listeners(&self, event: &str) -> Vec<Listener> {
        self.inner
            .registry
            .lock()
            .by_event
            .get(event)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.listener)).collect())
            .unwrap_or_default()
    }

    /// Returns the total number of listeners across all events.
    #[inline]
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.registry.lock().count
    }

    /// Returns the accepted event names, sorted.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .registry
            .lock()
            .by_event
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

// ============================================================================
// Tests
// ============================================================================
