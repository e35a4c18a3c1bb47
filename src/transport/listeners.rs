//! Listener registries and unsubscribe handles.
//!
//! Every adapter keeps its message and close handlers in a [`Listeners`]
//! set. Registering returns a [`Subscription`]; dropping it removes the
//! handler, so a listener can never outlive the code that installed it.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

// ============================================================================
// Types
// ============================================================================

/// Shared handler callback.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handler table keyed by a monotonic registration key.
struct HandlerMap<T> {
    next_key: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle to a registered listener.
///
/// Dropping the handle unregisters the listener.
#[must_use = "dropping a Subscription unregisters the listener immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Creates a subscription that runs `cancel` once when dropped.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Creates a subscription with nothing to release.
    #[inline]
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Unregisters the listener now.
    #[inline]
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keeps the listener registered for the lifetime of its registry.
    #[inline]
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// A set of handlers invoked on every emitted value, in registration order.
///
/// Handlers are snapshotted before invocation, so a handler may add or
/// remove listeners (including itself) while being called.
pub struct Listeners<T> {
    inner: Arc<Mutex<HandlerMap<T>>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandlerMap {
                next_key: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Listeners<T> {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    pub fn add(&self, handler: Handler<T>) -> Subscription {
        let key = {
            let mut map = self.inner.lock();
            let key = map.next_key;
            map.next_key += 1;
            map.handlers.insert(key, handler);
            key
        };

        let weak: Weak<Mutex<HandlerMap<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().handlers.remove(&key);
            }
        })
    }

    /// Calls every registered handler with `value`.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.inner.lock().handlers.values().cloned().collect();

        for handler in handlers {
            handler(value);
        }
    }

    /// Returns the number of registered handlers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    /// Returns `true` if no handler is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.inner.lock().handlers.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Handler<u32>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let handler: Handler<u32> = Arc::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn test_emit_reaches_all_handlers() {
        let listeners = Listeners::<u32>::new();
        let (a, handler_a) = counter();
        let (b, handler_b) = counter();

        let _sub_a = listeners.add(handler_a);
        let _sub_b = listeners.add(handler_b);
        listeners.emit(&1);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn test_emit_follows_registration_order() {
        let listeners = Listeners::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let subscriptions: Vec<Subscription> = (0..32)
            .map(|tag| {
                let order = Arc::clone(&order);
                listeners.add(Arc::new(move |_| order.lock().push(tag)))
            })
            .collect();

        listeners.emit(&1);
        assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());

        drop(subscriptions);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let listeners = Listeners::<u32>::new();
        let (count, handler) = counter();

        let subscription = listeners.add(handler);
        drop(subscription);
        listeners.emit(&1);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_detach_keeps_handler() {
        let listeners = Listeners::<u32>::new();
        let (count, handler) = counter();

        listeners.add(handler).detach();
        listeners.emit(&1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let listeners = Listeners::<u32>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);

        let subscription = listeners.add(Arc::new(move |_| {
            slot_clone.lock().take();
        }));
        *slot.lock() = Some(subscription);

        listeners.emit(&1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_subscription_outliving_registry_is_harmless() {
        let listeners = Listeners::<u32>::new();
        let (_count, handler) = counter();
        let subscription = listeners.add(handler);

        drop(listeners);
        subscription.unsubscribe();
    }
}
