//! Entangled in-process duplex.
//!
//! Two [`WireEnd`]s connected by unbounded queues. Each direction is drained
//! by a tokio task that hands messages to the receiving end's listeners, so
//! delivery is asynchronous like a real message port.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::Message;

use super::listeners::{Listeners, Subscription};
use super::{CloseHandler, CloseReason, MessageHandler};

// ============================================================================
// WireEnd
// ============================================================================

/// One end of an in-process duplex.
pub(crate) struct WireEnd {
    /// Queue towards the peer. `None` once closed.
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Handlers for messages arriving from the peer.
    messages: Listeners<Message>,
    /// Handlers for the close notification.
    closes: Listeners<CloseReason>,
    /// Set once, on the first close.
    closed: AtomicBool,
}

impl WireEnd {
    fn new(outbox: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            outbox: Mutex::new(Some(outbox)),
            messages: Listeners::new(),
            closes: Listeners::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates two connected ends.
    ///
    /// When its peer closes or is dropped, an end is closed with
    /// [`CloseReason::Remote`] if `report_remote_close` is set. Otherwise it
    /// is marked closed without notifying anyone.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn pair(report_remote_close: bool) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Arc::new(Self::new(a_tx));
        let b = Arc::new(Self::new(b_tx));

        tokio::spawn(Self::pump(a_rx, Arc::downgrade(&b), report_remote_close));
        tokio::spawn(Self::pump(b_rx, Arc::downgrade(&a), report_remote_close));

        (a, b)
    }

    /// Delivers queued messages to `target` until the sending side closes.
    async fn pump(
        mut rx: mpsc::UnboundedReceiver<Message>,
        target: Weak<Self>,
        report_remote_close: bool,
    ) {
        while let Some(message) = rx.recv().await {
            let Some(end) = target.upgrade() else {
                return;
            };

            if end.is_closed() {
                trace!("Dropping message for closed end");
                continue;
            }

            end.messages.emit(&message);
        }

        let Some(end) = target.upgrade() else {
            return;
        };

        if report_remote_close {
            end.shutdown(CloseReason::Remote);
        } else {
            end.mark_peer_gone();
        }
    }

    pub(crate) fn send(&self, message: Message) -> Result<()> {
        let outbox = self.outbox.lock();
        match outbox.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| Error::send_failed("peer is gone")),
            None => Err(Error::send_failed("transport is closed")),
        }
    }

    #[inline]
    pub(crate) fn subscribe(&self, handler: MessageHandler) -> Subscription {
        self.messages.add(handler)
    }

    #[inline]
    pub(crate) fn on_close(&self, handler: CloseHandler) -> Subscription {
        self.closes.add(handler)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes this end once and notifies close handlers.
    ///
    /// Dropping the outbox ends the peer's pump, which is how the peer
    /// learns about the close.
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.outbox.lock().take();
        self.closes.emit(&reason);
        self.messages.clear();
        self.closes.clear();
    }

    /// Closes this end without running close handlers.
    fn mark_peer_gone(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        trace!("Peer gone, closing end silently");
        self.outbox.lock().take();
        self.messages.clear();
        self.closes.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
