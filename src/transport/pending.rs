//! Pending request table.
//!
//! Maps in-flight request ids to single-use response channels. An entry is
//! removed exactly once: by the matching response, by a connection-wide
//! failure, or when the waiting [`PendingRequest`] is dropped (timeout,
//! cancellation, or the caller giving up).

// ============================================================================
// Imports
// ============================================================================

use std::future::{Future, pending};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::Response;

// ============================================================================
// Constants
// ============================================================================

/// Maximum pending requests before rejecting new ones.
pub const MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// One in-flight request.
struct PendingEntry {
    created_at: Instant,
    tx: oneshot::Sender<Result<Response>>,
}

/// Map of request IDs to response channels.
type CorrelationMap = FxHashMap<RequestId, PendingEntry>;

// ============================================================================
// PendingTable
// ============================================================================

/// Correlates responses with in-flight requests.
pub struct PendingTable {
    entries: Mutex<CorrelationMap>,
    capacity: usize,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("pending", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl PendingTable {
    /// Creates a table holding up to [`MAX_PENDING_REQUESTS`] entries.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(MAX_PENDING_REQUESTS)
    }

    /// Creates a table holding up to `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(CorrelationMap::default()),
            capacity,
        })
    }

    /// Registers a pending entry for `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyPending`] if the table is full
    /// - [`Error::Protocol`] if `id` is already pending
    pub fn register(self: &Arc<Self>, id: RequestId) -> Result<PendingRequest> {
        let (tx, rx) = oneshot::channel();

        {
            let mut entries = self.entries.lock();

            if entries.len() >= self.capacity {
                warn!(
                    pending = entries.len(),
                    max = self.capacity,
                    "Too many pending requests"
                );
                return Err(Error::TooManyPending {
                    pending: entries.len(),
                    max: self.capacity,
                });
            }

            if entries.contains_key(&id) {
                return Err(Error::protocol(format!("Request {id} is already pending")));
            }

            entries.insert(
                id,
                PendingEntry {
                    created_at: Instant::now(),
                    tx,
                },
            );
        }

        Ok(PendingRequest {
            id,
            rx,
            table: Arc::downgrade(self),
        })
    }

    /// Resolves the entry matching `response.id`.
    ///
    /// Returns `false` (and drops the response) if no entry matches, e.g.
    /// the request already timed out.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(entry) = self.entries.lock().remove(&response.id) else {
            debug!(id = %response.id, "Response for unknown request");
            return false;
        };

        trace!(
            id = %response.id,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Response matched"
        );

        let _ = entry.tx.send(Ok(response));
        true
    }

    /// Fails every pending entry with `error`.
    ///
    /// Returns the number of entries failed.
    pub fn fail_all(&self, error: &Error) -> usize {
        let pending: Vec<_> = self.entries.lock().drain().collect();
        let count = pending.len();

        for (_, entry) in pending {
            let _ = entry.tx.send(Err(error.clone()));
        }

        if count > 0 {
            debug!(count, error = %error, "Failed pending requests");
        }

        count
    }

    /// Removes the entry for `id` without resolving it.
    pub fn remove(&self, id: RequestId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Returns `true` if `id` is pending.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Returns the number of pending entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// PendingRequest
// ============================================================================

/// Waiter for one pending entry.
///
/// Dropping the waiter removes the entry, so abandoned requests never leave
/// registrations behind.
#[must_use = "dropping a PendingRequest abandons the request"]
pub struct PendingRequest {
    id: RequestId,
    rx: oneshot::Receiver<Result<Response>>,
    table: Weak<PendingTable>,
}

impl PendingRequest {
    /// Returns the request id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the response, failing after `deadline`.
    ///
    /// # Errors
    ///
    /// - [`Error::ResponseTimeout`] if `deadline` elapses first
    /// - [`Error::TransportDisconnected`] if the owning connection closes
    pub async fn wait(self, deadline: Duration) -> Result<Response> {
        self.wait_or_cancel(deadline, pending()).await
    }

    /// Waits for the response, `deadline`, or `cancel`, whichever is first.
    ///
    /// # Errors
    ///
    /// - [`Error::ResponseTimeout`] if `deadline` elapses first
    /// - [`Error::Cancelled`] if `cancel` completes first
    /// - [`Error::TransportDisconnected`] if the owning connection closes
    pub async fn wait_or_cancel<C>(mut self, deadline: Duration, cancel: C) -> Result<Response>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;

            result = &mut self.rx => match result {
                Ok(result) => result,
                Err(_) => Err(Error::TransportDisconnected),
            },

            () = sleep(deadline) => {
                debug!(id = %self.id, timeout_ms = deadline.as_millis() as u64, "Request timed out");
                Err(Error::response_timeout(self.id, deadline.as_millis() as u64))
            }

            () = cancel => {
                debug!(id = %self.id, "Request cancelled");
                Err(Error::Cancelled)
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[tokio::test]
    async fn test_response_resolves_entry_once() {
        let table = PendingTable::new();
        let pending = table.register(RequestId::new(1)).expect("register");

        assert!(table.resolve(Response::ok(RequestId::new(1), json!("first"))));
        assert!(!table.resolve(Response::ok(RequestId::new(1), json!("second"))));

        let response = pending.wait(Duration::from_secs(1)).await.expect("response");
        assert_eq!(response.result, Some(json!("first")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let table = PendingTable::new();
        let _pending = table.register(RequestId::new(1)).expect("register");

        assert!(!table.resolve(Response::ok(RequestId::new(2), json!(null))));
        assert!(table.contains(RequestId::new(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = PendingTable::new();
        let pending = table.register(RequestId::new(3)).expect("register");

        let result = pending.wait(Duration::from_millis(500)).await;
        assert!(matches!(
            result,
            Err(Error::ResponseTimeout { request_id, timeout_ms: 500 }) if request_id == RequestId::new(3)
        ));
        assert!(table.is_empty());

        assert!(!table.resolve(Response::ok(RequestId::new(3), json!("late"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wins_over_deadline() {
        let table = PendingTable::new();
        let pending = table.register(RequestId::new(4)).expect("register");

        let cancel = sleep(Duration::from_millis(10));
        let result = pending.wait_or_cancel(Duration::from_secs(5), cancel).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_reaches_every_waiter() {
        let table = PendingTable::new();
        let a = table.register(RequestId::new(1)).expect("register");
        let b = table.register(RequestId::new(2)).expect("register");

        assert_eq!(table.fail_all(&Error::TransportDisconnected), 2);

        assert!(matches!(
            a.wait(Duration::from_secs(1)).await,
            Err(Error::TransportDisconnected)
        ));
        assert!(matches!(
            b.wait(Duration::from_secs(1)).await,
            Err(Error::TransportDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_wait_stays_pending_until_resolved() {
        let table = PendingTable::new();
        let pending = table.register(RequestId::new(9)).expect("register");
        let mut wait = tokio_test::task::spawn(pending.wait(Duration::from_secs(5)));

        tokio_test::assert_pending!(wait.poll());

        assert!(table.resolve(Response::ok(RequestId::new(9), json!("done"))));
        assert!(wait.is_woken());

        let response = tokio_test::assert_ready_ok!(wait.poll());
        assert_eq!(response.result, Some(json!("done")));
    }

    #[test]
    fn test_drop_removes_entry() {
        let table = PendingTable::new();
        let pending = table.register(RequestId::new(8)).expect("register");
        assert_eq!(table.len(), 1);

        drop(pending);
        assert!(table.is_empty());
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let table = PendingTable::with_capacity(1);
        let _first = table.register(RequestId::new(1)).expect("register");

        assert!(matches!(
            table.register(RequestId::new(2)),
            Err(Error::TooManyPending { pending: 1, max: 1 })
        ));

        let table = PendingTable::new();
        let _first = table.register(RequestId::new(1)).expect("register");
        assert!(matches!(
            table.register(RequestId::new(1)),
            Err(Error::Protocol { .. })
        ));
    }
}
