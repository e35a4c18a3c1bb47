//! Request id allocation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use crate::identifiers::RequestId;
use crate::protocol::{Request, RequestInit};

// ============================================================================
// RpcCounter
// ============================================================================

/// Strictly increasing request id source.
///
/// Starts at 1; id 0 is reserved for heartbeats. Ids are never handed out
/// twice, so a response that arrives after its connection was replaced can
/// never be matched to a newer request.
#[derive(Debug)]
pub struct RpcCounter {
    next: AtomicU64,
}

/// Counter shared by every client in the process.
static PROCESS_COUNTER: RpcCounter = RpcCounter::new();

impl RpcCounter {
    /// Creates a counter starting at 1.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the process-wide counter.
    #[inline]
    #[must_use]
    pub fn global() -> &'static Self {
        &PROCESS_COUNTER
    }

    /// Allocates the next id.
    #[inline]
    pub fn next_id(&self) -> RequestId {
        RequestId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RpcCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// RpcClient
// ============================================================================

/// Wraps request bodies into complete envelopes.
#[derive(Debug, Clone, Copy)]
pub struct RpcClient {
    counter: &'static RpcCounter,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    /// Creates a client drawing ids from the process-wide counter.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: RpcCounter::global(),
        }
    }

    /// Creates a client drawing ids from `counter`.
    #[inline]
    #[must_use]
    pub const fn with_counter(counter: &'static RpcCounter) -> Self {
        Self { counter }
    }

    /// Assigns the next id to `init`.
    #[inline]
    #[must_use]
    pub fn create(&self, init: RequestInit) -> Request {
        Request::with_id(self.counter.next_id(), init)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    fn leaked_counter() -> &'static RpcCounter {
        Box::leak(Box::new(RpcCounter::new()))
    }

    #[test]
    fn test_private_counter_starts_at_one() {
        let client = RpcClient::with_counter(leaked_counter());
        let first = client.create(RequestInit::new("eth_accounts"));
        let second = client.create(RequestInit::new("eth_accounts"));

        assert_eq!(first.id, RequestId::new(1));
        assert_eq!(second.id, RequestId::new(2));
        assert_eq!(first.method, "eth_accounts");
    }

    #[test]
    fn test_global_ids_never_ping() {
        let client = RpcClient::new();
        let request = client.create(RequestInit::new("eth_chainId"));
        assert!(!request.id.is_ping());
    }

    #[test]
    fn test_clients_share_global_counter() {
        let a = RpcClient::new();
        let b = RpcClient::new();

        let first = a.create(RequestInit::new("x")).id;
        let second = b.create(RequestInit::new("x")).id;
        assert!(second > first);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let counter = leaked_counter();
        let ids = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || {
                    let client = RpcClient::with_counter(counter);
                    for _ in 0..250 {
                        let id = client.create(RequestInit::new("x")).id;
                        ids.lock().push(id);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread");
        }

        let ids = ids.lock();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 1000);
    }

    proptest! {
        #[test]
        fn prop_ids_strictly_increase(methods in proptest::collection::vec("[a-z_]{1,12}", 1..64)) {
            let client = RpcClient::with_counter(leaked_counter());
            let ids: Vec<RequestId> = methods
                .into_iter()
                .map(|method| client.create(RequestInit::new(method)).id)
                .collect();

            for pair in ids.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
