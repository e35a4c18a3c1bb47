//! Pooled client.
//!
//! Every call to [`PooledClient::try_request`] runs one retry loop:
//!
//! 1. pick a slot round-robin and acquire its connection from the pool
//! 2. stamp the body with a fresh id (resends never reuse an id)
//! 3. send it and wait for the matching response
//!
//! Failures are classified into [`RetrySignal`]s. A `Skip` evicts the
//! connection it happened on before the next attempt, so a response to the
//! abandoned id can never be matched to the resend.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{RequestInit, Response};
use crate::retry::{Classifier, RetryPolicy, RetrySignal, try_loop};
use crate::transport::{ConnectionPool, Connector};

use super::builder::ClientBuilder;
use super::rpc::RpcClient;

// ============================================================================
// Types
// ============================================================================

struct ClientInner {
    rpc: RpcClient,
    pool: ConnectionPool,
    retry: RetryPolicy,
    classifier: Classifier,
    request_timeout: Duration,
    next_slot: AtomicUsize,
}

// ============================================================================
// PooledClient
// ============================================================================

/// Request/response client over a [`ConnectionPool`].
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct PooledClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("capacity", &self.inner.pool.capacity())
            .field("request_timeout", &self.inner.request_timeout)
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

impl PooledClient {
    /// Creates a builder for a client opening transports through `connector`.
    #[must_use]
    pub fn builder(connector: impl Connector) -> ClientBuilder {
        ClientBuilder::new(Arc::new(connector))
    }

    pub(crate) fn from_parts(
        rpc: RpcClient,
        pool: ConnectionPool,
        retry: RetryPolicy,
        classifier: Classifier,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                rpc,
                pool,
                retry,
                classifier,
                request_timeout,
                next_slot: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the underlying pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Returns the default response deadline.
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Returns the retry policy.
    #[inline]
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Sends `init` and returns the matching response.
    ///
    /// An error response from the peer is a successful result here; use
    /// [`PooledClient::request`] to turn it into an error.
    ///
    /// # Errors
    ///
    /// Whatever the classifier cancels with (by default
    /// [`Error::ResponseTimeout`] and [`Error::Protocol`]), or
    /// [`Error::RetriesExhausted`].
    pub async fn try_request(&self, init: RequestInit) -> Result<Response> {
        self.try_request_with_timeout(init, self.inner.request_timeout)
            .await
    }

    /// Like [`PooledClient::try_request`], with a per-call response deadline.
    ///
    /// The deadline applies to each attempt.
    ///
    /// # Errors
    ///
    /// See [`PooledClient::try_request`].
    pub async fn try_request_with_timeout(
        &self,
        init: RequestInit,
        timeout: Duration,
    ) -> Result<Response> {
        let inner = &*self.inner;
        try_loop(&inner.retry, move |attempt| {
            inner.attempt(init.clone(), timeout, attempt)
        })
        .await
    }

    /// Like [`PooledClient::try_request_with_timeout`], aborted when `cancel`
    /// completes.
    ///
    /// Cancellation drops the in-flight attempt; its pending entry is
    /// removed and a late response is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` wins, otherwise see
    /// [`PooledClient::try_request`].
    pub async fn try_request_until<C>(
        &self,
        init: RequestInit,
        timeout: Duration,
        cancel: C,
    ) -> Result<Response>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;

            result = self.try_request_with_timeout(init, timeout) => result,
            () = cancel => {
                debug!("Request cancelled by caller");
                Err(Error::Cancelled)
            }
        }
    }

    /// Sends `init` and returns the result value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rpc`] for an error response, otherwise see
    /// [`PooledClient::try_request`].
    pub async fn request(&self, init: RequestInit) -> Result<Value> {
        self.try_request(init).await?.into_result()
    }

    /// Tears down every pooled connection.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }
}

// ============================================================================
// ClientInner Implementation
// ============================================================================

impl ClientInner {
    fn next_index(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed) % self.pool.capacity()
    }

    async fn attempt(
        &self,
        init: RequestInit,
        timeout: Duration,
        attempt: u32,
    ) -> std::result::Result<Response, RetrySignal> {
        let index = self.next_index();

        let connection = self
            .pool
            .get(index)
            .await
            .map_err(|e| (self.classifier)(e))?;

        let request = self.rpc.create(init);
        trace!(id = %request.id, method = %request.method, index, attempt, "Sending request");

        match connection.request(request, timeout).await {
            Ok(response) => Ok(response),
            Err(error) => {
                let signal = (self.classifier)(error);

                if signal.is_skip() && self.pool.evict(index, &connection) {
                    debug!(index, error = %signal.error(), "Evicted failed connection");
                }

                Err(signal)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::future::pending;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::time::Instant;

    use crate::client::RpcCounter;
    use crate::identifiers::RequestId;
    use crate::protocol::{Request, RpcError};
    use crate::retry::classify;
    use crate::transport::{Hub, PortConnector, PortTransport, RequestHandler, Server};

    #[derive(Default)]
    struct Backend {
        flaky_ids: Mutex<Vec<RequestId>>,
    }

    #[async_trait]
    impl RequestHandler for Backend {
        async fn handle(&self, request: Request) -> Option<std::result::Result<Value, RpcError>> {
            match request.method.as_str() {
                "eth_chainId" => Some(Ok(json!("0x1"))),
                "fail" => Some(Err(RpcError::new(-32000, "execution reverted"))),
                "hang" => {
                    pending::<()>().await;
                    None
                }
                "flaky" => {
                    let first = {
                        let mut ids = self.flaky_ids.lock();
                        ids.push(request.id);
                        ids.len() == 1
                    };
                    if first {
                        pending::<()>().await;
                    }
                    Some(Ok(json!("fresh")))
                }
                _ => None,
            }
        }
    }

    fn hub() -> Arc<Hub<PortTransport>> {
        Hub::new("background")
    }

    fn client(hub: &Arc<Hub<PortTransport>>) -> ClientBuilder {
        static COUNTER: RpcCounter = RpcCounter::new();
        PooledClient::builder(PortConnector::new(Arc::clone(hub), "content_script"))
            .rpc_client(RpcClient::with_counter(&COUNTER))
            .retry(RetryPolicy::new().base(Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let hub = hub();
        let _server = Server::listen(&hub, Arc::new(Backend::default()));
        let client = client(&hub).build().expect("client");

        let value = client
            .request(RequestInit::new("eth_chainId"))
            .await
            .expect("value");
        assert_eq!(value, json!("0x1"));
        assert_eq!(client.pool().build_count(), 1);

        client
            .request(RequestInit::new("eth_chainId"))
            .await
            .expect("value");
        assert_eq!(client.pool().build_count(), 1);
    }

    #[tokio::test]
    async fn test_error_response_is_not_retried() {
        let hub = hub();
        let _server = Server::listen(&hub, Arc::new(Backend::default()));
        let client = client(&hub).build().expect("client");

        let response = client
            .try_request(RequestInit::new("fail"))
            .await
            .expect("error response");
        assert!(response.is_error());

        let result = client.request(RequestInit::new("fail")).await;
        assert!(matches!(result, Err(Error::Rpc(ref e)) if e.code == -32000));
    }

    #[tokio::test]
    async fn test_waits_for_listener() {
        let hub = hub();
        let client = client(&hub).build().expect("client");

        let late = Arc::clone(&hub);
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Server::listen(&late, Arc::new(Backend::default()))
        });

        let value = client
            .request(RequestInit::new("eth_chainId"))
            .await
            .expect("value");
        assert_eq!(value, json!("0x1"));
        drop(server.await.expect("server"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_signal_attempts_once() {
        let hub = hub();
        let client = client(&hub)
            .classifier(|error| RetrySignal::Cancel(error))
            .build()
            .expect("client");

        let start = Instant::now();
        let result = client.try_request(RequestInit::new("eth_chainId")).await;

        assert!(matches!(result, Err(Error::Unavailable { .. })));
        assert_eq!(client.pool().build_count(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let hub = hub();
        let client = client(&hub)
            .retry(
                RetryPolicy::new()
                    .base(Duration::from_millis(1))
                    .max_attempts(Some(3)),
            )
            .build()
            .expect("client");

        let result = client.try_request(RequestInit::new("eth_chainId")).await;

        match result {
            Err(Error::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::Unavailable { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(client.pool().build_count(), 3);
    }

    #[tokio::test]
    async fn test_response_timeout_surfaces() {
        let hub = hub();
        let _server = Server::listen(&hub, Arc::new(Backend::default()));
        let client = client(&hub).build().expect("client");

        let result = client
            .try_request_with_timeout(RequestInit::new("hang"), Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(Error::ResponseTimeout { .. })));
        let connection = client.pool().get(0).await.expect("connection");
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_caller_cancel() {
        let hub = hub();
        let _server = Server::listen(&hub, Arc::new(Backend::default()));
        let client = client(&hub).build().expect("client");

        let result = client
            .try_request_until(
                RequestInit::new("hang"),
                Duration::from_secs(5),
                tokio::time::sleep(Duration::from_millis(20)),
            )
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        let connection = client.pool().get(0).await.expect("connection");
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_resends_with_fresh_id() {
        let hub = hub();
        let backend = Arc::new(Backend::default());
        let server = Server::listen(&hub, Arc::clone(&backend) as Arc<dyn RequestHandler>);
        let client = client(&hub).classifier(classify).build().expect("client");

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.request(RequestInit::new("flaky")).await }
        });

        while backend.flaky_ids.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        server.disconnect_all();

        let value = call.await.expect("join").expect("value");
        assert_eq!(value, json!("fresh"));

        let ids = backend.flaky_ids.lock().clone();
        assert_eq!(ids.len(), 2);
        assert!(ids[1] > ids[0]);
        assert_eq!(client.pool().build_count(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_over_slots() {
        let hub = hub();
        let _server = Server::listen(&hub, Arc::new(Backend::default()));
        let client = client(&hub).capacity(3).build().expect("client");

        for _ in 0..6 {
            client
                .request(RequestInit::new("eth_chainId"))
                .await
                .expect("value");
        }

        assert_eq!(client.pool().build_count(), 3);
    }
}
