//! Builder pattern for client configuration.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use hopwire::retry::RetryPolicy;
//! use hopwire::transport::{ChannelConnector, Hub, KeepaliveConfig};
//! use hopwire::PooledClient;
//!
//! # fn example() -> hopwire::Result<()> {
//! let hub = Hub::new("service-worker");
//! let client = PooledClient::builder(ChannelConnector::new(hub))
//!     .keepalive(KeepaliveConfig::default())
//!     .request_timeout(Duration::from_secs(10))
//!     .retry(RetryPolicy::unbounded(Duration::from_millis(1)))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::{Classifier, RetryPolicy, RetrySignal, default_classifier};
use crate::transport::connection::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::transport::{ConnectionPool, Connector, KeepaliveConfig, PoolOptions, RequestHandler};

use super::pooled::PooledClient;
use super::rpc::RpcClient;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`PooledClient`].
///
/// Use [`PooledClient::builder()`] to create a new builder.
#[derive(Clone)]
pub struct ClientBuilder {
    connector: Arc<dyn Connector>,
    /// Number of pool slots.
    capacity: usize,
    handshake_timeout: Duration,
    /// Keepalive timing; off unless set.
    keepalive: Option<KeepaliveConfig>,
    request_timeout: Duration,
    retry: RetryPolicy,
    classifier: Option<Classifier>,
    /// Answers requests initiated by the peer.
    handler: Option<Arc<dyn RequestHandler>>,
    rpc: RpcClient,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("capacity", &self.capacity)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("keepalive", &self.keepalive)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("classifier", &self.classifier.is_some())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            capacity: 1,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            classifier: None,
            handler: None,
            rpc: RpcClient::new(),
        }
    }

    /// Sets the number of pool slots.
    #[inline]
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the bound on each `Hello` handshake.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Enables the keepalive monitor.
    ///
    /// Needed for transports that do not report a dead peer.
    #[inline]
    #[must_use]
    pub fn keepalive(mut self, config: KeepaliveConfig) -> Self {
        self.keepalive = Some(config);
        self
    }

    /// Sets the default time to wait for a response.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[inline]
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Replaces the default error classification.
    #[must_use]
    pub fn classifier(
        mut self,
        classifier: impl Fn(Error) -> RetrySignal + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Sets the handler for requests initiated by the peer.
    #[inline]
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Draws request ids from `rpc` instead of the process-wide counter.
    #[inline]
    #[must_use]
    pub fn rpc_client(mut self, rpc: RpcClient) -> Self {
        self.rpc = rpc;
        self
    }

    /// Builds the client.
    ///
    /// No connection is opened until the first request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero capacity, a zero duration or an
    /// invalid retry policy.
    pub fn build(self) -> Result<PooledClient> {
        if self.request_timeout.is_zero() {
            return Err(Error::config("Request timeout must be non-zero"));
        }

        if let Some(keepalive) = &self.keepalive
            && (keepalive.interval.is_zero() || keepalive.deadline.is_zero())
        {
            return Err(Error::config(
                "Keepalive interval and deadline must be non-zero",
            ));
        }

        self.retry.validate()?;

        let pool = ConnectionPool::new(
            self.connector,
            PoolOptions {
                capacity: self.capacity,
                handshake_timeout: self.handshake_timeout,
                keepalive: self.keepalive,
                handler: self.handler,
            },
        )?;

        Ok(PooledClient::from_parts(
            self.rpc,
            pool,
            self.retry,
            self.classifier.unwrap_or_else(default_classifier),
            self.request_timeout,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::{Hub, PortConnector, PortTransport};

    fn builder() -> ClientBuilder {
        let hub = Hub::<PortTransport>::new("background");
        PooledClient::builder(PortConnector::new(hub, "content_script"))
    }

    #[test]
    fn test_defaults_build() {
        let client = builder().build().expect("client");
        assert_eq!(client.pool().capacity(), 1);
        assert_eq!(client.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(client.pool().build_count(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = builder().capacity(0).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_zero_durations_rejected() {
        assert!(builder().request_timeout(Duration::ZERO).build().is_err());
        assert!(builder().handshake_timeout(Duration::ZERO).build().is_err());
        assert!(builder()
            .keepalive(KeepaliveConfig::new(Duration::ZERO, Duration::from_secs(1)))
            .build()
            .is_err());
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let result = builder()
            .retry(RetryPolicy::new().max_attempts(Some(0)))
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_builder_debug_hides_closures() {
        let debug = format!("{:?}", builder().classifier(crate::retry::classify));
        assert!(debug.contains("classifier: true"));
        assert!(debug.contains("handler: false"));
    }
}
