//! Retry policy engine.
//!
//! Every failure is classified before it crosses a component boundary:
//!
//! | Signal | Meaning | Loop action |
//! |--------|---------|-------------|
//! | [`RetrySignal::Cancel`] | Not recoverable | Stop, return the error |
//! | [`RetrySignal::Retry`] | Transient at acquisition | Back off, acquire again |
//! | [`RetrySignal::Skip`] | This connection is bad | Evict it, acquire a fresh one |
//!
//! [`try_loop`] drives an attempt closure under a [`RetryPolicy`].

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default backoff multiplier.
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Default cap on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Default bound on attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

// ============================================================================
// RetrySignal
// ============================================================================

/// Classified failure.
#[derive(Debug, Clone)]
pub enum RetrySignal {
    /// Stop and propagate.
    Cancel(Error),
    /// Wait, then acquire again. The hint overrides the policy's backoff.
    Retry(Error, Option<Duration>),
    /// Abandon the current connection and acquire a fresh one.
    Skip(Error),
}

impl RetrySignal {
    /// Returns the classified error.
    #[inline]
    #[must_use]
    pub fn error(&self) -> &Error {
        match self {
            Self::Cancel(e) | Self::Retry(e, _) | Self::Skip(e) => e,
        }
    }

    /// Consumes the signal, returning the error.
    #[inline]
    #[must_use]
    pub fn into_error(self) -> Error {
        match self {
            Self::Cancel(e) | Self::Retry(e, _) | Self::Skip(e) => e,
        }
    }

    /// Returns `true` for [`RetrySignal::Skip`].
    #[inline]
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }
}

/// Classification function.
pub type Classifier = Arc<dyn Fn(Error) -> RetrySignal + Send + Sync>;

/// Default classification.
///
/// Acquisition failures are retried, connection failures skip to a fresh
/// connection, and everything else (caller deadlines and cancellation
/// included) is surfaced.
#[must_use]
pub fn classify(error: Error) -> RetrySignal {
    match error {
        Error::Unavailable { .. } | Error::HandshakeTimeout { .. } | Error::HandshakeFailed { .. } => {
            RetrySignal::Retry(error, None)
        }
        Error::TransportDisconnected | Error::SendFailed { .. } | Error::HeartbeatTimeout { .. } => {
            RetrySignal::Skip(error)
        }
        _ => RetrySignal::Cancel(error),
    }
}

/// Returns [`classify`] as a [`Classifier`].
#[must_use]
pub fn default_classifier() -> Classifier {
    Arc::new(classify)
}

// ============================================================================
// RetryPolicy
// ============================================================================

/// Backoff and attempt bound for [`try_loop`].
///
/// The n-th retry waits `base * factor^(n-1)`, capped at `max_delay`. Skips
/// do not wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    factor: f64,
    max_delay: Option<Duration>,
    max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            factor: DEFAULT_FACTOR,
            max_delay: Some(DEFAULT_MAX_DELAY),
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy that never gives up, waiting a constant `base`
    /// between attempts. The delay is still capped at [`DEFAULT_MAX_DELAY`].
    #[must_use]
    pub fn unbounded(base: Duration) -> Self {
        Self {
            base,
            factor: 1.0,
            max_delay: Some(DEFAULT_MAX_DELAY),
            max_attempts: None,
        }
    }

    /// Sets the first delay.
    #[inline]
    #[must_use]
    pub fn base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Sets the backoff multiplier.
    #[inline]
    #[must_use]
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Caps a single delay; `None` leaves it uncapped.
    #[inline]
    #[must_use]
    pub fn max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Bounds the number of attempts; `None` retries forever.
    #[inline]
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the attempt bound.
    #[inline]
    #[must_use]
    pub fn attempt_limit(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a factor below 1, or a zero attempt
    /// bound.
    pub fn validate(&self) -> Result<()> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(Error::config(format!(
                "Retry factor must be at least 1, got {}",
                self.factor
            )));
        }

        if self.max_attempts == Some(0) {
            return Err(Error::config("Retry policy must allow at least one attempt"));
        }

        Ok(())
    }

    /// Returns the delay before the `retry`-th retry (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base.as_nanos() as f64 * self.factor.powi(exponent);

        let delay = if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        };

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

// ============================================================================
// try_loop
// ============================================================================

/// Runs `attempt` until it succeeds, is cancelled, or the attempt bound is
/// reached.
///
/// `attempt` receives the 1-based attempt number and reports failures as
/// an already classified [`RetrySignal`].
///
/// # Errors
///
/// - the error of a [`RetrySignal::Cancel`], unchanged
/// - [`Error::RetriesExhausted`] wrapping the last error once
///   `max_attempts` attempts failed
pub async fn try_loop<T, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, RetrySignal>>,
{
    let mut number: u32 = 1;
    let mut retries: u32 = 0;

    loop {
        let signal = match attempt(number).await {
            Ok(value) => return Ok(value),
            Err(RetrySignal::Cancel(error)) => return Err(error),
            Err(signal) => signal,
        };

        if policy.max_attempts.is_some_and(|max| number >= max) {
            debug!(attempts = number, error = %signal.error(), "Retries exhausted");
            return Err(Error::retries_exhausted(number, signal.into_error()));
        }

        match signal {
            RetrySignal::Retry(error, hint) => {
                retries = retries.saturating_add(1);
                let delay = hint.unwrap_or_else(|| policy.delay_for(retries));
                debug!(
                    attempt = number,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
            RetrySignal::Skip(error) => {
                debug!(attempt = number, error = %error, "Skipping to a fresh connection");
            }
            RetrySignal::Cancel(error) => return Err(error),
        }

        number = number.saturating_add(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use crate::identifiers::RequestId;

    #[test]
    fn test_default_classification() {
        assert!(matches!(
            classify(Error::unavailable("no receiver")),
            RetrySignal::Retry(_, None)
        ));
        assert!(matches!(
            classify(Error::handshake_timeout(1000)),
            RetrySignal::Retry(..)
        ));
        assert!(classify(Error::TransportDisconnected).is_skip());
        assert!(classify(Error::send_failed("gone")).is_skip());
        assert!(classify(Error::heartbeat_timeout(1000)).is_skip());
        assert!(matches!(
            classify(Error::response_timeout(RequestId::new(1), 10)),
            RetrySignal::Cancel(_)
        ));
        assert!(matches!(classify(Error::Cancelled), RetrySignal::Cancel(_)));
        assert!(matches!(
            classify(Error::config("bad")),
            RetrySignal::Cancel(_)
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new()
            .base(Duration::from_millis(100))
            .factor(2.0)
            .max_delay(Some(Duration::from_millis(500)));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_unbounded_policy_keeps_delay_bounded() {
        let policy = RetryPolicy::unbounded(Duration::from_millis(1));
        assert_eq!(policy.attempt_limit(), None);

        for retry in [1, 11, 20, 40, 1000, u32::MAX] {
            assert_eq!(policy.delay_for(retry), Duration::from_millis(1));
        }

        let slow = RetryPolicy::unbounded(Duration::from_secs(60));
        assert_eq!(slow.delay_for(40), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::new().validate().is_ok());
        assert!(RetryPolicy::new().factor(0.5).validate().is_err());
        assert!(RetryPolicy::new().max_attempts(Some(0)).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_makes_one_attempt_without_delay() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<()> = try_loop(&RetryPolicy::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RetrySignal::Cancel(Error::config("permanent"))) }
        })
        .await;

        assert!(matches!(result, Err(Error::Config { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_then_succeeds() {
        let policy = RetryPolicy::new().base(Duration::from_millis(100));
        let start = Instant::now();

        let value = try_loop(&policy, |attempt| async move {
            if attempt < 3 {
                Err(RetrySignal::Retry(Error::unavailable("not yet"), None))
            } else {
                Ok(attempt)
            }
        })
        .await
        .expect("third attempt");

        assert_eq!(value, 3);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_does_not_wait() {
        let start = Instant::now();

        let value = try_loop(&RetryPolicy::new(), |attempt| async move {
            if attempt == 1 {
                Err(RetrySignal::Skip(Error::TransportDisconnected))
            } else {
                Ok("fresh")
            }
        })
        .await
        .expect("second attempt");

        assert_eq!(value, "fresh");
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_hint_overrides_backoff() {
        let start = Instant::now();

        let value = try_loop(&RetryPolicy::new(), |attempt| async move {
            if attempt == 1 {
                Err(RetrySignal::Retry(
                    Error::unavailable("busy"),
                    Some(Duration::from_secs(2)),
                ))
            } else {
                Ok(attempt)
            }
        })
        .await
        .expect("second attempt");

        assert_eq!(value, 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_bound_exhausts() {
        let policy = RetryPolicy::new().max_attempts(Some(3));

        let result: Result<()> = try_loop(&policy, |_| async {
            Err(RetrySignal::Skip(Error::TransportDisconnected))
        })
        .await;

        match result {
            Err(Error::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::TransportDisconnected));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
