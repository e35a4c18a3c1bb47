//! Fixed-capacity connection pool.
//!
//! Each slot lazily builds one [`Connection`] through the pool's
//! [`Connector`] and replaces it when it dies.
//!
//! # Slot Lifecycle
//!
//! ```text
//!            get()                     handshake ok
//!   Empty ───────────► Building ──────────────────────► Built
//!     ▲                   │                               │
//!     │  handshake error  │                               │ close / heartbeat
//!     └───────────────────┘◄──────────────────────────────┘ timeout / delete
//! ```
//!
//! - Concurrent `get` calls on a `Building` slot share one build
//!   (single-flight).
//! - Every reset bumps the slot's [`Generation`]. A build or close event
//!   carrying an older generation is ignored, so a stale connection can
//!   never overwrite its replacement.
//! - A close event or a heartbeat timeout restarts the slot: teardown,
//!   then a background rebuild. `delete` only tears down; the next `get`
//!   rebuilds.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::Generation;

use super::connection::{Connection, DEFAULT_HANDSHAKE_TIMEOUT};
use super::keepalive::{Keepalive, KeepaliveConfig};
use super::router::RequestHandler;
use super::{CloseReason, Connector};

// ============================================================================
// Types
// ============================================================================

/// In-flight build shared by every caller waiting on the slot.
type BuildFuture = Shared<BoxFuture<'static, Result<Connection>>>;

#[derive(Default)]
enum SlotState {
    #[default]
    Empty,
    Building(BuildFuture),
    Built(Connection),
}

#[derive(Default)]
struct Slot {
    generation: Generation,
    state: SlotState,
}

/// Observable slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// No connection; the next `get` builds one.
    Empty,
    /// A build is in flight.
    Building,
    /// A connection is cached.
    Built,
}

// ============================================================================
// PoolOptions
// ============================================================================

/// Pool configuration.
#[derive(Clone)]
pub struct PoolOptions {
    /// Number of slots.
    pub capacity: usize,
    /// Bound on each `Hello` handshake.
    pub handshake_timeout: Duration,
    /// Keepalive timing; `None` disables the monitor.
    pub keepalive: Option<KeepaliveConfig>,
    /// Answers requests initiated by the peer.
    pub handler: Option<Arc<dyn RequestHandler>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: 1,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive: None,
            handler: None,
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("capacity", &self.capacity)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("keepalive", &self.keepalive)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

// ============================================================================
// PoolShared
// ============================================================================

/// Internal shared state for a pool.
struct PoolShared {
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    slots: Mutex<Vec<Slot>>,
    /// Builds started since creation.
    builds: AtomicU64,
}

impl PoolShared {
    /// Installs a new build in `slot` and returns it.
    fn start_build(self: &Arc<Self>, slot: &mut Slot, index: usize) -> BuildFuture {
        slot.generation = slot.generation.next();
        let generation = slot.generation;
        self.builds.fetch_add(1, Ordering::Relaxed);

        debug!(index, %generation, "Building connection");

        let future = Self::build(
            Arc::downgrade(self),
            Arc::clone(&self.connector),
            self.options.clone(),
            index,
            generation,
        )
        .boxed()
        .shared();

        slot.state = SlotState::Building(future.clone());
        future
    }

    async fn build(
        pool: Weak<Self>,
        connector: Arc<dyn Connector>,
        options: PoolOptions,
        index: usize,
        generation: Generation,
    ) -> Result<Connection> {
        let outcome = Self::connect(&pool, connector.as_ref(), &options, index, generation).await;

        let Some(shared) = pool.upgrade() else {
            if let Ok(connection) = &outcome {
                connection.teardown();
            }
            return Err(Error::handshake_failed("pool was dropped during handshake"));
        };

        shared.finish_build(index, generation, outcome)
    }

    /// Opens, handshakes and wires one connection.
    async fn connect(
        pool: &Weak<Self>,
        connector: &dyn Connector,
        options: &PoolOptions,
        index: usize,
        generation: Generation,
    ) -> Result<Connection> {
        let transport = connector.open().await?;
        let connection =
            Connection::establish(transport, options.handshake_timeout, options.handler.clone())
                .await?;

        if let Some(config) = options.keepalive {
            let evictor = Evictor::new(pool, index, generation);
            connection.attach_keepalive(Keepalive::spawn(
                connection.transport(),
                config,
                move |error| evictor.evict(&error),
            ));
        }

        let evictor = Evictor::new(pool, index, generation);
        connection.retain(
            connection
                .transport()
                .on_close(Arc::new(move |reason: &CloseReason| evictor.restart(reason))),
        );

        if connection.is_closed() {
            connection.teardown();
            return Err(Error::handshake_failed("transport closed during handshake"));
        }

        Ok(connection)
    }

    /// Stores the build outcome if the slot still expects it.
    fn finish_build(
        &self,
        index: usize,
        generation: Generation,
        outcome: Result<Connection>,
    ) -> Result<Connection> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).filter(|slot| {
            slot.generation == generation && matches!(slot.state, SlotState::Building(_))
        });

        match (outcome, slot) {
            (Ok(connection), Some(slot)) => {
                slot.state = SlotState::Built(connection.clone());
                drop(slots);
                info!(index, %generation, kind = %connection.kind(), "Connection ready");
                Ok(connection)
            }
            (Ok(connection), None) => {
                drop(slots);
                connection.teardown();
                debug!(index, %generation, "Discarding connection built for a reset slot");
                Err(Error::handshake_failed("slot was reset during handshake"))
            }
            (Err(e), slot) => {
                if let Some(slot) = slot {
                    slot.state = SlotState::Empty;
                }
                drop(slots);
                warn!(index, %generation, error = %e, "Connection build failed");
                Err(e)
            }
        }
    }

    /// Empties slot `index` and tears down what it held.
    ///
    /// With `expected`, nothing happens unless the slot is still at that
    /// generation. With `rebuild`, a background build starts right away.
    ///
    /// Returns `Ok(false)` for a stale generation.
    fn reset(
        self: &Arc<Self>,
        index: usize,
        expected: Option<Generation>,
        rebuild: bool,
    ) -> Result<bool> {
        let previous = {
            let mut slots = self.slots.lock();
            let capacity = slots.len();
            let slot = slots
                .get_mut(index)
                .ok_or_else(|| Error::slot_out_of_range(index, capacity))?;

            if expected.is_some_and(|generation| generation != slot.generation) {
                trace!(index, "Ignoring reset for a replaced connection");
                return Ok(false);
            }

            slot.generation = slot.generation.next();
            mem::take(&mut slot.state)
        };

        match previous {
            SlotState::Built(connection) => connection.teardown(),
            SlotState::Building(_) => debug!(index, "Abandoning in-flight build"),
            SlotState::Empty => {}
        }

        if rebuild {
            self.warm(index);
        }

        Ok(true)
    }

    /// Starts a background build if slot `index` is empty.
    fn warm(self: &Arc<Self>, index: usize) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!(index, "No runtime, slot will be rebuilt on demand");
            return;
        };

        let build = {
            let mut slots = self.slots.lock();
            match slots.get_mut(index) {
                Some(slot) if matches!(slot.state, SlotState::Empty) => {
                    Some(self.start_build(slot, index))
                }
                _ => None,
            }
        };

        if let Some(build) = build {
            runtime.spawn(async move {
                let _ = build.await;
            });
        }
    }
}

// ============================================================================
// Evictor
// ============================================================================

/// Resets one slot generation on behalf of a connection's monitors.
struct Evictor {
    pool: Weak<PoolShared>,
    index: usize,
    generation: Generation,
}

impl Evictor {
    fn new(pool: &Weak<PoolShared>, index: usize, generation: Generation) -> Self {
        Self {
            pool: Weak::clone(pool),
            index,
            generation,
        }
    }

    /// Heartbeat failure.
    fn evict(&self, error: &Error) {
        if let Some(pool) = self.pool.upgrade() {
            warn!(index = self.index, error = %error, "Evicting unresponsive connection");
            let _ = pool.reset(self.index, Some(self.generation), true);
        }
    }

    /// Close event.
    fn restart(&self, reason: &CloseReason) {
        if let Some(pool) = self.pool.upgrade() {
            debug!(index = self.index, ?reason, "Connection closed, restarting slot");
            let _ = pool.reset(self.index, Some(self.generation), true);
        }
    }
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Fixed-capacity pool of self-healing connections.
///
/// Cheap to clone; clones share the same slots.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::new(Arc::new(connector), PoolOptions::default())?;
///
/// let connection = pool.get(0).await?;
/// let response = connection.request(request, Duration::from_secs(30)).await?;
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity())
            .field("builds", &self.build_count())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates a pool with every slot empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the capacity or handshake timeout is zero.
    pub fn new(connector: Arc<dyn Connector>, options: PoolOptions) -> Result<Self> {
        if options.capacity == 0 {
            return Err(Error::config("Pool capacity must be at least 1"));
        }

        if options.handshake_timeout.is_zero() {
            return Err(Error::config("Handshake timeout must be non-zero"));
        }

        let slots = (0..options.capacity).map(|_| Slot::default()).collect();

        debug!(?options, "Connection pool created");

        Ok(Self {
            shared: Arc::new(PoolShared {
                connector,
                options,
                slots: Mutex::new(slots),
                builds: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.options.capacity
    }

    /// Returns the number of builds started since creation.
    #[inline]
    #[must_use]
    pub fn build_count(&self) -> u64 {
        self.shared.builds.load(Ordering::Relaxed)
    }

    /// Returns the connection in slot `index`, building it if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::SlotOutOfRange`] if `index >= capacity`
    /// - whatever the build failed with: [`Error::Unavailable`],
    ///   [`Error::HandshakeTimeout`] or [`Error::HandshakeFailed`]
    pub async fn get(&self, index: usize) -> Result<Connection> {
        let (build, stale) = {
            let mut slots = self.shared.slots.lock();
            let capacity = slots.len();
            let slot = slots
                .get_mut(index)
                .ok_or_else(|| Error::slot_out_of_range(index, capacity))?;

            match mem::take(&mut slot.state) {
                SlotState::Built(connection) if !connection.is_closed() => {
                    slot.state = SlotState::Built(connection.clone());
                    return Ok(connection);
                }
                SlotState::Building(build) => {
                    slot.state = SlotState::Building(build.clone());
                    (build, None)
                }
                SlotState::Built(dead) => (self.shared.start_build(slot, index), Some(dead)),
                SlotState::Empty => (self.shared.start_build(slot, index), None),
            }
        };

        if let Some(dead) = stale {
            trace!(index, "Replacing closed connection");
            dead.teardown();
        }

        build.await
    }

    /// Tears down slot `index`. The next `get` rebuilds it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if `index >= capacity`.
    pub fn delete(&self, index: usize) -> Result<()> {
        self.shared.reset(index, None, false).map(|_| ())
    }

    /// Tears down slot `index` and starts rebuilding it in the background.
    ///
    /// Without a tokio runtime the rebuild waits for the next `get`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if `index >= capacity`.
    pub fn restart(&self, index: usize) -> Result<()> {
        self.shared.reset(index, None, true).map(|_| ())
    }

    /// Deletes slot `index` only if it still holds `connection`.
    ///
    /// Returns `true` if the slot was reset.
    pub fn evict(&self, index: usize, connection: &Connection) -> bool {
        let generation = {
            let slots = self.shared.slots.lock();
            match slots.get(index) {
                Some(Slot {
                    generation,
                    state: SlotState::Built(current),
                }) if current.ptr_eq(connection) => Some(*generation),
                _ => None,
            }
        };

        match generation {
            Some(generation) => self
                .shared
                .reset(index, Some(generation), false)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Returns the state of slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SlotOutOfRange`] if `index >= capacity`.
    pub fn status(&self, index: usize) -> Result<SlotStatus> {
        let slots = self.shared.slots.lock();
        let slot = slots
            .get(index)
            .ok_or_else(|| Error::slot_out_of_range(index, slots.len()))?;

        Ok(match &slot.state {
            SlotState::Empty => SlotStatus::Empty,
            SlotState::Building(_) => SlotStatus::Building,
            SlotState::Built(connection) if connection.is_closed() => SlotStatus::Empty,
            SlotState::Built(_) => SlotStatus::Built,
        })
    }

    /// Tears down every slot. The pool stays usable; slots rebuild on demand.
    pub fn shutdown(&self) {
        info!(capacity = self.capacity(), "Connection pool shutting down");

        for index in 0..self.capacity() {
            let _ = self.shared.reset(index, None, false);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
