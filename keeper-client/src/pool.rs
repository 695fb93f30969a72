//! # Connection Pool
//!
//! Purpose: Bound and share access to store connections: create them on
//! demand up to `max`, keep `min` warm, queue callers when every slot is
//! borrowed, and tear everything down gracefully on `end()`.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: One mutex guards the bookkeeping; it is never held
//!    across an await, and connections are dialed and closed outside it.
//! 3. **Direct Hand-Off**: A returned connection (or a freed slot) goes
//!    straight to the best waiter, so queued callers are never overtaken.
//! 4. **RAII Release**: `PooledConnection` returns itself on drop, which makes
//!    every exit path of a borrower, errors and panics included, a release.
//!
//! ## Accounting
//!
//! ```text
//! total = idle + borrowed + (being created) + (being destroyed) <= max
//! ```
//!
//! A reserved-but-not-yet-dialed slot is a `Grant::Slot`; whoever holds it
//! either turns it into a connection or gives it back through `release_slot`.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keeper_common::{Endpoint, PoolSizing, StoreOptions, TargetAddress};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{PoolError, PoolResult};
use crate::events::{EventSink, PoolEvent};

/// Priority used by `acquire`; lower values are served first.
pub const DEFAULT_PRIORITY: u32 = 0;

/// Everything needed to build a pool. Immutable once the pool exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolOptions {
    /// Where connections are opened.
    pub address: TargetAddress,
    /// Per-connection options (credentials, database, reconnect policy).
    pub store: StoreOptions,
    /// Capacity and queueing limits.
    pub sizing: PoolSizing,
}

impl PoolOptions {
    pub fn from_url(url: impl Into<String>) -> Self {
        PoolOptions {
            address: TargetAddress::from_url(url),
            ..PoolOptions::default()
        }
    }

    pub fn from_host_and_port(host: impl Into<String>, port: u16) -> Self {
        PoolOptions {
            address: TargetAddress::from_host_and_port(host, port),
            ..PoolOptions::default()
        }
    }

    pub fn from_address(address: TargetAddress) -> Self {
        PoolOptions {
            address,
            ..PoolOptions::default()
        }
    }

    pub fn with_store_options(mut self, store: StoreOptions) -> Self {
        self.store = store;
        self
    }

    pub fn with_sizing(mut self, sizing: PoolSizing) -> Self {
        self.sizing = sizing;
        self
    }
}

/// Point-in-time counters of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections that exist or are being created/destroyed.
    pub size: usize,
    /// Idle connections ready to be borrowed.
    pub available: usize,
    /// Connections currently held by callers.
    pub borrowed: usize,
    /// Queued acquire requests.
    pub pending: usize,
    pub min: usize,
    pub max: usize,
}

impl PoolStatus {
    /// Connections that could still be created without hitting `max`.
    pub fn spare_capacity(&self) -> usize {
        self.max.saturating_sub(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Draining,
    Closed,
}

/// What a caller is handed: a live connection, or the right to dial one.
enum Grant {
    Idle(Connection),
    Slot,
}

enum Step {
    Ready(Grant),
    Wait(Waiter),
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    borrowed: usize,
    // Ordered by (priority, arrival) so the first entry is served next.
    waiters: BTreeMap<(u32, u64), oneshot::Sender<Grant>>,
    next_waiter: u64,
    phase: Phase,
}

struct PoolInner {
    options: PoolOptions,
    endpoint: Endpoint,
    events: EventSink,
    state: Mutex<PoolState>,
    // Signalled whenever the bookkeeping moves; `end()` waits on it.
    changed: Notify,
    next_id: AtomicU64,
}

/// Connection pool handle. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool and, when called inside a Tokio runtime, starts
    /// warming up `min` connections in the background.
    pub fn new(options: PoolOptions) -> PoolResult<Self> {
        options.sizing.validate()?;
        let endpoint = options.address.endpoint()?;

        let state = PoolState {
            idle: VecDeque::with_capacity(options.sizing.max),
            total: 0,
            borrowed: 0,
            waiters: BTreeMap::new(),
            next_waiter: 0,
            phase: Phase::Open,
        };
        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                options,
                endpoint,
                events: EventSink::new(),
                state: Mutex::new(state),
                changed: Notify::new(),
                next_id: AtomicU64::new(0),
            }),
        };

        debug!(address = %pool.inner.options.address, sizing = ?pool.inner.options.sizing, "pool created");
        pool.ensure_minimum();
        Ok(pool)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn address(&self) -> &TargetAddress {
        &self.inner.options.address
    }

    /// True when both handles share the same pool.
    pub fn ptr_eq(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers an observer for connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Current counters.
    pub fn status(&self) -> PoolStatus {
        let sizing = &self.inner.options.sizing;
        let state = self.inner.state.lock();
        PoolStatus {
            size: state.total,
            available: state.idle.len(),
            borrowed: state.borrowed,
            pending: state.waiters.len(),
            min: sizing.min,
            max: sizing.max,
        }
    }

    /// True once `end()` has started.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().phase != Phase::Open
    }

    /// Borrows a connection with the default priority.
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        self.acquire_with_priority(DEFAULT_PRIORITY).await
    }

    /// Borrows a connection, queueing behind lower-numbered priorities when
    /// the pool is exhausted.
    ///
    /// Fails with `QueueFull` right away when the queue is at its limit, and
    /// with `AcquireTimeout` when nothing turns up within the acquire timeout.
    pub async fn acquire_with_priority(&self, priority: u32) -> PoolResult<PooledConnection> {
        match self.inner.options.sizing.acquire_timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.checkout(priority)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(address = %self.inner.options.address, ?limit, priority, "acquire timed out");
                    Err(PoolError::AcquireTimeout(limit))
                }
            },
            None => self.checkout(priority).await,
        }
    }

    /// Returns a connection to the pool. Same as dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Removes a connection from the pool, closing it gracefully before its
    /// slot can be reused.
    pub async fn destroy(&self, conn: PooledConnection) {
        conn.destroy().await;
    }

    /// Alias of `destroy`.
    pub async fn disconnect(&self, conn: PooledConnection) {
        self.destroy(conn).await;
    }

    /// Borrows a connection, hands it to `f`, and returns it when the future
    /// `f` produced completes.
    ///
    /// The connection moves into `f`; it goes back to the pool when that
    /// future drops it, which also happens when `f` fails or panics.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(PooledConnection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        self.execute_with_priority(DEFAULT_PRIORITY, f).await
    }

    /// `execute` with an explicit queue priority.
    pub async fn execute_with_priority<F, Fut, T, E>(&self, priority: u32, f: F) -> Result<T, E>
    where
        F: FnOnce(PooledConnection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let conn = self.acquire_with_priority(priority).await?;
        f(conn).await
    }

    /// Stops accepting acquires, waits for every borrowed connection to come
    /// back and every queued caller to be served, then closes all connections.
    ///
    /// Emits `PoolEvent::End` once. Later acquires fail with `Closed`.
    pub async fn end(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Draining;
        }
        info!(address = %self.inner.options.address, "draining pool");

        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let state = self.inner.state.lock();
                if state.waiters.is_empty() && state.total == state.idle.len() {
                    break;
                }
            }
            changed.await;
        }

        let (idle, first_close) = {
            let mut state = self.inner.state.lock();
            let first_close = state.phase != Phase::Closed;
            state.phase = Phase::Closed;
            (state.idle.drain(..).collect::<Vec<_>>(), first_close)
        };
        for conn in idle {
            self.destroy_connection(conn).await;
        }

        if first_close {
            info!(address = %self.inner.options.address, "pool ended");
            self.inner.events.emit(PoolEvent::End);
        }
    }

    async fn checkout(&self, priority: u32) -> PoolResult<PooledConnection> {
        loop {
            let grant = match self.next_step(priority)? {
                Step::Ready(grant) => grant,
                Step::Wait(mut waiter) => waiter.wait().await?,
            };

            match grant {
                Grant::Idle(conn) if conn.is_healthy() => return Ok(self.lend(conn)),
                Grant::Idle(conn) => {
                    debug!(connection_id = conn.id(), state = %conn.state(), "skipping unhealthy idle connection");
                    self.retire(conn);
                }
                Grant::Slot => {
                    let slot = SlotGuard::new(self.clone());
                    let conn = self.create(slot).await?;
                    return Ok(self.lend(conn));
                }
            }
        }
    }

    fn next_step(&self, priority: u32) -> PoolResult<Step> {
        let sizing = &self.inner.options.sizing;
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Open {
            return Err(PoolError::Closed);
        }
        if let Some(conn) = state.idle.pop_front() {
            return Ok(Step::Ready(Grant::Idle(conn)));
        }
        if state.total < sizing.max {
            state.total += 1;
            return Ok(Step::Ready(Grant::Slot));
        }
        if state.waiters.len() >= sizing.max_waiting_clients {
            return Err(PoolError::QueueFull(sizing.max_waiting_clients));
        }

        let key = (priority, state.next_waiter);
        state.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(key, tx);
        Ok(Step::Wait(Waiter {
            pool: self.clone(),
            key,
            rx,
        }))
    }

    async fn create(&self, slot: SlotGuard) -> PoolResult<Connection> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Connection::open(
            id,
            self.inner.endpoint.clone(),
            self.inner.options.store.clone(),
            self.inner.events.clone(),
        )
        .await?;
        slot.disarm();
        Ok(conn)
    }

    fn lend(&self, conn: Connection) -> PooledConnection {
        self.inner.state.lock().borrowed += 1;
        PooledConnection {
            pool: self.clone(),
            conn: Some(conn),
        }
    }

    fn forget_borrow(&self) {
        let mut state = self.inner.state.lock();
        state.borrowed = state.borrowed.saturating_sub(1);
    }

    /// Takes a connection back from a borrower, applying the health check.
    fn give_back(&self, conn: Connection) {
        self.forget_borrow();
        if conn.is_healthy() {
            self.checkin(conn);
        } else {
            debug!(
                connection_id = conn.id(),
                state = %conn.state(),
                in_flight = conn.is_in_flight(),
                "connection failed validation on release"
            );
            self.retire(conn);
        }
    }

    /// Puts a healthy connection back into circulation.
    fn checkin(&self, conn: Connection) {
        let mut state = self.inner.state.lock();
        if state.phase == Phase::Closed {
            drop(state);
            self.retire(conn);
            return;
        }
        if let Some(Grant::Idle(conn)) = offer(&mut state.waiters, Grant::Idle(conn)) {
            state.idle.push_back(conn);
        }
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Frees a slot, or passes it on to the next waiter.
    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        let handed_off = state.phase != Phase::Closed && offer(&mut state.waiters, Grant::Slot).is_none();
        if !handed_off {
            state.total = state.total.saturating_sub(1);
        }
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Destroys a connection in the background.
    fn retire(&self, conn: Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move { pool.destroy_connection(conn).await });
            }
            Err(_) => {
                warn!(connection_id = conn.id(), "no runtime to close connection gracefully, dropping it");
                drop(conn);
                self.release_slot();
            }
        }
    }

    async fn destroy_connection(&self, mut conn: Connection) {
        let id = conn.id();
        if let Err(err) = conn.close().await {
            debug!(connection_id = id, error = %err, "connection closed uncleanly");
        }
        self.release_slot();
        self.ensure_minimum();
    }

    /// Tops the pool up to `min` connections in the background.
    fn ensure_minimum(&self) {
        let missing = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Open {
                return;
            }
            let missing = self.inner.options.sizing.min.saturating_sub(state.total);
            state.total += missing;
            missing
        };
        if missing == 0 {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(address = %self.inner.options.address, "no runtime, skipping warm-up");
            for _ in 0..missing {
                self.release_slot();
            }
            return;
        };
        for _ in 0..missing {
            let pool = self.clone();
            handle.spawn(async move {
                let slot = SlotGuard::new(pool.clone());
                if let Ok(conn) = pool.create(slot).await {
                    pool.checkin(conn);
                }
            });
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.options.address)
            .field("status", &self.status())
            .finish()
    }
}

/// Hands `grant` to the best live waiter; gives it back if there is none.
fn offer(waiters: &mut BTreeMap<(u32, u64), oneshot::Sender<Grant>>, mut grant: Grant) -> Option<Grant> {
    while let Some((_, tx)) = waiters.pop_first() {
        match tx.send(grant) {
            Ok(()) => return None,
            // Receiver already gone (timed out); try the next one.
            Err(returned) => grant = returned,
        }
    }
    Some(grant)
}

/// A queued acquire request.
struct Waiter {
    pool: ConnectionPool,
    key: (u32, u64),
    rx: oneshot::Receiver<Grant>,
}

impl Waiter {
    async fn wait(&mut self) -> PoolResult<Grant> {
        (&mut self.rx).await.map_err(|_| PoolError::Closed)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let removed = self.pool.inner.state.lock().waiters.remove(&self.key);
        if removed.is_some() {
            drop(removed);
            self.pool.inner.changed.notify_waiters();
        }

        // A grant may have been sent after the caller stopped waiting.
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Grant::Idle(conn)) => self.pool.checkin(conn),
            Ok(Grant::Slot) => self.pool.release_slot(),
            Err(_) => {}
        }
    }
}

/// A reserved slot that is released unless a connection was created in it.
struct SlotGuard {
    pool: Option<ConnectionPool>,
}

impl SlotGuard {
    fn new(pool: ConnectionPool) -> Self {
        SlotGuard { pool: Some(pool) }
    }

    fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_slot();
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
}

impl PooledConnection {
    /// Takes the connection out of circulation and closes it gracefully.
    pub async fn destroy(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.forget_borrow();
            self.pool.destroy_connection(conn).await;
        }
    }

    /// The pool this connection belongs to.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection exists until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection exists until drop")
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}
