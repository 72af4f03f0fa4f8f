//! Connection pool management.
//!
//! The pool owns every connection wrapper it ever created and partitions them
//! into an idle stack and the set of wrappers currently lent out.
//!
//! # Concurrency
//!
//! - Bookkeeping (idle stack, tracked set, in-flight opens) lives behind one
//!   `std::sync::Mutex` that is only held for O(1) updates, never across an
//!   await point
//! - Each native handle sits behind its own `tokio::sync::Mutex`, so driver
//!   I/O on one connection never blocks another
//! - Callers waiting for a free slot park on a `Notify` that every release,
//!   discard and failed open signals
//!
//! # Cancellation
//!
//! Acquisition is cancel-safe: a slot reserved for a new connection, or an idle
//! wrapper checked out for validation, is handed back by a drop guard if the
//! acquiring future is dropped midway. A [`Connection`] dropped without an
//! explicit release returns its wrapper to the idle stack.
//!
//! # Loans
//!
//! Every checkout bumps the wrapper's loan generation and the issued
//! [`Connection`] remembers it. Release and handle access only succeed for the
//! current loan, so an earlier borrower can never touch a wrapper that has
//! since been lent to someone else.

use crate::config::PoolOptions;
use crate::db::driver::Driver;
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{MappedMutexGuard, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Active,
    /// Terminal. A closed wrapper is never handed out again.
    Closed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Active => 1,
            ConnectionState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Diagnostic snapshot of one tracked connection (no handle exposed).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: u64,
    pub state: ConnectionState,
    /// When the physical connection was opened (absolute time)
    pub created_at: DateTime<Utc>,
    /// Milliseconds since the connection was last released
    pub idle_millis: u64,
}

const FIRST_LOAN: u64 = 1;

struct Slot<D: Driver> {
    id: u64,
    handle: AsyncMutex<Option<D::Handle>>,
    state: AtomicU8,
    /// Generation of the current loan. Bumped under the bookkeeping lock on
    /// every checkout.
    loan: AtomicU64,
    created_at: Instant,
    /// Uses std::sync::RwLock (not tokio) so reads never await.
    last_released: RwLock<Instant>,
}

impl<D: Driver> Slot<D> {
    fn new(id: u64, handle: D::Handle) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle: AsyncMutex::new(Some(handle)),
            state: AtomicU8::new(ConnectionState::Active.as_u8()),
            loan: AtomicU64::new(FIRST_LOAN),
            created_at: now,
            last_released: RwLock::new(now),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn loan(&self) -> u64 {
        self.loan.load(Ordering::Acquire)
    }

    /// Start a new loan. Callers hold the bookkeeping lock.
    fn next_loan(&self) -> u64 {
        self.loan.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn touch_released(&self) {
        if let Ok(mut last_released) = self.last_released.write() {
            *last_released = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_released
            .read()
            .map(|guard| guard.elapsed())
            .unwrap_or_else(|_| self.created_at.elapsed())
    }
}

struct PoolState<D: Driver> {
    /// LIFO: the most recently released wrapper is reused first.
    idle: Vec<Arc<Slot<D>>>,
    all: HashMap<u64, Arc<Slot<D>>>,
    /// Physical connections currently being opened (reserved capacity).
    opening: usize,
    closed: bool,
}

struct PoolInner<D: Driver> {
    driver: D,
    options: PoolOptions,
    state: Mutex<PoolState<D>>,
    released: Notify,
    next_id: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
    /// Pool start time for converting Instant to DateTime
    start_instant: Instant,
    start_datetime: DateTime<Utc>,
}

impl<D: Driver> PoolInner<D> {
    fn lock_state(&self) -> DbResult<std::sync::MutexGuard<'_, PoolState<D>>> {
        self.state
            .lock()
            .map_err(|_| DbError::internal("Connection pool bookkeeping lock poisoned"))
    }

    /// Decide the next acquisition step under the bookkeeping lock.
    fn next_step(self: &Arc<Self>) -> DbResult<Step<D>> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(DbError::PoolClosed);
        }
        if let Some(slot) = state.idle.pop() {
            slot.set_state(ConnectionState::Active);
            let loan = slot.next_loan();
            return Ok(Step::Reuse(Checkout {
                slot,
                loan,
                inner: Arc::clone(self),
                armed: true,
            }));
        }
        let max = self.options.max_connections_or_default() as usize;
        if state.all.len() + state.opening < max {
            state.opening += 1;
            return Ok(Step::Open(Reservation {
                inner: Arc::clone(self),
                armed: true,
            }));
        }
        Ok(Step::Wait)
    }

    /// Return a loan to the idle stack. Fails without side effects unless
    /// `loan` is the wrapper's current, active loan.
    fn checkin(&self, slot: &Arc<Slot<D>>, loan: u64) -> DbResult<()> {
        {
            let mut state = self.lock_state()?;
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            if slot.loan() != loan {
                return Err(DbError::connection_state(
                    slot.id,
                    "connection was released and lent out again",
                ));
            }
            match slot.state() {
                ConnectionState::Active => {}
                ConnectionState::Idle => {
                    return Err(DbError::connection_state(
                        slot.id,
                        "connection is already released",
                    ));
                }
                ConnectionState::Closed => {
                    return Err(DbError::connection_state(slot.id, "connection is closed"));
                }
            }
            slot.touch_released();
            slot.set_state(ConnectionState::Idle);
            state.idle.push(Arc::clone(slot));
        }
        self.released.notify_one();
        Ok(())
    }

    fn release_slot(&self, slot: &Arc<Slot<D>>, loan: u64) -> DbResult<()> {
        match self.checkin(slot, loan) {
            Ok(()) => {
                debug!(connection_id = slot.id, "Connection released");
                Ok(())
            }
            Err(e @ DbError::ConnectionState { .. }) => {
                warn!(connection_id = slot.id, error = %e, "Rejected connection release");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Confirm a validated checkout. Fails if the pool was closed meanwhile.
    fn confirm_checkout(&self, slot: &Slot<D>) -> DbResult<()> {
        let state = self.lock_state()?;
        if state.closed || slot.state() == ConnectionState::Closed {
            slot.set_state(ConnectionState::Closed);
            return Err(DbError::PoolClosed);
        }
        Ok(())
    }

    /// Put a checked-out wrapper back without counting it as a release.
    fn return_idle(&self, slot: Arc<Slot<D>>) {
        if let Ok(mut state) = self.state.lock() {
            if state.closed || slot.state() == ConnectionState::Closed {
                slot.set_state(ConnectionState::Closed);
            } else {
                slot.set_state(ConnectionState::Idle);
                state.idle.push(slot);
            }
        }
        self.released.notify_one();
    }

    /// Stop tracking a wrapper. The caller closes its handle.
    fn forget(&self, slot: &Slot<D>) {
        slot.set_state(ConnectionState::Closed);
        if let Ok(mut state) = self.state.lock() {
            state.all.remove(&slot.id);
        }
        self.released.notify_one();
    }

    async fn close_handle(&self, slot: &Slot<D>) {
        let handle = slot.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = self.driver.close(handle).await {
                debug!(connection_id = slot.id, error = %e, "Error while closing handle");
            }
        }
    }

    fn to_datetime(&self, instant: Instant) -> DateTime<Utc> {
        let offset = instant.duration_since(self.start_instant);
        self.start_datetime
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

enum Step<D: Driver> {
    Reuse(Checkout<D>),
    Open(Reservation<D>),
    Wait,
}

/// An idle wrapper taken off the stack for validation. Returned to the stack on drop.
struct Checkout<D: Driver> {
    slot: Arc<Slot<D>>,
    loan: u64,
    inner: Arc<PoolInner<D>>,
    armed: bool,
}

impl<D: Driver> Checkout<D> {
    fn finish(mut self) -> (Arc<Slot<D>>, u64) {
        self.armed = false;
        (Arc::clone(&self.slot), self.loan)
    }
}

impl<D: Driver> Drop for Checkout<D> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.return_idle(Arc::clone(&self.slot));
        }
    }
}

/// Capacity reserved for a connection being opened. Freed on drop unless registered.
struct Reservation<D: Driver> {
    inner: Arc<PoolInner<D>>,
    armed: bool,
}

impl<D: Driver> Reservation<D> {
    /// Register the freshly opened wrapper, consuming the reservation.
    fn register(mut self, slot: Arc<Slot<D>>) -> DbResult<usize> {
        self.armed = false;
        let mut state = self.inner.lock_state()?;
        state.opening = state.opening.saturating_sub(1);
        if state.closed {
            slot.set_state(ConnectionState::Closed);
            return Err(DbError::PoolClosed);
        }
        state.all.insert(slot.id, slot);
        Ok(state.all.len())
    }
}

impl<D: Driver> Drop for Reservation<D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.inner.state.lock() {
            state.opening = state.opening.saturating_sub(1);
        }
        self.inner.released.notify_one();
    }
}

/// A pool of physical database connections.
///
/// Cloning is cheap and yields another handle to the same pool, which is how
/// the pool is shared with concurrent workers.
pub struct ConnectionPool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.inner.driver.name())
            .field("size", &self.size())
            .field("idle", &self.idle_count())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<D: Driver> ConnectionPool<D> {
    /// Create a pool. No connection is opened until the first acquisition.
    pub fn new(driver: D, options: PoolOptions) -> DbResult<Self> {
        options.validate().map_err(DbError::invalid_input)?;
        info!(
            driver = driver.name(),
            max_connections = options.max_connections_or_default(),
            "Creating connection pool"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                driver,
                options,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    all: HashMap::new(),
                    opening: 0,
                    closed: false,
                }),
                released: Notify::new(),
                next_id: AtomicU64::new(0),
                reaper: Mutex::new(None),
                start_instant: Instant::now(),
                start_datetime: Utc::now(),
            }),
        })
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Borrow a connection.
    ///
    /// Reuses the most recently released idle wrapper when it is still valid;
    /// dead or expired idle wrappers are discarded on the way. Otherwise opens
    /// a new physical connection, or waits for a release when the pool is at
    /// `max_connections`.
    pub async fn get_connection(&self) -> DbResult<Connection<D>> {
        let acquire_timeout = self.inner.options.acquire_timeout_or_default();
        let deadline = tokio::time::Instant::now() + acquire_timeout;

        loop {
            // Register interest before inspecting state so a release between
            // the check and the wait is not missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.next_step()? {
                Step::Reuse(checkout) => {
                    if let Some(conn) = self.try_reuse(checkout).await? {
                        return Ok(conn);
                    }
                }
                Step::Open(reservation) => return self.open(reservation).await,
                Step::Wait => {
                    debug!("Connection pool exhausted, waiting for a release");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(
                            timeout_secs = acquire_timeout.as_secs(),
                            "Timed out waiting for a connection"
                        );
                        return Err(DbError::timeout(
                            "connection pool acquire",
                            acquire_timeout.as_secs(),
                        ));
                    }
                }
            }
        }
    }

    /// Validate a checked-out idle wrapper. `Ok(None)` means it was discarded
    /// and the caller should try again.
    async fn try_reuse(&self, checkout: Checkout<D>) -> DbResult<Option<Connection<D>>> {
        let slot = Arc::clone(&checkout.slot);
        let idle_timeout = self.inner.options.idle_timeout_or_default();

        let verdict = if slot.idle_for() >= idle_timeout {
            Err(DbError::stale_handle(slot.id))
        } else if self.inner.options.test_before_acquire_or_default() {
            self.probe(&slot).await
        } else {
            Ok(())
        };

        let (slot, loan) = checkout.finish();
        let verdict = verdict.and_then(|()| self.inner.confirm_checkout(&slot));
        match verdict {
            Ok(()) => {
                debug!(connection_id = slot.id, "Reusing idle connection");
                Ok(Some(Connection::new(slot, loan, Arc::downgrade(&self.inner))))
            }
            Err(DbError::PoolClosed) => {
                // Closed during validation. close() no longer tracks this handle.
                self.inner.close_handle(&slot).await;
                Err(DbError::PoolClosed)
            }
            Err(e) => {
                warn!(connection_id = slot.id, error = %e, "Discarding idle connection");
                self.inner.forget(&slot);
                self.inner.close_handle(&slot).await;
                Ok(None)
            }
        }
    }

    async fn probe(&self, slot: &Slot<D>) -> DbResult<()> {
        let mut guard = slot.handle.lock().await;
        match guard.as_mut() {
            Some(handle) => self
                .inner
                .driver
                .ping(handle)
                .await
                .map_err(|_| DbError::stale_handle(slot.id)),
            None => Err(DbError::stale_handle(slot.id)),
        }
    }

    async fn open(&self, reservation: Reservation<D>) -> DbResult<Connection<D>> {
        let handle = match self.inner.driver.connect().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(driver = self.inner.driver.name(), error = %e, "Failed to open connection");
                return Err(e);
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = Arc::new(Slot::new(id, handle));
        match reservation.register(Arc::clone(&slot)) {
            Ok(size) => {
                info!(connection_id = id, size = size, "Opened new connection");
                Ok(Connection::new(slot, FIRST_LOAN, Arc::downgrade(&self.inner)))
            }
            Err(e) => {
                self.inner.close_handle(&slot).await;
                Err(e)
            }
        }
    }

    /// Return a connection to the idle set. The physical handle stays open.
    pub fn release(&self, conn: &Connection<D>) -> DbResult<()> {
        conn.release()
    }

    /// Number of tracked wrappers (idle + active).
    pub fn size(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.all.len())
            .unwrap_or(0)
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.idle.len())
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.all.len() - state.idle.len())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.closed)
            .unwrap_or(true)
    }

    /// See [`Connection::is_valid`].
    pub async fn is_valid(&self, conn: &Connection<D>, force_check: bool) -> bool {
        conn.is_valid(force_check).await
    }

    /// See [`Connection::is_stale`].
    pub fn is_stale(&self, conn: &Connection<D>, max_idle: Duration) -> bool {
        conn.is_stale(max_idle)
    }

    /// List tracked connections with details.
    pub fn list_connections(&self) -> Vec<ConnectionSummary> {
        let Ok(state) = self.inner.state.lock() else {
            return Vec::new();
        };
        let mut summaries: Vec<_> = state
            .all
            .values()
            .map(|slot| ConnectionSummary {
                id: slot.id,
                state: slot.state(),
                created_at: self.inner.to_datetime(slot.created_at),
                idle_millis: slot.idle_for().as_millis() as u64,
            })
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Close idle connections that exceeded the idle timeout.
    ///
    /// Returns the number of connections closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.options.idle_timeout_or_default();
        let expired: Vec<Arc<Slot<D>>> = {
            let Ok(mut state) = self.inner.state.lock() else {
                return 0;
            };
            let (expired, keep): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|slot| slot.idle_for() >= idle_timeout);
            state.idle = keep;
            for slot in &expired {
                slot.set_state(ConnectionState::Closed);
                state.all.remove(&slot.id);
            }
            expired
        };

        if !expired.is_empty() {
            self.inner.released.notify_waiters();
        }
        for slot in &expired {
            debug!(connection_id = slot.id, "Reaping idle connection");
            self.inner.close_handle(slot).await;
        }
        expired.len()
    }

    /// Spawn a background task that periodically reaps idle connections.
    ///
    /// The task holds only a weak reference and exits once the pool is dropped
    /// or closed.
    pub fn start_reaper(&self) {
        let weak: Weak<PoolInner<D>> = Arc::downgrade(&self.inner);
        let interval = self.inner.options.reaper_interval_or_default();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                let reaped = pool.reap_idle().await;
                if reaped > 0 {
                    info!(reaped = reaped, size = pool.size(), "Reaped idle connections");
                }
            }
        });

        if let Ok(mut guard) = self.inner.reaper.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Close the pool.
    ///
    /// Idle handles are closed immediately. Wrappers currently lent out are
    /// marked closed; every later operation on them fails with
    /// [`DbError::PoolClosed`].
    pub async fn close(&self) {
        let (idle, outstanding) = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            for slot in state.all.values() {
                slot.set_state(ConnectionState::Closed);
            }
            let outstanding = state.all.len() - idle.len();
            state.all.clear();
            (idle, outstanding)
        };

        if let Ok(mut guard) = self.inner.reaper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.inner.released.notify_waiters();

        for slot in &idle {
            self.inner.close_handle(slot).await;
        }
        info!(
            closed = idle.len(),
            outstanding = outstanding,
            "Connection pool closed"
        );
    }
}

/// A borrowed connection.
///
/// Equality is wrapper identity: two values compare equal only if they refer
/// to the same pooled wrapper. Dropping an unreleased connection releases it.
pub struct Connection<D: Driver> {
    slot: Arc<Slot<D>>,
    loan: u64,
    pool: Weak<PoolInner<D>>,
}

impl<D: Driver> std::fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.slot.id)
            .field("state", &self.slot.state())
            .field("loan", &self.loan)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> PartialEq for Connection<D> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<D: Driver> Eq for Connection<D> {}

impl<D: Driver> Connection<D> {
    fn new(slot: Arc<Slot<D>>, loan: u64, pool: Weak<PoolInner<D>>) -> Self {
        Self { slot, loan, pool }
    }

    /// True while this value holds the wrapper's current loan.
    fn holds_loan(&self) -> bool {
        self.slot.loan() == self.loan
    }

    /// Pool-unique wrapper id.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    /// Time since the connection was last released (or opened).
    pub fn idle_for(&self) -> Duration {
        self.slot.idle_for()
    }

    /// True iff the time since the last release is at least `max_idle`.
    pub fn is_stale(&self, max_idle: Duration) -> bool {
        self.slot.idle_for() >= max_idle
    }

    /// Check whether the connection is usable.
    ///
    /// The default check only looks at the wrapper state and the presence of
    /// the handle. With `force_check` the handle is probed with a round trip,
    /// which detects handles closed behind the pool's back.
    pub async fn is_valid(&self, force_check: bool) -> bool {
        if self.slot.state() == ConnectionState::Closed {
            return false;
        }
        let Some(inner) = self.pool.upgrade() else {
            return false;
        };
        if !force_check {
            // A locked handle is in use, hence present.
            return self
                .slot
                .handle
                .try_lock()
                .map(|guard| guard.is_some())
                .unwrap_or(true);
        }
        let mut guard = self.slot.handle.lock().await;
        match guard.as_mut() {
            Some(handle) => inner.driver.ping(handle).await.is_ok(),
            None => false,
        }
    }

    /// Return the connection to its pool.
    ///
    /// Releasing twice, or after the wrapper was lent to another borrower,
    /// fails with [`DbError::ConnectionState`]; releasing after the pool was
    /// closed fails with [`DbError::PoolClosed`].
    pub fn release(&self) -> DbResult<()> {
        let inner = self.pool.upgrade().ok_or(DbError::PoolClosed)?;
        inner.release_slot(&self.slot, self.loan)
    }

    fn active_pool(&self) -> DbResult<Arc<PoolInner<D>>> {
        let inner = self.pool.upgrade().ok_or(DbError::PoolClosed)?;
        if !self.holds_loan() {
            return Err(DbError::connection_state(
                self.slot.id,
                "connection was released and lent out again",
            ));
        }
        match self.slot.state() {
            ConnectionState::Active => Ok(inner),
            ConnectionState::Closed => Err(DbError::PoolClosed),
            ConnectionState::Idle => Err(DbError::connection_state(
                self.slot.id,
                "connection was released",
            )),
        }
    }

    /// Exclusive access to the native handle.
    pub async fn handle(&self) -> DbResult<MappedMutexGuard<'_, D::Handle>> {
        self.active_pool()?;
        let guard = self.slot.handle.lock().await;
        // The loan may have ended while waiting for the lock.
        self.active_pool()?;
        AsyncMutexGuard::try_map(guard, |handle| handle.as_mut())
            .map_err(|_| DbError::stale_handle(self.slot.id))
    }

    /// Run a query on this connection.
    pub async fn fetch_all(&self, sql: &str) -> DbResult<Vec<D::Row>> {
        let inner = self.active_pool()?;
        let mut handle = self.handle().await?;
        inner.driver.fetch_all(&mut *handle, sql).await
    }

    /// Run a statement on this connection.
    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        let inner = self.active_pool()?;
        let mut handle = self.handle().await?;
        inner.driver.execute(&mut *handle, sql).await
    }
}

impl<D: Driver> Drop for Connection<D> {
    fn drop(&mut self) {
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        // Released, superseded and closed loans are left alone.
        if self.holds_loan()
            && self.slot.state() == ConnectionState::Active
            && inner.checkin(&self.slot, self.loan).is_ok()
        {
            debug!(connection_id = self.slot.id, "Dropped connection returned to pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::MemoryDriver;

    fn pool(max: u32) -> ConnectionPool<MemoryDriver> {
        ConnectionPool::new(
            MemoryDriver::new(),
            PoolOptions {
                max_connections: Some(max),
                acquire_timeout_secs: Some(1),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_pool_is_empty() {
        let pool = pool(4);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.idle_count(), 0);
        assert!(!pool.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let result = ConnectionPool::new(
            MemoryDriver::new(),
            PoolOptions {
                max_connections: Some(0),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let pool = pool(4);
        let conn = pool.get_connection().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(pool.active_count(), 1);
        conn.release().unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(pool.idle_count(), 1);
        pool.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_use_after_release_rejected() {
        let pool = pool(4);
        let conn = pool.get_connection().await.unwrap();
        conn.release().unwrap();
        assert!(matches!(
            conn.execute("SELECT 1").await,
            Err(DbError::ConnectionState { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_connections() {
        let pool = pool(4);
        let a = pool.get_connection().await.unwrap();
        let _b = pool.get_connection().await.unwrap();
        a.release().unwrap();
        let summaries = pool.list_connections();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, a.id());
        assert_eq!(summaries[0].state, ConnectionState::Idle);
        assert_eq!(summaries[1].state, ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_stale_loan_is_rejected() {
        let pool = pool(4);
        let first = pool.get_connection().await.unwrap();
        first.release().unwrap();
        let second = pool.get_connection().await.unwrap();
        assert_eq!(first, second);
        assert!(!first.holds_loan());
        assert!(second.holds_loan());
        assert!(matches!(first.release(), Err(DbError::ConnectionState { .. })));
        assert_eq!(second.state(), ConnectionState::Active);
        // Dropping the superseded value leaves the current loan alone.
        drop(first);
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn test_close_during_reuse_validation_closes_handle() {
        let pool = pool(1);
        let conn = pool.get_connection().await.unwrap();
        let handle = conn.handle().await.unwrap().clone();
        conn.release().unwrap();

        pool.driver().set_latency(Duration::from_millis(200));
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_connection().await.map(|c| c.id()) })
        };
        // Let the waiter pop the idle wrapper and start pinging it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close().await;

        assert!(matches!(waiter.await.unwrap(), Err(DbError::PoolClosed)));
        assert!(!handle.is_alive());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaves_pool_consistent() {
        let pool = pool(1);
        let held = pool.get_connection().await.unwrap();
        // Saturated: this acquisition waits and is dropped by the timeout.
        let waited =
            tokio::time::timeout(Duration::from_millis(50), pool.get_connection()).await;
        assert!(waited.is_err());
        held.release().unwrap();
        let again = pool.get_connection().await.unwrap();
        assert_eq!(again, held);
        assert_eq!(pool.size(), 1);
    }
}
