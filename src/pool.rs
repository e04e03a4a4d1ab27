// Copyright 2025 FastLabs Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The connection pool core.
//!
//! The pool holds an idle set, an active set, and a bounded FIFO wait queue,
//! all behind one mutex. Acquisition pops an idle connection, creates a new
//! one while under the size bound, or queues the acquirer; once the queue is
//! at its bound, further acquires are rejected immediately. Returning a
//! connection prefers the oldest queued acquirer over the idle set, so a
//! release while acquirers are queued never exposes the connection to a
//! concurrent [`Pool::get`] racing past the queue.
//!
//! Typically the pool is used wrapped in an [`Arc`]. Background maintenance
//! holds only a [`Weak`] reference, so dropping the last user handle tears
//! the maintenance tasks down with the pool.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use mea::latch::Latch;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::ConnState;
use crate::ConnStatus;
use crate::ManageConnection;
use crate::PoolConfig;
use crate::PoolError;
use crate::PoolStats;
use crate::QueueStrategy;
use crate::manage::ConnEntry;
use crate::mutex::Mutex;
use crate::stats::Counters;

/// The reply a queued acquirer receives: a ready connection, or the error
/// that removed it from the queue.
type WaitReply<M> = Result<PooledConn<M>, PoolError<<M as ManageConnection>::Error>>;

/// A pending acquirer.
///
/// An entry stays in the queue until exactly one of hand-off, timeout, or
/// shutdown settles it. Hand-off and queue removal happen under the pool
/// lock, so a timer firing after resolution finds the entry gone and picks
/// the reply out of the channel instead.
struct Waiter<M: ManageConnection> {
    id: u64,
    tx: oneshot::Sender<WaitReply<M>>,
    enqueued_at: Instant,
}

/// Pool bookkeeping, protected by one mutex and never held across awaits.
pub(crate) struct Inner<M: ManageConnection> {
    pub(crate) idle: VecDeque<ConnEntry<M::Connection>>,
    pub(crate) active: HashSet<u64>,
    waiting: VecDeque<Waiter<M>>,
    /// Reserved slots for connection attempts in flight.
    pub(crate) connecting: usize,
    /// Connections drained by an in-flight health pass; still pool members.
    pub(crate) checking: usize,
    pub(crate) is_shutdown: bool,
    pub(crate) counters: Counters,
}

impl<M: ManageConnection> Inner<M> {
    /// Connections the pool is responsible for, counting in-flight creations
    /// and connections under health check.
    pub(crate) fn members(&self) -> usize {
        self.idle.len() + self.active.len() + self.connecting + self.checking
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        // The expiring waiter is usually at or near the front.
        match self.waiting.iter().position(|waiter| waiter.id == id) {
            Some(idx) => {
                self.waiting.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// What an acquire found under the lock.
enum Available<C> {
    Reuse(ConnEntry<C>),
    Create,
    Queue,
}

/// Generic self-healing connection pool.
///
/// See the [module level documentation](self) for more.
pub struct Pool<M: ManageConnection> {
    pub(crate) config: PoolConfig,
    pub(crate) manager: M,

    next_conn_id: AtomicU64,
    next_waiter_id: AtomicU64,
    /// Counted down once at shutdown; stops both maintenance loops.
    pub(crate) shutdown_latch: Arc<Latch>,
    pub(crate) inner: Mutex<Inner<M>>,
}

impl<M: ManageConnection> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Creates a new [`Pool`], pre-warms it to `min_connections`, and starts
    /// the health-check and idle-reaper loops.
    ///
    /// Pre-warm failures are absorbed: the pool comes up with whatever the
    /// factory could produce and the health-check tick fills the gap later.
    pub async fn new(config: PoolConfig, manager: M) -> Arc<Self> {
        assert!(config.max_connections > 0, "max_connections must be positive");
        assert!(
            config.min_connections <= config.max_connections,
            "min_connections ({}) must not exceed max_connections ({})",
            config.min_connections,
            config.max_connections,
        );

        let pool = Arc::new(Self {
            manager,
            next_conn_id: AtomicU64::new(0),
            next_waiter_id: AtomicU64::new(0),
            shutdown_latch: Arc::new(Latch::new(1)),
            inner: Mutex::new(Inner {
                idle: VecDeque::with_capacity(config.max_connections),
                active: HashSet::with_capacity(config.max_connections),
                waiting: VecDeque::new(),
                connecting: 0,
                checking: 0,
                is_shutdown: false,
                counters: Counters::default(),
            }),
            config,
        });

        pool.replenish_to_min().await;
        crate::maintain::spawn_loops(&pool);
        pool
    }

    /// Retrieves a connection from this [`Pool`].
    ///
    /// Reuses an idle connection when one is available (validated first if
    /// `validate_before_use` is set), creates a new one while the pool is
    /// under `max_connections`, and otherwise waits in the FIFO queue up to
    /// `acquire_timeout`. A saturated pool with a full queue rejects the
    /// call immediately with [`PoolError::Backpressure`] instead of queuing.
    pub async fn get(self: &Arc<Self>) -> Result<PooledConn<M>, PoolError<M::Error>> {
        let started = Instant::now();

        let create_err = loop {
            let available = {
                let mut inner = self.inner.lock();
                if inner.is_shutdown {
                    return Err(PoolError::Shutdown);
                }
                let existing = match self.config.queue_strategy {
                    QueueStrategy::Fifo => inner.idle.pop_front(),
                    QueueStrategy::Lifo => inner.idle.pop_back(),
                };
                match existing {
                    Some(entry) => {
                        inner.active.insert(entry.status.id);
                        Available::Reuse(entry)
                    }
                    None if inner.members() < self.config.max_connections => {
                        inner.connecting += 1;
                        Available::Create
                    }
                    None => Available::Queue,
                }
            };

            match available {
                Available::Reuse(entry) => {
                    let mut unready = UnreadyConn {
                        entry: Some(entry),
                        pool: Arc::downgrade(self),
                    };
                    if self.config.validate_before_use {
                        let conn = unready.entry_mut();
                        if !matches!(self.manager.is_healthy(&mut conn.conn).await, Ok(true)) {
                            let entry = unready.take_failed();
                            debug!(id = entry.status.id, "discarding unhealthy idle connection");
                            self.destroy(entry).await;
                            continue;
                        }
                    }
                    return Ok(self.lend(unready.ready()));
                }
                Available::Create => match self.create_conn().await {
                    Ok(conn) => {
                        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        let entry = ConnEntry::new(id, conn);
                        let mut inner = self.inner.lock();
                        inner.connecting -= 1;
                        inner.counters.total_created += 1;
                        if inner.is_shutdown {
                            drop(inner);
                            self.discard(entry);
                            return Err(PoolError::Shutdown);
                        }
                        inner.active.insert(id);
                        drop(inner);
                        return Ok(self.lend(entry));
                    }
                    // creation failures are absorbed by queueing when the
                    // queue has room; the error surfaces only when it does
                    // not
                    Err(err) => break Some(err),
                },
                Available::Queue => break None,
            }
        };

        self.wait_for_conn(started, create_err).await
    }

    /// Acquires a connection, runs `f` on it, and returns the connection to
    /// the pool on every exit path, including panics unwinding out of `f`.
    pub async fn with_conn<F, R>(self: &Arc<Self>, f: F) -> Result<R, PoolError<M::Error>>
    where
        F: AsyncFnOnce(&mut M::Connection) -> R,
    {
        let mut conn = self.get().await?;
        Ok(f(&mut *conn).await)
    }

    /// Shuts the pool down.
    ///
    /// Every queued acquirer is rejected with [`PoolError::Shutdown`], both
    /// maintenance loops stop, and every idle connection is disconnected.
    /// Lent-out connections are disconnected as their guards drop. Further
    /// [`Pool::get`] calls fail with [`PoolError::Shutdown`]. Calling this
    /// twice is a no-op.
    pub async fn shutdown(&self) {
        let (waiters, idles) = {
            let mut inner = self.inner.lock();
            if inner.is_shutdown {
                return;
            }
            inner.is_shutdown = true;
            let waiters = inner.waiting.drain(..).collect::<Vec<_>>();
            let idles = inner.idle.drain(..).collect::<Vec<_>>();
            (waiters, idles)
        };

        self.shutdown_latch.count_down();

        info!(
            rejected = waiters.len(),
            disconnecting = idles.len(),
            "pool shutting down"
        );
        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::Shutdown));
        }
        for entry in idles {
            self.destroy(entry).await;
        }
    }

    /// Returns a point-in-time snapshot of pool state and lifetime counters.
    ///
    /// The snapshot is taken under the pool lock and internally consistent,
    /// but may be stale by the time the caller reads it.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            total_connections: inner.idle.len() + inner.active.len() + inner.checking,
            idle_connections: inner.idle.len(),
            active_connections: inner.active.len(),
            pending_requests: inner.waiting.len(),
            failed_connections: inner.counters.failed_connections,
            total_acquired: inner.counters.total_acquired,
            total_released: inner.counters.total_released,
            total_created: inner.counters.total_created,
            total_destroyed: inner.counters.total_destroyed,
            queue_overflows: inner.counters.queue_overflows,
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn wait_for_conn(
        self: &Arc<Self>,
        started: Instant,
        create_err: Option<PoolError<M::Error>>,
    ) -> Result<PooledConn<M>, PoolError<M::Error>> {
        let (tx, mut rx) = oneshot::channel();
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);

        let try_create = {
            let mut inner = self.inner.lock();
            if inner.is_shutdown {
                return Err(PoolError::Shutdown);
            }
            if inner.waiting.len() >= self.config.max_queue_size {
                inner.counters.queue_overflows += 1;
                let pending = inner.waiting.len();
                drop(inner);
                warn!(pending, "wait queue full; rejecting acquire");
                return Err(match create_err {
                    Some(err) => err,
                    None => PoolError::Backpressure { pending },
                });
            }
            inner.waiting.push_back(Waiter {
                id: waiter_id,
                tx,
                enqueued_at: started,
            });
            // A slot may have freed between the saturation check and this
            // lock; start one creation so the queue drains even if no
            // release arrives.
            if inner.members() < self.config.max_connections {
                inner.connecting += 1;
                true
            } else {
                false
            }
        };

        if try_create {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.create_and_dispatch().await;
            });
        }

        let remaining = self.config.acquire_timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(PoolError::Shutdown),
            Err(_) => {
                let elapsed = started.elapsed();
                let mut inner = self.inner.lock();
                if inner.remove_waiter(waiter_id) {
                    drop(inner);
                    debug!(waited = ?elapsed, "queued acquire timed out");
                    Err(PoolError::Timeout { elapsed })
                } else {
                    // The hand-off won the race against the timer: the entry
                    // is out of the queue and the reply is already in the
                    // channel.
                    drop(inner);
                    match rx.try_recv() {
                        Ok(reply) => reply,
                        Err(_) => Err(PoolError::Timeout { elapsed }),
                    }
                }
            }
        }
    }

    /// Creates one connection within `connect_timeout`.
    ///
    /// The caller must have reserved a `connecting` slot. The reservation is
    /// released if creation fails or this future is dropped mid-create; on
    /// success the caller folds the release into its own bookkeeping.
    async fn create_conn(&self) -> Result<M::Connection, PoolError<M::Error>> {
        let rollback = scopeguard::guard((), |()| {
            self.inner.lock().connecting -= 1;
        });
        match tokio::time::timeout(self.config.connect_timeout, self.manager.create()).await {
            Ok(Ok(conn)) => {
                scopeguard::ScopeGuard::into_inner(rollback);
                Ok(conn)
            }
            Ok(Err(err)) => {
                self.inner.lock().counters.failed_connections += 1;
                warn!("connection factory failed");
                Err(PoolError::Create(err))
            }
            Err(_) => {
                self.inner.lock().counters.failed_connections += 1;
                warn!(timeout = ?self.config.connect_timeout, "connection attempt timed out");
                Err(PoolError::ConnectTimeout(self.config.connect_timeout))
            }
        }
    }

    /// Creates one connection and routes it to the oldest queued acquirer,
    /// falling back to the idle set. Returns whether creation succeeded.
    ///
    /// The caller must have reserved a `connecting` slot.
    pub(crate) async fn create_and_dispatch(self: &Arc<Self>) -> bool {
        match self.create_conn().await {
            Ok(conn) => {
                let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                let entry = ConnEntry::new(id, conn);
                let mut inner = self.inner.lock();
                inner.connecting -= 1;
                inner.counters.total_created += 1;
                if inner.is_shutdown {
                    drop(inner);
                    self.discard(entry);
                } else {
                    self.dispatch(&mut inner, entry);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Routes a connection to the oldest live queued acquirer, or parks it
    /// in the idle set when no acquirer is waiting.
    ///
    /// Called with the pool lock held, so the hand-off is atomic with the
    /// queue removal: a connection given to a waiter never becomes visible
    /// to a concurrent [`Pool::get`].
    pub(crate) fn dispatch(self: &Arc<Self>, inner: &mut Inner<M>, mut entry: ConnEntry<M::Connection>) {
        let id = entry.status.id;
        while let Some(waiter) = inner.waiting.pop_front() {
            entry.status.state = ConnState::InUse;
            entry.status.last_used = Instant::now();
            let conn = PooledConn {
                entry: Some(entry),
                pool: Arc::downgrade(self),
            };
            match waiter.tx.send(Ok(conn)) {
                Ok(()) => {
                    inner.active.insert(id);
                    inner.counters.total_acquired += 1;
                    debug!(
                        id,
                        waited = ?waiter.enqueued_at.elapsed(),
                        "connection handed to queued acquirer"
                    );
                    return;
                }
                Err(reply) => {
                    // The waiter was cancelled; reclaim the connection and
                    // try the next one.
                    let mut conn = match reply {
                        Ok(conn) => conn,
                        Err(_) => unreachable!("hand-off reply is always Ok"),
                    };
                    // SAFETY: `entry` is always `Some` until the guard is consumed.
                    entry = conn.entry.take().unwrap();
                }
            }
        }
        entry.status.state = ConnState::Idle;
        inner.idle.push_back(entry);
    }

    /// Takes a connection back from a guard.
    fn checkin(self: &Arc<Self>, mut entry: ConnEntry<M::Connection>) {
        let mut inner = self.inner.lock();
        if !inner.active.remove(&entry.status.id) {
            drop(inner);
            warn!(
                id = entry.status.id,
                "returned connection is not lent out by this pool; ignoring"
            );
            return;
        }
        inner.counters.total_released += 1;
        if inner.is_shutdown {
            drop(inner);
            self.discard(entry);
            return;
        }
        entry.status.last_used = Instant::now();
        self.dispatch(&mut inner, entry);
    }

    /// Removes a lent-out connection from pool accounting without tearing it
    /// down; ownership passes to the caller.
    fn detach_conn(self: &Arc<Self>, status: &ConnStatus) {
        let replace = {
            let mut inner = self.inner.lock();
            inner.active.remove(&status.id);
            inner.counters.total_destroyed += 1;
            // Queued acquirers were counting on the detached connection's
            // slot; start a replacement for them.
            if !inner.is_shutdown
                && !inner.waiting.is_empty()
                && inner.members() < self.config.max_connections
            {
                inner.connecting += 1;
                true
            } else {
                false
            }
        };
        if replace {
            let pool = Arc::clone(self);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        pool.create_and_dispatch().await;
                    });
                }
                Err(_) => {
                    self.inner.lock().connecting -= 1;
                }
            }
        }
    }

    /// Tears a connection down in the background, for call sites that cannot
    /// await.
    pub(crate) fn discard(self: &Arc<Self>, entry: ConnEntry<M::Connection>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move {
                    pool.destroy(entry).await;
                });
            }
            Err(_) => {
                // No runtime left; account for the removal and let drop glue
                // release whatever the connection holds.
                warn!(
                    id = entry.status.id,
                    "no runtime at teardown; dropping connection without disconnect"
                );
                self.inner.lock().counters.total_destroyed += 1;
            }
        }
    }

    /// Disconnects a connection already removed from the idle/active sets.
    pub(crate) async fn destroy(&self, mut entry: ConnEntry<M::Connection>) {
        self.manager.disconnect(&mut entry.conn).await;
        entry.status.state = ConnState::Disconnected;
        self.inner.lock().counters.total_destroyed += 1;
        debug!(id = entry.status.id, "connection destroyed");
    }

    fn lend(self: &Arc<Self>, mut entry: ConnEntry<M::Connection>) -> PooledConn<M> {
        entry.status.state = ConnState::InUse;
        entry.status.last_used = Instant::now();
        self.inner.lock().counters.total_acquired += 1;
        PooledConn {
            entry: Some(entry),
            pool: Arc::downgrade(self),
        }
    }
}

/// A connection borrowed from the pool.
///
/// This guard implements [`Deref`] and [`DerefMut`]; use it as if it were
/// the connection itself.
///
/// Dropping the guard returns the connection to the pool: the oldest queued
/// acquirer receives it directly, otherwise it joins the idle set. A caller
/// that hit a fault on the connection should call [`PooledConn::detach`]
/// instead of returning a broken connection for reuse.
pub struct PooledConn<M: ManageConnection> {
    entry: Option<ConnEntry<M::Connection>>,
    pool: Weak<Pool<M>>,
}

impl<M> fmt::Debug for PooledConn<M>
where
    M: ManageConnection,
    M::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn").field("entry", &self.entry).finish()
    }
}

impl<M: ManageConnection> Drop for PooledConn<M> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.checkin(entry);
            }
        }
    }
}

impl<M: ManageConnection> Deref for PooledConn<M> {
    type Target = M::Connection;
    fn deref(&self) -> &M::Connection {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        &self.entry.as_ref().unwrap().conn
    }
}

impl<M: ManageConnection> DerefMut for PooledConn<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        &mut self.entry.as_mut().unwrap().conn
    }
}

impl<M: ManageConnection> AsRef<M::Connection> for PooledConn<M> {
    fn as_ref(&self) -> &M::Connection {
        self
    }
}

impl<M: ManageConnection> AsMut<M::Connection> for PooledConn<M> {
    fn as_mut(&mut self) -> &mut M::Connection {
        self
    }
}

impl<M: ManageConnection> PooledConn<M> {
    /// Detaches the connection from the [`Pool`].
    ///
    /// This reduces the size of the pool by one; the pool replenishes the
    /// gap through its maintenance tick, or immediately when acquirers are
    /// queued. This is the right call when the connection returned a fault
    /// and should not be reused.
    pub fn detach(mut self) -> M::Connection {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        let entry = self.entry.take().unwrap();
        if let Some(pool) = self.pool.upgrade() {
            pool.detach_conn(&entry.status);
        }
        entry.conn
    }

    /// Returns the status of the connection.
    pub fn status(&self) -> ConnStatus {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        self.entry.as_ref().unwrap().status
    }
}

/// A popped idle connection that is not yet validated.
///
/// If validation passes, the connection is converted to a ready
/// [`PooledConn`] via `ready()`. If validation fails, `take_failed()`
/// removes it from pool accounting for teardown. If dropped without either
/// (the acquiring future was cancelled mid-validation), the connection is
/// removed from the pool and torn down in the background.
struct UnreadyConn<M: ManageConnection> {
    entry: Option<ConnEntry<M::Connection>>,
    pool: Weak<Pool<M>>,
}

impl<M: ManageConnection> Drop for UnreadyConn<M> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.inner.lock().active.remove(&entry.status.id);
                pool.discard(entry);
            }
        }
    }
}

impl<M: ManageConnection> UnreadyConn<M> {
    fn ready(mut self) -> ConnEntry<M::Connection> {
        // SAFETY: `entry` is always `Some` while `UnreadyConn` is owned.
        self.entry.take().unwrap()
    }

    fn take_failed(mut self) -> ConnEntry<M::Connection> {
        // SAFETY: `entry` is always `Some` while `UnreadyConn` is owned.
        let entry = self.entry.take().unwrap();
        if let Some(pool) = self.pool.upgrade() {
            let mut inner = pool.inner.lock();
            inner.active.remove(&entry.status.id);
            inner.counters.failed_connections += 1;
        }
        entry
    }

    fn entry_mut(&mut self) -> &mut ConnEntry<M::Connection> {
        // SAFETY: `entry` is always `Some` while `UnreadyConn` is owned.
        self.entry.as_mut().unwrap()
    }
}
