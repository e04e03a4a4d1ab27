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

//! Background maintenance: the health checker and the idle reaper.
//!
//! Both loops run on their own interval, hold only a [`Weak`] reference to
//! the pool, and mutate pool state through the same lock discipline as
//! acquire and release. Each pass works on a snapshot drained from the idle
//! set at the start of the tick, so connections acquired mid-tick are never
//! touched and a connection can never be both under check and handed out.
//!
//! [`Weak`]: std::sync::Weak

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::ConnState;
use crate::ManageConnection;
use crate::manage::ConnEntry;
use crate::manage::ConnStatus;
use crate::pool::Pool;

/// Starts the health-check and idle-reaper loops for a freshly built pool.
///
/// The loops stop when the pool shuts down (via the shutdown latch) or when
/// the last user handle to the pool is dropped.
pub(crate) fn spawn_loops<M: ManageConnection>(pool: &Arc<Pool<M>>) {
    let health_interval = pool.config.health_check_interval;
    let weak = Arc::downgrade(pool);
    let latch = pool.shutdown_latch.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = latch.wait() => break,
                _ = tokio::time::sleep(health_interval) => {}
            }
            let Some(pool) = weak.upgrade() else { break };
            pool.run_health_checks().await;
        }
    });

    let reap_interval = pool.config.idle_timeout / 2;
    let weak = Arc::downgrade(pool);
    let latch = pool.shutdown_latch.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = latch.wait() => break,
                _ = tokio::time::sleep(reap_interval) => {}
            }
            let Some(pool) = weak.upgrade() else { break };
            pool.reap_idle_conns().await;
        }
    });
}

impl<M: ManageConnection> Pool<M> {
    /// Health-checks every idle connection and repairs or replaces the
    /// unhealthy ones.
    ///
    /// Runs periodically on `health_check_interval`; this method exposes the
    /// same pass for operational tooling. Healthy connections return to the
    /// pool as soon as they are checked. An unhealthy connection is reset
    /// after `retry_delay` and re-checked, up to `max_retries` consecutive
    /// failures; past that it is disconnected and, if the pool has fallen
    /// below `min_connections`, a replacement is created.
    pub async fn run_health_checks(self: &Arc<Self>) {
        let batch: Vec<ConnEntry<M::Connection>> = {
            let mut inner = self.inner.lock();
            if inner.is_shutdown {
                return;
            }
            let drained: Vec<ConnEntry<M::Connection>> = inner.idle.drain(..).collect();
            inner.checking += drained.len();
            drained
        };

        let mut failing = Vec::new();
        for mut entry in batch {
            match self.manager.is_healthy(&mut entry.conn).await {
                Ok(true) => {
                    entry.status.failures = 0;
                    self.return_checked(entry).await;
                }
                Ok(false) => failing.push(entry),
                Err(_) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.checking -= 1;
                        inner.counters.failed_connections += 1;
                    }
                    warn!(id = entry.status.id, "health check errored; removing connection");
                    self.destroy(entry).await;
                }
            }
        }

        for entry in failing {
            self.recover(entry).await;
        }

        self.replenish_to_min().await;
    }

    /// Evicts idle connections unused for longer than `idle_timeout`,
    /// keeping at least `min_connections` in the pool. Returns the number of
    /// connections evicted.
    ///
    /// Runs periodically on half the idle timeout; this method exposes the
    /// same pass for operational tooling.
    pub async fn reap_idle_conns(&self) -> usize {
        let removed = {
            let mut inner = self.inner.lock();
            if inner.is_shutdown {
                return 0;
            }
            let mut budget = inner.members().saturating_sub(self.config.min_connections);
            let idle_timeout = self.config.idle_timeout;
            drain_expired(&mut inner.idle, |status| {
                if budget == 0 || status.last_used.elapsed() < idle_timeout {
                    return false;
                }
                budget -= 1;
                true
            })
        };

        let count = removed.len();
        for entry in removed {
            debug!(
                id = entry.status.id,
                idle_for = ?entry.status.last_used.elapsed(),
                "reaping idle connection"
            );
            self.destroy(entry).await;
        }
        count
    }

    /// Tops the pool up to `min_connections`.
    ///
    /// New connections go to queued acquirers first. Stops at the first
    /// creation failure; the gap is left for the next tick instead of
    /// spinning on a failing factory.
    pub(crate) async fn replenish_to_min(self: &Arc<Self>) {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.is_shutdown || inner.members() >= self.config.min_connections {
                    return;
                }
                inner.connecting += 1;
            }
            if !self.create_and_dispatch().await {
                return;
            }
        }
    }

    /// Drives an unhealthy connection through the reset cycle.
    ///
    /// Each unhealthy observation counts one consecutive failure; once the
    /// count passes `max_retries` the connection is removed. A reset that
    /// brings the connection back to health clears the count.
    async fn recover(self: &Arc<Self>, mut entry: ConnEntry<M::Connection>) {
        let id = entry.status.id;
        loop {
            entry.status.failures += 1;
            self.inner.lock().counters.failed_connections += 1;
            if entry.status.failures > self.config.max_retries {
                warn!(
                    id,
                    failures = entry.status.failures,
                    "health retries exhausted; removing connection"
                );
                self.inner.lock().checking -= 1;
                self.destroy(entry).await;
                return;
            }

            entry.status.state = ConnState::Failed;
            tokio::time::sleep(self.config.retry_delay).await;
            entry.status.state = ConnState::Connecting;
            if self.manager.reset(&mut entry.conn).await.is_err() {
                debug!(id, "reset failed");
                continue;
            }
            match self.manager.is_healthy(&mut entry.conn).await {
                Ok(true) => {
                    entry.status.failures = 0;
                    debug!(id, "connection recovered after reset");
                    self.return_checked(entry).await;
                    return;
                }
                Ok(false) => {
                    debug!(id, "connection still unhealthy after reset");
                }
                Err(_) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.checking -= 1;
                        inner.counters.failed_connections += 1;
                    }
                    warn!(id, "health check errored; removing connection");
                    self.destroy(entry).await;
                    return;
                }
            }
        }
    }

    /// Puts a checked connection back into circulation, unless the pool shut
    /// down mid-check.
    async fn return_checked(self: &Arc<Self>, entry: ConnEntry<M::Connection>) {
        let leftover = {
            let mut inner = self.inner.lock();
            inner.checking -= 1;
            if inner.is_shutdown {
                Some(entry)
            } else {
                self.dispatch(&mut inner, entry);
                None
            }
        };
        if let Some(entry) = leftover {
            self.destroy(entry).await;
        }
    }
}

/// Moves every entry matching `expired` out of the deque, preserving the
/// order of the retained entries.
///
/// Entries are compacted in place with swaps and the expired tail is split
/// off, so the deque is never reallocated. The predicate sees each entry
/// exactly once, front to back.
fn drain_expired<C>(
    deque: &mut VecDeque<ConnEntry<C>>,
    mut expired: impl FnMut(&ConnStatus) -> bool,
) -> Vec<ConnEntry<C>> {
    let len = deque.len();
    let mut idx = 0;
    let mut cur = 0;

    // Stage 1: the leading run of retained entries stays put.
    while cur < len {
        if expired(&deque[cur].status) {
            cur += 1;
            break;
        }
        cur += 1;
        idx += 1;
    }

    // Stage 2: swap each later retained entry into the next retained slot.
    while cur < len {
        if expired(&deque[cur].status) {
            cur += 1;
            continue;
        }
        deque.swap(idx, cur);
        cur += 1;
        idx += 1;
    }

    // Stage 3: everything after the retained prefix is expired.
    deque.split_off(idx).into_iter().collect()
}
