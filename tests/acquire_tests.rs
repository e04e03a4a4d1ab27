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

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tendpool::ManageConnection;
use tendpool::Pool;
use tendpool::PoolConfig;
use tendpool::PoolError;

/// Hands out `usize` connections numbered by creation order and counts
/// lifecycle events.
#[derive(Default)]
struct CountingManager {
    created: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
    /// While positive, `is_healthy` reports unhealthy and decrements.
    unhealthy_budget: Arc<AtomicUsize>,
}

impl ManageConnection for CountingManager {
    type Connection = usize;
    type Error = Infallible;

    async fn create(&self) -> Result<Self::Connection, Self::Error> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn is_healthy(&self, _conn: &mut Self::Connection) -> Result<bool, Self::Error> {
        if self.unhealthy_budget.load(Ordering::SeqCst) > 0 {
            self.unhealthy_budget.fetch_sub(1, Ordering::SeqCst);
            return Ok(false);
        }
        Ok(true)
    }

    async fn reset(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn disconnect(&self, _conn: &mut Self::Connection) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_prewarm_then_saturate_then_timeout() {
    let manager = CountingManager::default();
    let created = manager.created.clone();

    let config = PoolConfig::new(3)
        .with_min_connections(2)
        .with_max_queue_size(2)
        .with_acquire_timeout(Duration::from_millis(50))
        .with_validate_before_use(false);
    let pool = Pool::new(config, manager).await;

    assert_eq!(pool.stats().idle_connections, 2);
    assert_eq!(created.load(Ordering::SeqCst), 2);

    let c1 = pool.get().await.unwrap();
    let c2 = pool.get().await.unwrap();
    let c3 = pool.get().await.unwrap();

    // two pre-warmed connections reused, one created on demand
    assert_eq!(created.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().active_connections, 3);

    // the pool is at max; the fourth acquire queues and times out
    let err = pool.get().await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }));
    assert_eq!(pool.stats().pending_requests, 0, "timed-out entry must leave the queue");

    drop((c1, c2, c3));
}

#[tokio::test]
async fn test_creates_without_queueing_while_under_max() {
    let manager = CountingManager::default();
    let created = manager.created.clone();

    let config = PoolConfig::new(2).with_validate_before_use(false);
    let pool = Pool::new(config, manager).await;

    let c1 = pool.get().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().pending_requests, 0);

    let c2 = pool.get().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);

    drop((c1, c2));
    assert_eq!(pool.stats().idle_connections, 2);
}

#[tokio::test]
async fn test_release_hands_to_oldest_waiter() {
    let manager = CountingManager::default();
    let created = manager.created.clone();

    let config = PoolConfig::new(3)
        .with_max_queue_size(2)
        .with_acquire_timeout(Duration::from_secs(5))
        .with_validate_before_use(false);
    let pool = Pool::new(config, manager).await;

    let c1 = pool.get().await.unwrap();
    let c2 = pool.get().await.unwrap();
    let c3 = pool.get().await.unwrap();
    let (v1, v2) = (*c1, *c2);
    assert_eq!(created.load(Ordering::SeqCst), 3);

    let first = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().pending_requests, 2);

    // the released connection goes to the oldest waiter, not the idle set
    drop(c1);
    let got_first = first.await.unwrap();
    assert_eq!(*got_first, v1);
    assert!(!second.is_finished());

    drop(c2);
    let got_second = second.await.unwrap();
    assert_eq!(*got_second, v2);

    // waiters were served by releases, not by fresh connections
    assert_eq!(created.load(Ordering::SeqCst), 3);
    drop((got_first, got_second, c3));
}

#[tokio::test]
async fn test_backpressure_when_queue_full() {
    let manager = CountingManager::default();

    let config = PoolConfig::new(1)
        .with_max_queue_size(2)
        .with_acquire_timeout(Duration::from_secs(5))
        .with_validate_before_use(false);
    let pool = Pool::new(config, manager).await;

    let held = pool.get().await.unwrap();

    let first = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().pending_requests, 2);

    // saturated pool, full queue: rejected immediately, nothing enqueued
    let err = pool.get().await.unwrap_err();
    assert!(matches!(err, PoolError::Backpressure { pending: 2 }));
    assert_eq!(pool.stats().pending_requests, 2);
    assert_eq!(pool.stats().queue_overflows, 1);

    drop(held);
    let c = first.await.unwrap().unwrap();
    drop(c);
    let c = second.await.unwrap().unwrap();
    drop(c);
}

#[tokio::test]
async fn test_capacity_bound_under_concurrent_load() {
    const MAX_SIZE: usize = 4;
    const TASKS: usize = 12;
    const ROUNDS: usize = 20;

    let manager = CountingManager::default();
    let config = PoolConfig::new(MAX_SIZE)
        .with_max_queue_size(64)
        .with_validate_before_use(false);
    let pool = Pool::new(config, manager).await;

    let in_use = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let pool = pool.clone();
        let in_use = in_use.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let conn = pool.get().await.unwrap();
                let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(now <= MAX_SIZE, "more connections lent out than max_connections");
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_use.fetch_sub(1, Ordering::SeqCst);
                drop(conn);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.active_connections, 0);
    assert!(stats.total_connections <= MAX_SIZE);
    assert_eq!(stats.total_acquired, (TASKS * ROUNDS) as u64);
    assert_eq!(stats.total_released, (TASKS * ROUNDS) as u64);
}

#[tokio::test]
async fn test_validate_before_use_replaces_unhealthy_idle() {
    let manager = CountingManager::default();
    let created = manager.created.clone();
    let disconnected = manager.disconnected.clone();
    let unhealthy_budget = manager.unhealthy_budget.clone();

    let config = PoolConfig::new(2).with_min_connections(1);
    let pool = Pool::new(config, manager).await;
    assert_eq!(created.load(Ordering::SeqCst), 1);

    unhealthy_budget.store(1, Ordering::SeqCst);
    let conn = pool.get().await.unwrap();

    // the pre-warmed connection failed validation and was replaced
    assert_eq!(*conn, 1);
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.failed_connections, 1);
    assert_eq!(stats.total_destroyed, 1);
    drop(conn);
}

#[tokio::test]
async fn test_with_conn_returns_connection_on_exit() {
    let manager = CountingManager::default();
    let config = PoolConfig::new(2).with_validate_before_use(false);
    let pool = Pool::new(config, manager).await;

    let out = pool.with_conn(async |conn: &mut usize| *conn + 10).await.unwrap();
    assert_eq!(out, 10);

    let stats = pool.stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.total_acquired, 1);
    assert_eq!(stats.total_released, 1);
}

#[tokio::test]
async fn test_detach_removes_connection_from_pool() {
    let manager = CountingManager::default();
    let created = manager.created.clone();

    let config = PoolConfig::new(2).with_validate_before_use(false);
    let pool = Pool::new(config, manager).await;

    let conn = pool.get().await.unwrap();
    let raw = conn.detach();
    assert_eq!(raw, 0);

    let stats = pool.stats();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.total_destroyed, 1);

    // the pool creates a fresh connection for the next acquire
    let conn = pool.get().await.unwrap();
    assert_eq!(*conn, 1);
    assert_eq!(created.load(Ordering::SeqCst), 2);
    drop(conn);
}
