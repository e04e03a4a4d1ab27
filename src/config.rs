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

use std::time::Duration;

/// Queue strategy when dequeuing idle connections from the pool.
///
/// This affects only the reuse order of the idle set. Queued acquirers are
/// always served first in, first out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueueStrategy {
    /// First in first out.
    ///
    /// This strategy behaves like a queue: the longest-idle connection is
    /// reused first.
    Fifo,
    /// Last in first out.
    ///
    /// This strategy behaves like a stack: the most recently returned
    /// connection is reused first, which lets stale connections age out at
    /// the bottom and be collected by the idle reaper.
    #[default]
    Lifo,
}

/// The configuration of [`Pool`](crate::Pool).
///
/// Set once at construction and read-only thereafter.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections the pool may hold, counting both idle
    /// and lent-out connections.
    pub max_connections: usize,

    /// Number of connections the pool tries to keep open. The pool pre-warms
    /// to this floor at construction and replenishes on the health-check
    /// tick; the idle reaper never shrinks the pool below it.
    pub min_connections: usize,

    /// Idle connections unused for longer than this are disconnected by the
    /// idle reaper, subject to the `min_connections` floor.
    pub idle_timeout: Duration,

    /// Maximum time an acquirer waits in the queue before failing with
    /// [`PoolError::Timeout`](crate::PoolError::Timeout).
    pub acquire_timeout: Duration,

    /// Interval between health-check passes over the idle set.
    pub health_check_interval: Duration,

    /// Number of consecutive health failures a connection may accumulate
    /// before it is removed from the pool.
    pub max_retries: u32,

    /// Delay before each reset attempt of an unhealthy connection.
    pub retry_delay: Duration,

    /// Maximum number of queued acquirers. An acquire that finds the pool
    /// saturated and the queue at this bound fails immediately with
    /// [`PoolError::Backpressure`](crate::PoolError::Backpressure).
    pub max_queue_size: usize,

    /// Whether to run a health check on an idle connection before handing it
    /// out. Unhealthy connections are discarded and replaced transparently.
    pub validate_before_use: bool,

    /// Maximum time a single connection attempt may take.
    pub connect_timeout: Duration,

    /// Queue strategy of the idle set.
    ///
    /// Determines the order of idle connections being queued and dequeued.
    pub queue_strategy: QueueStrategy,
}

impl PoolConfig {
    /// Creates a new [`PoolConfig`] with the given maximum pool size.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            min_connections: 0,
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_queue_size: 64,
            validate_before_use: true,
            connect_timeout: Duration::from_secs(10),
            queue_strategy: QueueStrategy::default(),
        }
    }

    /// Returns a new [`PoolConfig`] with the specified connection floor.
    pub fn with_min_connections(mut self, min_connections: usize) -> Self {
        self.min_connections = min_connections;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified acquire timeout.
    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified health-check interval.
    pub fn with_health_check_interval(mut self, health_check_interval: Duration) -> Self {
        self.health_check_interval = health_check_interval;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified retry delay.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified wait-queue bound.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Returns a new [`PoolConfig`] with validation on acquire enabled or
    /// disabled.
    pub fn with_validate_before_use(mut self, validate_before_use: bool) -> Self {
        self.validate_before_use = validate_before_use;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified queue strategy.
    pub fn with_queue_strategy(mut self, queue_strategy: QueueStrategy) -> Self {
        self.queue_strategy = queue_strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = PoolConfig::new(8)
            .with_min_connections(2)
            .with_acquire_timeout(Duration::from_millis(50))
            .with_max_queue_size(4)
            .with_validate_before_use(false)
            .with_queue_strategy(QueueStrategy::Fifo);

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
        assert_eq!(config.max_queue_size, 4);
        assert!(!config.validate_before_use);
        assert_eq!(config.queue_strategy, QueueStrategy::Fifo);
    }
}
