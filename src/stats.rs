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

/// A point-in-time snapshot of pool state and lifetime counters.
///
/// See [`Pool::stats`](crate::Pool::stats).
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct PoolStats {
    /// Connections currently owned by the pool, idle and lent out alike.
    pub total_connections: usize,

    /// Connections held by the pool, available for reuse.
    pub idle_connections: usize,

    /// Connections currently lent out to callers.
    pub active_connections: usize,

    /// Acquirers currently waiting in the queue.
    pub pending_requests: usize,

    /// Failed connection attempts and failed health checks, lifetime.
    pub failed_connections: u64,

    /// Connections handed out, lifetime.
    pub total_acquired: u64,

    /// Connections returned by callers, lifetime.
    pub total_released: u64,

    /// Connections created, lifetime.
    pub total_created: u64,

    /// Connections removed from the pool, lifetime.
    pub total_destroyed: u64,

    /// Acquire attempts rejected because the wait queue was full, lifetime.
    pub queue_overflows: u64,
}

/// Lifetime counters, updated under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) failed_connections: u64,
    pub(crate) total_acquired: u64,
    pub(crate) total_released: u64,
    pub(crate) total_created: u64,
    pub(crate) total_destroyed: u64,
    pub(crate) queue_overflows: u64,
}
