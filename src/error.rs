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

/// The error returned by [`Pool::get`](crate::Pool::get) and
/// [`Pool::with_conn`](crate::Pool::with_conn).
///
/// Connection-level faults (failed validation, failed health checks, failed
/// resets) are absorbed by the pool and never surface here; only admission
/// control failures and unrecoverable creation failures reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    /// The connection factory failed and no queue slot was available to ride
    /// out the failure.
    #[error("connection factory failed")]
    Create(E),

    /// A connection attempt exceeded the configured connect timeout.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The pool is saturated and the wait queue is at its bound. The request
    /// was rejected immediately without queuing.
    #[error("wait queue is full ({pending} pending acquirers)")]
    Backpressure {
        /// Number of acquirers queued when the request was rejected.
        pending: usize,
    },

    /// The acquirer waited in the queue past the acquire timeout.
    #[error("acquire timed out after {elapsed:?}")]
    Timeout {
        /// Total time spent waiting for a connection.
        elapsed: Duration,
    },

    /// The pool has shut down. Pending and subsequent acquires all fail with
    /// this error.
    #[error("pool is shut down")]
    Shutdown,
}
