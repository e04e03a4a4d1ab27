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

use std::future::Future;
use std::time::Instant;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Torn down; the terminal state of a destroyed connection.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Held by the pool, available for reuse.
    Idle,
    /// Lent out to a caller.
    InUse,
    /// Failed a health check; awaiting reset or removal.
    Failed,
}

/// Metadata the pool keeps next to each connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnStatus {
    pub(crate) id: u64,
    pub(crate) state: ConnState,
    pub(crate) created: Instant,
    pub(crate) last_used: Instant,
    pub(crate) failures: u32,
}

impl ConnStatus {
    pub(crate) fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnState::Idle,
            created: now,
            last_used: now,
            failures: 0,
        }
    }

    /// Returns the pool-unique identity of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the lifecycle state of this connection.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Returns the instant when this connection was created.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Returns the instant when this connection was last handed out or
    /// returned.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Returns the number of consecutive health failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// A connection paired with its pool metadata.
#[derive(Debug)]
pub(crate) struct ConnEntry<C> {
    pub(crate) conn: C,
    pub(crate) status: ConnStatus,
}

impl<C> ConnEntry<C> {
    pub(crate) fn new(id: u64, conn: C) -> Self {
        Self {
            conn,
            status: ConnStatus::new(id),
        }
    }
}

/// A trait whose instance creates, validates, repairs, and tears down the
/// connections managed by a [`Pool`](crate::Pool).
///
/// The pool owns connections exclusively and drives every lifecycle
/// transition through this trait; callers never invoke these operations
/// themselves.
pub trait ManageConnection: Send + Sync + 'static {
    /// The type of connections that this instance manages.
    type Connection: Send + 'static;

    /// The type of errors that this instance can return.
    type Error: Send;

    /// Creates a new, connected connection.
    fn create(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;

    /// Whether the connection is currently usable.
    ///
    /// Returns `Ok(false)` for a merely-unhealthy connection; the pool will
    /// try to repair it with [`reset`](ManageConnection::reset). Returning
    /// an error means the connection is beyond repair and the pool removes
    /// it outright.
    fn is_healthy(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Disconnects and reconnects the connection in one step.
    ///
    /// Used by the health checker to repair connections that reported
    /// unhealthy.
    fn reset(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Tears the connection down. Idempotent; must not fail.
    ///
    /// The default implementation does nothing, which suits connections that
    /// release their resources on drop.
    fn disconnect(&self, _conn: &mut Self::Connection) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}
