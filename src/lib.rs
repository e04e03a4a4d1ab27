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

//! A self-healing connection pool for Async Rust.
//!
//! The pool owns a bounded set of expensive, reusable connections and hands
//! them out under concurrency. When the pool is saturated, acquirers queue
//! first in, first out behind a hard bound: once the queue is full, further
//! acquires are rejected immediately instead of piling up latency. Two
//! background tasks keep the pool healthy over time, repairing or replacing
//! idle connections that fail their health checks and evicting connections
//! unused for too long, down to a configured floor.
//!
//! Connections are produced and serviced through the [`ManageConnection`]
//! trait; the pool never needs to know what a connection concretely is.
//!
//! # Example
//!
//! ```
//! use tendpool::ManageConnection;
//! use tendpool::Pool;
//! use tendpool::PoolConfig;
//!
//! struct Compute;
//! impl Compute {
//!     async fn do_work(&self) -> i32 {
//!         42
//!     }
//! }
//!
//! struct Manager;
//! impl ManageConnection for Manager {
//!     type Connection = Compute;
//!     type Error = std::io::Error;
//!
//!     async fn create(&self) -> Result<Self::Connection, Self::Error> {
//!         Ok(Compute)
//!     }
//!
//!     async fn is_healthy(&self, _conn: &mut Self::Connection) -> Result<bool, Self::Error> {
//!         Ok(true)
//!     }
//!
//!     async fn reset(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pool = Pool::new(PoolConfig::new(16), Manager).await;
//! let conn = pool.get().await.unwrap();
//! assert_eq!(conn.do_work().await, 42);
//! drop(conn);
//! pool.shutdown().await;
//! # }
//! ```

mod config;
mod error;
mod maintain;
mod manage;
mod mutex;
mod pool;
mod stats;

pub use config::PoolConfig;
pub use config::QueueStrategy;
pub use error::PoolError;
pub use manage::ConnState;
pub use manage::ConnStatus;
pub use manage::ManageConnection;
pub use pool::Pool;
pub use pool::PooledConn;
pub use stats::PoolStats;
