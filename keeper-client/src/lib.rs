//! # Keeper Store Client
//!
//! Purpose: Provide an async, pooled client for Redis-compatible stores:
//! bounded connection pools with prioritized queueing, sessions that
//! reconnect on their own, and typed string commands.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **RAII Borrowing**: A borrowed connection returns itself when dropped.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Example
//!
//! ```no_run
//! use keeper_client::{ConnectionPool, PoolOptions};
//!
//! # async fn demo() -> Result<(), keeper_client::PoolError> {
//! let pool = ConnectionPool::new(PoolOptions::from_host_and_port("127.0.0.1", 6379))?;
//! pool.set("greeting", "hello").await?;
//! assert_eq!(pool.get("greeting").await?.as_deref(), Some("hello"));
//! pool.end().await;
//! # Ok(())
//! # }
//! ```

mod commands;
pub mod connection;
pub mod error;
pub mod events;
pub mod pool;
pub mod resp;

pub use commands::StoreTtl;
pub use connection::{Connection, ConnectionState};
pub use error::{PoolError, PoolResult, StoreError, StoreResult};
pub use events::{ConnectionId, EventSink, PoolEvent};
pub use pool::{ConnectionPool, PoolOptions, PoolStatus, PooledConnection, DEFAULT_PRIORITY};
pub use resp::RespValue;

pub use keeper_common::{PoolSizing, RetryPolicy, StoreOptions, TargetAddress};
