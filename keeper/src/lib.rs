//! # Keeper
//!
//! Purpose: Cache the results of async functions in a Redis-compatible store,
//! keyed by a function of their arguments, with pooled connections shared
//! per store address.
//!
//! ## Design Principles
//! 1. **Decorator Pattern**: `Keeper` wraps a function and keeps its signature.
//! 2. **Shared Pools**: `PoolRegistry` keeps one pool per address.
//! 3. **Explicit Teardown**: `PoolRegistry::shutdown_all` ends every pool;
//!    later calls through the decorator fail with `PoolError::Closed`.
//!
//! ## Example
//!
//! ```no_run
//! use keeper::{keep, KeeperConfig, KeeperOptions, TargetAddress};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = KeeperConfig::new(TargetAddress::default())
//!     .with_options(KeeperOptions::default().with_expire(60));
//! let profile = keep(
//!     config,
//!     |(id,): &(u64,)| format!("profile:{id}"),
//!     |(id,): (u64,)| async move { Ok::<_, anyhow::Error>(format!("user {id}")) },
//! );
//!
//! let name: String = profile.call((42,)).await?;
//! # let _ = name;
//! keeper::PoolRegistry::global().shutdown_all().await;
//! # Ok(())
//! # }
//! ```

pub mod decorator;
pub mod error;
pub mod registry;

pub use decorator::{is_nil_or_empty, keep, Keeper, KeeperConfig, KeeperOptions, KeyGenerator, WriteMode};
pub use error::{KeeperError, KeeperResult};
pub use registry::PoolRegistry;

pub use keeper_client::{ConnectionPool, PoolError, PoolSizing, StoreOptions, TargetAddress};
