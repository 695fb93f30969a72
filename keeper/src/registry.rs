//! # Pool Registry
//!
//! Purpose: Hand out one `ConnectionPool` per target address and keep it for
//! the life of the registry, so every cached function aimed at the same store
//! shares one bounded set of connections.
//!
//! ## Design Principles
//! 1. **Init on First Use**: A pool is built the first time its address is
//!    asked for, under the registry lock, so concurrent first calls agree.
//! 2. **Explicit Teardown**: Nothing is evicted; `shutdown_all` ends every
//!    pool in place, so later lookups get the closed pool back instead of a
//!    fresh one.
//! 3. **Process Scope**: `PoolRegistry::global()` is the shared instance;
//!    tests and embedders can build their own.

use std::collections::HashMap;
use std::sync::Arc;

use keeper_client::{ConnectionPool, PoolOptions, PoolResult};
use keeper_common::{PoolSizing, StoreOptions, TargetAddress};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

static GLOBAL: Lazy<PoolRegistry> = Lazy::new(|| {
    let sizing = PoolSizing::from_env().unwrap_or_else(|err| {
        warn!(error = %err, "invalid pool configuration in environment, using defaults");
        PoolSizing::default()
    });
    PoolRegistry::with_options(sizing, StoreOptions::default())
});

/// Address → pool map. Cloning shares the same map.
#[derive(Clone)]
pub struct PoolRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    pools: Mutex<HashMap<String, ConnectionPool>>,
    sizing: PoolSizing,
    store: StoreOptions,
}

impl PoolRegistry {
    /// A registry whose pools use the default sizing and store options.
    pub fn new() -> Self {
        Self::with_options(PoolSizing::default(), StoreOptions::default())
    }

    /// A registry whose pools are all built with `sizing` and `store`.
    pub fn with_options(sizing: PoolSizing, store: StoreOptions) -> Self {
        PoolRegistry {
            inner: Arc::new(RegistryInner {
                pools: Mutex::new(HashMap::new()),
                sizing,
                store,
            }),
        }
    }

    /// The process-wide registry, configured from `KEEPER_*` on first use.
    pub fn global() -> &'static PoolRegistry {
        &GLOBAL
    }

    pub fn sizing(&self) -> &PoolSizing {
        &self.inner.sizing
    }

    /// Returns the pool for `address` (a URL or `host[:port]`), creating it
    /// on first use.
    pub fn get_or_create(&self, address: &str) -> PoolResult<ConnectionPool> {
        let target: TargetAddress = address.parse()?;
        self.get_or_create_target(&target)
    }

    /// Returns the pool for `target`, creating it on first use.
    pub fn get_or_create_target(&self, target: &TargetAddress) -> PoolResult<ConnectionPool> {
        let key = target.registry_key();
        let mut pools = self.inner.pools.lock();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let options = PoolOptions::from_address(target.clone())
            .with_store_options(self.inner.store.clone())
            .with_sizing(self.inner.sizing);
        let pool = ConnectionPool::new(options)?;
        debug!(address = %key, "registered pool");
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// The registered pool for `target`, if any.
    pub fn get(&self, target: &TargetAddress) -> Option<ConnectionPool> {
        self.inner.pools.lock().get(&target.registry_key()).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ends every registered pool. The pools stay registered, so callers
    /// that look them up afterwards fail with `PoolError::Closed`.
    ///
    /// Each pool waits for its borrowed connections to come back before
    /// closing. Returns how many pools were ended.
    pub async fn shutdown_all(&self) -> usize {
        let pools: Vec<(String, ConnectionPool)> = self
            .inner
            .pools
            .lock()
            .iter()
            .map(|(address, pool)| (address.clone(), pool.clone()))
            .collect();
        let count = pools.len();
        for (address, pool) in pools {
            debug!(%address, "ending pool");
            pool.end().await;
        }
        info!(pools = count, "registry shut down");
        count
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_client::PoolError;

    fn registry() -> PoolRegistry {
        PoolRegistry::with_options(PoolSizing::default().with_min(0), StoreOptions::default())
    }

    #[tokio::test]
    async fn reuses_pool_per_address() {
        let registry = registry();
        let a = registry.get_or_create("127.0.0.1:7001").unwrap();
        let b = registry.get_or_create("127.0.0.1:7001").unwrap();
        let c = registry.get_or_create("127.0.0.1:7002").unwrap();

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(registry.len(), 2);

        let target = TargetAddress::from_host_and_port("127.0.0.1", 7001);
        assert!(registry.get(&target).unwrap().ptr_eq(&a));
        assert!(registry.get_or_create_target(&target).unwrap().ptr_eq(&a));
    }

    #[tokio::test]
    async fn url_and_host_port_are_distinct_keys() {
        let registry = registry();
        registry.get_or_create("redis://127.0.0.1:7001").unwrap();
        registry.get_or_create("127.0.0.1:7001").unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_builds_one_pool() {
        let registry = registry();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("127.0.0.1:7003").unwrap() })
            })
            .collect();

        let mut pools = Vec::new();
        for task in tasks {
            pools.push(task.await.unwrap());
        }
        assert_eq!(registry.len(), 1);
        assert!(pools.iter().all(|pool| pool.ptr_eq(&pools[0])));
    }

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let registry = registry();
        assert!(registry.get_or_create("ftp://127.0.0.1").is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_ends_every_pool() {
        let registry = registry();
        let a = registry.get_or_create("127.0.0.1:7004").unwrap();
        let b = registry.get_or_create("127.0.0.1:7005").unwrap();

        assert_eq!(registry.shutdown_all().await, 2);
        assert_eq!(registry.len(), 2);
        assert!(a.is_closed() && b.is_closed());

        let again = registry.get_or_create("127.0.0.1:7004").unwrap();
        assert!(again.ptr_eq(&a));
        assert!(matches!(again.acquire().await, Err(PoolError::Closed)));
        assert_eq!(registry.len(), 2);
    }
}
