//! # Cache-Aside Decorator
//!
//! Purpose: Turn any async function into a cached one. A call derives a key
//! from its arguments, returns the stored result when there is one, and
//! otherwise runs the function and stores what it produced.
//!
//! ## Design Principles
//! 1. **Decorator Pattern**: `Keeper` wraps the function without changing
//!    how it is called or what it returns.
//! 2. **Transparent Errors**: The function's own errors reach the caller
//!    untouched; cache-layer failures convert into the same error type.
//! 3. **Store-Owned Expiry**: TTLs live in the backing store only.
//!
//! ## Call Flow
//!
//! ```text
//! call(args)
//!   ├── pool  = registry[address]
//!   ├── key   = keygen(&args)
//!   ├── raw   = GET key
//!   ├── hit   → decode raw → return
//!   └── miss  → result = func(args)
//!               ├── non-empty → SETEX/SET key json (detached or awaited)
//!               └── return result
//! ```
//!
//! Concurrent misses on the same key each run the function and each write;
//! the last write wins.

use std::fmt;
use std::future::Future;

use keeper_client::{ConnectionPool, PoolResult};
use keeper_common::TargetAddress;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{KeeperError, KeeperResult};
use crate::registry::PoolRegistry;

/// When the write after a miss completes relative to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Spawn the write and return at once; failures are logged and dropped.
    #[default]
    Detached,
    /// Finish the write before returning; failures are returned.
    Awaited,
}

/// Per-decorator caching behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperOptions {
    /// Decode hits as JSON. When off, a hit returns the stored text itself.
    pub parse_json: bool,
    /// TTL in seconds for stored results; `0` stores without expiration.
    pub expire: u64,
    /// Always run the function, refreshing the stored result.
    pub ignore_cache: bool,
    pub write_mode: WriteMode,
}

impl Default for KeeperOptions {
    fn default() -> Self {
        KeeperOptions {
            parse_json: true,
            expire: 0,
            ignore_cache: false,
            write_mode: WriteMode::Detached,
        }
    }
}

impl KeeperOptions {
    pub fn with_parse_json(mut self, parse_json: bool) -> Self {
        self.parse_json = parse_json;
        self
    }

    pub fn with_expire(mut self, seconds: u64) -> Self {
        self.expire = seconds;
        self
    }

    pub fn with_ignore_cache(mut self, ignore_cache: bool) -> Self {
        self.ignore_cache = ignore_cache;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }
}

/// Where results are cached and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub address: TargetAddress,
    pub options: KeeperOptions,
}

impl KeeperConfig {
    pub fn new(address: TargetAddress) -> Self {
        KeeperConfig {
            address,
            options: KeeperOptions::default(),
        }
    }

    pub fn with_options(mut self, options: KeeperOptions) -> Self {
        self.options = options;
        self
    }
}

/// Derives the cache key for one call.
///
/// Must be deterministic: equal arguments produce equal keys.
pub trait KeyGenerator<A> {
    fn key(&self, args: &A) -> String;
}

impl<A, G> KeyGenerator<A> for G
where
    G: Fn(&A) -> String,
{
    fn key(&self, args: &A) -> String {
        self(args)
    }
}

/// A function wrapped with cache-aside behavior.
///
/// `call` takes the same argument tuple as the wrapped function.
pub struct Keeper<K, F> {
    config: KeeperConfig,
    keygen: K,
    func: F,
    registry: PoolRegistry,
}

/// Wraps `func` using the process-wide registry.
pub fn keep<K, F>(config: KeeperConfig, keygen: K, func: F) -> Keeper<K, F> {
    Keeper::new(config, keygen, func)
}

impl<K, F> Keeper<K, F> {
    pub fn new(config: KeeperConfig, keygen: K, func: F) -> Self {
        Self::with_registry(config, keygen, func, PoolRegistry::global().clone())
    }

    /// Wraps `func` with pools taken from `registry`.
    pub fn with_registry(config: KeeperConfig, keygen: K, func: F, registry: PoolRegistry) -> Self {
        Keeper {
            config,
            keygen,
            func,
            registry,
        }
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    /// Runs the wrapped function through the cache.
    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<T, E>
    where
        K: KeyGenerator<A>,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: From<KeeperError>,
    {
        let pool = self.pool().map_err(KeeperError::from)?;
        let key = self.keygen.key(&args);
        let raw = pool.get(&key).await.map_err(KeeperError::from)?;

        if !self.config.options.ignore_cache {
            if let Some(value) = self.decode_hit(&key, raw)? {
                trace!(%key, "cache hit");
                return Ok(value);
            }
        }

        debug!(%key, ignore_cache = self.config.options.ignore_cache, "cache miss");
        let result = (self.func)(args).await?;
        self.store(&pool, key, &result).await?;
        Ok(result)
    }

    fn pool(&self) -> PoolResult<ConnectionPool> {
        self.registry.get_or_create_target(&self.config.address)
    }

    /// Decodes a stored value; `None` means it counts as a miss.
    fn decode_hit<T: DeserializeOwned>(&self, key: &str, raw: Option<String>) -> KeeperResult<Option<T>> {
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(None),
        };
        let decode_error = |source| KeeperError::Decode {
            key: key.to_string(),
            source,
        };

        if !self.config.options.parse_json {
            return serde_json::from_value(Value::String(raw)).map(Some).map_err(decode_error);
        }
        let value: Value = serde_json::from_str(&raw).map_err(decode_error)?;
        if is_nil_or_empty(&value) {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some).map_err(decode_error)
    }

    /// Persists a non-empty result according to the write mode.
    async fn store<T: Serialize>(&self, pool: &ConnectionPool, key: String, result: &T) -> KeeperResult<()> {
        let options = &self.config.options;
        let value = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(source) if options.write_mode == WriteMode::Detached => {
                warn!(%key, error = %source, "result is not encodable, not cached");
                return Ok(());
            }
            Err(source) => return Err(KeeperError::Encode { key, source }),
        };
        if is_nil_or_empty(&value) {
            debug!(%key, "empty result, not cached");
            return Ok(());
        }

        let payload = value.to_string();
        let expire = options.expire;
        match options.write_mode {
            WriteMode::Awaited => write(pool, &key, expire, &payload).await.map_err(KeeperError::from),
            WriteMode::Detached => {
                let pool = pool.clone();
                tokio::spawn(async move {
                    if let Err(err) = write(&pool, &key, expire, &payload).await {
                        warn!(%key, error = %err, "cache write dropped");
                    }
                });
                Ok(())
            }
        }
    }
}

impl<K, F> fmt::Debug for Keeper<K, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keeper").field("config", &self.config).finish()
    }
}

async fn write(pool: &ConnectionPool, key: &str, expire: u64, payload: &str) -> PoolResult<()> {
    if expire > 0 {
        pool.setex(key, expire, payload).await
    } else {
        pool.set(key, payload).await
    }
}

/// Null, `""`, `[]` and `{}` are never cached and never count as hits.
pub fn is_nil_or_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
