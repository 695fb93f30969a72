//! # In-Memory Store
//!
//! Provide the string keyspace behind the server: sharded locking, TTL-aware
//! lookups, and integer counters.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **TTL Fast Path**: Expiration is checked on access for O(1) reads.
//! 3. **Arc-backed Buffers**: Values are `Arc<[u8]>` so reads never copy.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryStore
//!   └── shards: Vec<RwLock<HashMap<Arc<[u8]>, Entry>>>
//!         └── Entry { value, expires_at }
//! ```

use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use thiserror::Error;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Result type for store operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Key is missing or already expired.
    #[error("no such key")]
    NotFound,
    /// Stored value is not a base-10 signed 64-bit integer.
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    /// Increment would overflow.
    #[error("increment or decrement would overflow")]
    Overflow,
}

/// TTL state for a key, mirroring Redis `TTL` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    Missing,
    NoExpiry,
    ExpiresIn(Duration),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Arc<[u8]>,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

type Shard = RwLock<HashMap<Arc<[u8]>, Entry, RandomState>>;

/// Sharded in-memory keyspace.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    hash_state: RandomState,
}

impl MemoryStore {
    /// Creates a store with a shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a store with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::with_hasher(hash_state.clone())))
            .collect();
        MemoryStore {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    /// Looks up a live value.
    ///
    /// Expired entries are removed on access.
    pub fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        let now = Instant::now();
        let shard = self.shard_for(key);
        {
            let map = shard.read();
            match map.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(Arc::clone(&entry.value)),
                Some(_) => {}
            }
        }
        remove_if_expired(&mut shard.write(), key, now);
        None
    }

    /// Inserts or replaces a value and clears any TTL.
    pub fn set(&self, key: &[u8], value: &[u8]) {
        self.put(key, value, None);
    }

    /// Inserts or replaces a value that expires after `ttl`.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) {
        self.put(key, value, Some(Instant::now() + ttl));
    }

    /// Deletes a key and returns whether a live entry was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        match self.shard_for(key).write().remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// True when the key holds a live value.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Sets a TTL for an existing key.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> EngineResult<()> {
        let now = Instant::now();
        let mut map = self.shard_for(key).write();
        if remove_if_expired(&mut map, key, now) {
            return Err(EngineError::NotFound);
        }
        let entry = map.get_mut(key).ok_or(EngineError::NotFound)?;
        entry.expires_at = Some(now + ttl);
        Ok(())
    }

    /// Returns TTL state for a key.
    pub fn ttl(&self, key: &[u8]) -> TtlStatus {
        let now = Instant::now();
        let mut map = self.shard_for(key).write();
        if remove_if_expired(&mut map, key, now) {
            return TtlStatus::Missing;
        }
        match map.get(key) {
            None => TtlStatus::Missing,
            Some(Entry { expires_at: None, .. }) => TtlStatus::NoExpiry,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => TtlStatus::ExpiresIn(deadline.saturating_duration_since(now)),
        }
    }

    /// Adds `delta` to an integer value, starting from 0 when missing.
    ///
    /// An existing TTL is kept.
    pub fn incr_by(&self, key: &[u8], delta: i64) -> EngineResult<i64> {
        let now = Instant::now();
        let mut map = self.shard_for(key).write();
        remove_if_expired(&mut map, key, now);

        let (current, expires_at) = match map.get(key) {
            Some(entry) => (parse_i64(&entry.value)?, entry.expires_at),
            None => (0, None),
        };
        let next = current.checked_add(delta).ok_or(EngineError::Overflow)?;
        map.insert(
            Arc::from(key),
            Entry {
                value: Arc::from(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(next)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| shard.read().values().filter(|entry| !entry.is_expired(now)).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every key.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    /// Removes expired entries across all shards.
    ///
    /// This is an O(n) scan intended for a periodic background sweep.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.write();
            let before = map.len();
            map.retain(|_, entry| !entry.is_expired(now));
            removed += before - map.len();
        }
        removed
    }

    fn put(&self, key: &[u8], value: &[u8], expires_at: Option<Instant>) {
        let entry = Entry {
            value: Arc::from(value),
            expires_at,
        };
        self.shard_for(key).write().insert(Arc::from(key), entry);
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops `key` when it has expired. Returns true when something was dropped.
fn remove_if_expired(map: &mut HashMap<Arc<[u8]>, Entry, RandomState>, key: &[u8], now: Instant) -> bool {
    let expired = map.get(key).map(|entry| entry.is_expired(now)).unwrap_or(false);
    if expired {
        map.remove(key);
    }
    expired
}

fn parse_i64(value: &[u8]) -> EngineResult<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(EngineError::NotAnInteger)
}
