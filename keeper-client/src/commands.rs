//! # Typed Commands
//!
//! Purpose: Expose the string commands the cache layer needs as typed calls,
//! both on a single borrowed `Connection` and as one-shot calls on the pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: Pool-level calls borrow, run one command, and return
//!    the connection, so callers never touch pooling for simple work.
//! 2. **Fail Fast**: Server error replies and mistyped replies surface as
//!    errors; nothing is coerced.
//! 3. **Borrow-Friendly API**: Keys and values are taken as `&str`.

use std::time::Duration;

use crate::connection::{expect_ok, Connection};
use crate::error::{PoolError, PoolResult, StoreError, StoreResult};
use crate::pool::ConnectionPool;
use crate::resp::RespValue;

/// TTL state reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl Connection {
    /// Fetches a value. `Ok(None)` when the key is missing.
    pub async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        match self.query(&["GET", key]).await?.into_result()? {
            RespValue::Bulk(data) => data.map(into_string).transpose(),
            _ => Err(StoreError::UnexpectedResponse("GET")),
        }
    }

    /// Stores a value without expiration.
    pub async fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        expect_ok(self.query(&["SET", key, value]).await?, "SET")
    }

    /// Stores a value that expires after `seconds` (`SET key value EX n`).
    pub async fn set_with_seconds(&mut self, key: &str, value: &str, seconds: u64) -> StoreResult<()> {
        let seconds = seconds.to_string();
        expect_ok(self.query(&["SET", key, value, "EX", seconds.as_str()]).await?, "SET")
    }

    /// Stores a value that expires after `seconds` (`SETEX key n value`).
    pub async fn setex(&mut self, key: &str, seconds: u64, value: &str) -> StoreResult<()> {
        let seconds = seconds.to_string();
        expect_ok(self.query(&["SETEX", key, seconds.as_str(), value]).await?, "SETEX")
    }

    /// Deletes keys. Returns how many existed.
    pub async fn del<K: AsRef<str>>(&mut self, keys: &[K]) -> StoreResult<i64> {
        let args = with_keys("DEL", keys);
        integer_reply(self.query(args.as_slice()).await?, "DEL")
    }

    /// Fetches several values; missing keys come back as `None`.
    pub async fn mget<K: AsRef<str>>(&mut self, keys: &[K]) -> StoreResult<Vec<Option<String>>> {
        let args = with_keys("MGET", keys);
        match self.query(args.as_slice()).await?.into_result()? {
            RespValue::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::Bulk(data) => data.map(into_string).transpose(),
                    _ => Err(StoreError::UnexpectedResponse("MGET")),
                })
                .collect(),
            _ => Err(StoreError::UnexpectedResponse("MGET")),
        }
    }

    /// Counts how many of the keys exist.
    pub async fn exists<K: AsRef<str>>(&mut self, keys: &[K]) -> StoreResult<i64> {
        let args = with_keys("EXISTS", keys);
        integer_reply(self.query(args.as_slice()).await?, "EXISTS")
    }

    /// Increments an integer value, creating it at 0 first.
    pub async fn incr(&mut self, key: &str) -> StoreResult<i64> {
        integer_reply(self.query(&["INCR", key]).await?, "INCR")
    }

    /// Decrements an integer value, creating it at 0 first.
    pub async fn decr(&mut self, key: &str) -> StoreResult<i64> {
        integer_reply(self.query(&["DECR", key]).await?, "DECR")
    }

    /// Sets a time-to-live on a key. Returns true when the key exists.
    pub async fn expire(&mut self, key: &str, seconds: u64) -> StoreResult<bool> {
        let seconds = seconds.to_string();
        Ok(integer_reply(self.query(&["EXPIRE", key, seconds.as_str()]).await?, "EXPIRE")? == 1)
    }

    /// Returns the TTL state of a key.
    pub async fn ttl(&mut self, key: &str) -> StoreResult<StoreTtl> {
        match integer_reply(self.query(&["TTL", key]).await?, "TTL")? {
            -2 => Ok(StoreTtl::Missing),
            -1 => Ok(StoreTtl::NoExpiry),
            secs if secs >= 0 => Ok(StoreTtl::ExpiresIn(Duration::from_secs(secs as u64))),
            _ => Err(StoreError::UnexpectedResponse("TTL")),
        }
    }

    /// Pings the server and returns its reply text.
    pub async fn ping(&mut self) -> StoreResult<String> {
        match self.query(&["PING"]).await?.into_result()? {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => into_string(data),
            _ => Err(StoreError::UnexpectedResponse("PING")),
        }
    }
}

impl ConnectionPool {
    pub async fn get(&self, key: &str) -> PoolResult<Option<String>> {
        self.execute(|mut conn| async move { conn.get(key).await.map_err(PoolError::from) })
            .await
    }

    pub async fn set(&self, key: &str, value: &str) -> PoolResult<()> {
        self.execute(|mut conn| async move { conn.set(key, value).await.map_err(PoolError::from) })
            .await
    }

    pub async fn set_with_seconds(&self, key: &str, value: &str, seconds: u64) -> PoolResult<()> {
        self.execute(|mut conn| async move {
            conn.set_with_seconds(key, value, seconds)
                .await
                .map_err(PoolError::from)
        })
        .await
    }

    pub async fn setex(&self, key: &str, seconds: u64, value: &str) -> PoolResult<()> {
        self.execute(|mut conn| async move {
            conn.setex(key, seconds, value).await.map_err(PoolError::from)
        })
        .await
    }

    pub async fn del<K: AsRef<str>>(&self, keys: &[K]) -> PoolResult<i64> {
        self.execute(|mut conn| async move { conn.del(keys).await.map_err(PoolError::from) })
            .await
    }

    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> PoolResult<Vec<Option<String>>> {
        self.execute(|mut conn| async move { conn.mget(keys).await.map_err(PoolError::from) })
            .await
    }

    pub async fn exists<K: AsRef<str>>(&self, keys: &[K]) -> PoolResult<i64> {
        self.execute(|mut conn| async move { conn.exists(keys).await.map_err(PoolError::from) })
            .await
    }

    /// Runs a batch of raw commands on one connection, replies in order.
    pub async fn exec_commands<C, A>(&self, commands: &[C]) -> PoolResult<Vec<StoreResult<RespValue>>>
    where
        C: AsRef<[A]>,
        A: AsRef<[u8]>,
    {
        self.execute(|mut conn| async move {
            conn.exec_commands(commands).await.map_err(PoolError::from)
        })
        .await
    }
}

fn with_keys<'a, K: AsRef<str>>(command: &'a str, keys: &'a [K]) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(keys.len() + 1);
    args.push(command);
    args.extend(keys.iter().map(AsRef::as_ref));
    args
}

fn integer_reply(reply: RespValue, command: &'static str) -> StoreResult<i64> {
    match reply.into_result()? {
        RespValue::Integer(value) => Ok(value),
        _ => Err(StoreError::UnexpectedResponse(command)),
    }
}

fn into_string(data: Vec<u8>) -> StoreResult<String> {
    String::from_utf8(data).map_err(|_| StoreError::InvalidUtf8)
}
