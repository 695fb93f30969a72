//! # Keeper Store Server
//!
//! Purpose: A small Redis-compatible store speaking RESP2 over TCP. It backs
//! the client's integration tests and works as a local development store.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: The keyspace is split across independently locked shards.
//! 2. **Lazy Expiration**: TTLs are checked on access, plus an optional sweep.
//! 3. **Protocol Clarity**: Requests are parsed and replies encoded explicitly.

pub mod engine;
pub mod protocol;
pub mod server;

pub use engine::{EngineError, EngineResult, MemoryStore, TtlStatus};
pub use server::{handle_connection, serve, ServerConfig, ServerContext, ServerHandle, ServerStats};
