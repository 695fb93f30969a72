//! # Client Errors
//!
//! Purpose: Separate what can go wrong on a single session (`StoreError`) from
//! what can go wrong while borrowing one (`PoolError`).

use std::time::Duration;

use keeper_common::{AddressError, ConfigError};
use thiserror::Error;

/// Result type for single-connection operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by a store session.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Server returned an error reply.
    #[error("server error: {0}")]
    Server(String),
    /// Response type did not match the expected command response.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    /// A bulk reply was not valid UTF-8 where a string was expected.
    #[error("reply is not valid utf-8")]
    InvalidUtf8,
    /// The session was closed and cannot run commands.
    #[error("connection is closed")]
    Closed,
}

impl StoreError {
    /// True when the failure broke the session itself rather than one reply.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Protocol(_))
    }
}

/// Errors surfaced by a connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available within the acquire timeout.
    #[error("timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),
    /// The wait queue already holds `max_waiting_clients` requests.
    #[error("wait queue is full ({0} pending requests)")]
    QueueFull(usize),
    /// The session failed while being created or used.
    #[error("connection error: {0}")]
    Connection(#[from] StoreError),
    /// The pool was ended and accepts no more work.
    #[error("pool is closed")]
    Closed,
    /// Sizing limits are unusable.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    /// The target address could not be resolved.
    #[error(transparent)]
    Address(#[from] AddressError),
}
