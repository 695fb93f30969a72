//! Error types for the cache layer.

use keeper_client::PoolError;
use keeper_common::ConfigError;
use thiserror::Error;

/// Result type for cache-layer operations.
pub type KeeperResult<T> = Result<T, KeeperError>;

/// Failures raised by the cache layer itself.
///
/// Errors of the wrapped function never pass through this type; they reach
/// the caller unchanged.
#[derive(Debug, Error)]
pub enum KeeperError {
    /// The backing store could not be reached or answered with an error.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// A computed result could not be encoded as JSON.
    #[error("failed to encode result for key {key}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// A cached value could not be decoded into the expected type.
    #[error("failed to decode cached value for key {key}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
