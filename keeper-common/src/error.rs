//! # Error Types
//!
//! Purpose: Describe failures that happen before any connection exists, i.e.
//! while resolving an address or loading configuration.

use thiserror::Error;

/// Result alias for address resolution.
pub type AddressResult<T> = Result<T, AddressError>;

/// Result alias for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while turning a target address into a dialable endpoint.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The URL could not be parsed at all.
    #[error("invalid store url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    /// The URL scheme is not a store scheme.
    #[error("unsupported url scheme `{0}` (expected `redis`)")]
    UnsupportedScheme(String),
    /// The URL or host/port string carries no host.
    #[error("store address `{0}` has no host")]
    MissingHost(String),
    /// The port part is not a valid TCP port.
    #[error("invalid port in store address `{0}`")]
    InvalidPort(String),
    /// The URL path does not name a numeric database.
    #[error("invalid database `{0}` in store url")]
    InvalidDatabase(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Extraction from the layered providers failed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values were loaded but violate a sizing constraint.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
