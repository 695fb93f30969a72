//! # Pool and Store Configuration
//!
//! Purpose: Hold the sizing limits of a connection pool and the options a
//! store connection is opened with, and layer environment overrides on top
//! of the defaults.
//!
//! ## Design Principles
//! 1. **Plain Data**: Every option is a serde struct with `Default`, so the
//!    same types come from code, from the environment, or from a file.
//! 2. **Layered Loading**: Defaults first, environment last (`figment`).
//! 3. **Validate Once**: Limits are checked when a pool is built, never on the
//!    acquire path.
//!
//! ## Environment
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `KEEPER_POOL_MIN` / `KEEPER_MIN` | `min` | 2 |
//! | `KEEPER_POOL_MAX` / `KEEPER_MAX` | `max` | 10 |
//! | `KEEPER_ACQUIRE_TIMEOUT` / `KEEPER_ACQUIRE_TIMEOUT_MILLIS` | `acquire_timeout_millis` | 1000 |
//! | `KEEPER_MAX_WAITING` / `KEEPER_MAX_WAITING_CLIENTS` | `max_waiting_clients` | 300 |

use std::time::Duration;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "KEEPER_";

pub const DEFAULT_POOL_MIN: usize = 2;
pub const DEFAULT_POOL_MAX: usize = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_MILLIS: u64 = 1000;
pub const DEFAULT_MAX_WAITING_CLIENTS: usize = 300;

/// Capacity and queueing limits of one connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSizing {
    /// Connections kept open even when idle.
    #[serde(alias = "pool_min")]
    pub min: usize,
    /// Hard cap on connections (idle + borrowed + being created).
    #[serde(alias = "pool_max")]
    pub max: usize,
    /// How long an acquire may wait; `0` waits forever.
    #[serde(alias = "acquire_timeout")]
    pub acquire_timeout_millis: u64,
    /// Maximum number of queued acquire requests.
    #[serde(alias = "max_waiting")]
    pub max_waiting_clients: usize,
}

impl Default for PoolSizing {
    fn default() -> Self {
        PoolSizing {
            min: DEFAULT_POOL_MIN,
            max: DEFAULT_POOL_MAX,
            acquire_timeout_millis: DEFAULT_ACQUIRE_TIMEOUT_MILLIS,
            max_waiting_clients: DEFAULT_MAX_WAITING_CLIENTS,
        }
    }
}

impl PoolSizing {
    /// Loads sizing from `KEEPER_*` environment variables over the defaults.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_figment(Figment::from(Serialized::defaults(PoolSizing::default())))
    }

    /// Loads sizing from a caller-provided figment, adding the environment
    /// layer on top of it.
    pub fn from_figment(figment: Figment) -> ConfigResult<Self> {
        let sizing: PoolSizing = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?;
        sizing.validate()?;
        Ok(sizing)
    }

    /// Checks the limits are usable by a pool.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max == 0 {
            return Err(ConfigError::Invalid("pool max must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(ConfigError::Invalid(format!(
                "pool min ({}) exceeds max ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Acquire timeout as a duration, `None` when acquires wait forever.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        match self.acquire_timeout_millis {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn with_acquire_timeout_millis(mut self, millis: u64) -> Self {
        self.acquire_timeout_millis = millis;
        self
    }

    pub fn with_max_waiting_clients(mut self, waiting: usize) -> Self {
        self.max_waiting_clients = waiting;
        self
    }
}

/// Backoff applied while a broken connection re-dials its server.
///
/// Attempt `n` (1-based) waits `min(n * step, max_delay)`; attempts past
/// `max_attempts` give up and the connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub step_millis: u64,
    pub max_delay_millis: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            step_millis: 50,
            max_delay_millis: 2000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy that never reconnects.
    pub fn never() -> Self {
        RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        }
    }

    /// Delay before reconnect attempt `attempt`, or `None` to give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let millis = self
            .step_millis
            .saturating_mul(u64::from(attempt))
            .min(self.max_delay_millis);
        Some(Duration::from_millis(millis))
    }
}

/// Options every connection of a pool is opened with.
///
/// Credentials and database given here apply when the target address does
/// not carry its own (host/port addresses never do).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// TCP connect timeout; `None` relies on the OS.
    pub connect_timeout_millis: Option<u64>,
    /// Password sent with `AUTH` after connecting.
    pub password: Option<String>,
    /// Database selected with `SELECT` after connecting.
    pub database: Option<i64>,
    /// Reconnect backoff for connections that break while in use.
    pub retry: RetryPolicy,
}

impl StoreOptions {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_millis.map(Duration::from_millis)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout_millis(mut self, millis: u64) -> Self {
        self.connect_timeout_millis = Some(millis);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = Some(database);
        self
    }
}
