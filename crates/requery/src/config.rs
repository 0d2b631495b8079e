use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Controls the per-key result lifetime and duration policy of a
/// [`QueryCache`](crate::QueryCache).
///
/// All durations deserialize in humantime format (e.g. `90s`, `5m`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// How long a completed entry may be served before it expires.
    ///
    /// Expiry evicts both the request entry and its probe; the next access
    /// issues a fresh request.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Whether a materialized-cache hit may satisfy a never-requested key
    /// without issuing a query.
    pub primable: bool,

    /// Wall-clock duration policy for in-flight operations.
    pub constraints: Constraints,

    /// Emits extra diagnostic tracing. Never alters control flow.
    pub debug: bool,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            primable: false,
            constraints: Constraints::default(),
            debug: false,
        }
    }
}

/// How long an operation may take, and what happens when it takes longer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// When true, an overrun converts the operation's result into a permanent
    /// [`Timeout`](crate::QueryError::Timeout) failure for the key. When
    /// false, the overrun is only logged.
    pub enforce: bool,

    /// The longest an operation may take before it counts as overrun.
    /// Unset disables the policy entirely.
    #[serde(with = "humantime_serde")]
    pub max_delay: Option<Duration>,
}

impl QueryCacheConfig {
    /// Validates the configuration. Runs once, at engine construction.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::InvalidDuration);
        }
        if self.constraints.max_delay.is_some_and(|delay| delay.is_zero()) {
            return Err(ConfigError::InvalidMaxDelay);
        }
        Ok(())
    }
}
