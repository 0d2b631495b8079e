use std::time::Duration;

use humantime::FormattedDuration;
use thiserror::Error;

use crate::cache_key::CacheKey;

/// An error produced while coordinating a query.
///
/// This error enum is intended for persisting in the request map (terminal
/// entries) and for cloning out of a shared in-flight operation, which is why
/// it is `Clone + Eq` and carries owned data only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The response envelope was rejected: a non-200 status, a populated
    /// `error` field, or missing data.
    #[error("({status}) Response failed{}", fmt_detail(.message))]
    Response {
        status: u16,
        message: Option<String>,
    },

    /// The operation finished later than the configured max delay, with
    /// enforcement enabled.
    ///
    /// Once observed, this is persisted as a terminal entry for the key so
    /// the failure is stable across accesses.
    #[error(
        "query `{query}` for key `{key}` timed out: took {}, max delay is {}",
        fmt_duration(.elapsed),
        fmt_duration(.max_delay)
    )]
    Timeout {
        query: String,
        key: CacheKey,
        elapsed: Duration,
        max_delay: Duration,
    },

    /// The transport below the query failed before producing an envelope.
    #[error("transport failed: {0}")]
    Transport(String),

    /// A re-entrant requester outlived the engine that created it.
    #[error("query coordinator is gone")]
    Detached,
}

fn fmt_detail(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(": {message}"),
        None => String::new(),
    }
}

fn fmt_duration(duration: &Duration) -> FormattedDuration {
    humantime::format_duration(*duration)
}

/// Invalid engine setup. Fatal, and only ever returned synchronously at
/// construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache duration must be non-zero")]
    InvalidDuration,
    #[error("max delay must be non-zero when set")]
    InvalidMaxDelay,
}
