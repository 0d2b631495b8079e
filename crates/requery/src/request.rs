use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::cache_key::CacheKey;
use crate::coordinator::Requester;
use crate::error::QueryError;

/// The collaborator seam of the engine: one asynchronous query plus the
/// externally owned data cache it materializes into.
///
/// The engine never performs I/O itself and never owns materialized data.
/// [`query`](Self::query) is the opaque transport-level operation,
/// [`store`](Self::store) shapes a validated payload into the data cache, and
/// [`lookup`](Self::lookup) reads a materialized result back out. The data
/// cache is the sole source of truth for materialized values; the engine's
/// own maps are bookkeeping only.
///
/// Implementations are cloned into spawned operations, so they should be
/// cheap handles (`Arc`s over the actual state).
pub trait CachedQuery: Clone + Send + Sync + 'static {
    /// The request arguments the query is keyed by.
    type Args: Clone + Send + Sync + 'static;
    /// The wire payload carried by a successful [`QueryResponse`].
    type Data: Send + Sync + 'static;
    /// The materialized, caller-visible value.
    type Item: Send + Sync + 'static;

    /// Short identifier used in diagnostics and timeout errors.
    fn name(&self) -> &str;

    /// Deterministic cache key derivation from the request arguments.
    fn cache_id(&self, args: &Self::Args) -> String;

    /// Invokes the transport-level operation.
    ///
    /// The returned envelope is validated by the coordinator: status must be
    /// 200, `error` must be absent, and `data` must be present. A transport
    /// failure below the envelope is reported as
    /// [`QueryError::Transport`].
    fn query(&self, args: Self::Args)
    -> BoxFuture<'static, Result<QueryResponse<Self::Data>, QueryError>>;

    /// Shapes a validated payload into the data cache and returns the
    /// materialized result.
    ///
    /// The request carries a [`Requester`] so paginated results can install a
    /// [`fetch_more`](Materialized::fetch_more) hook that re-enters the
    /// coordinator.
    fn store(&self, request: StoreRequest<'_, Self>) -> Materialized<Self::Item>;

    /// Reads a materialized result from the data cache, if one is available.
    fn lookup(&self, request: LookupRequest<'_, Self>) -> Option<Materialized<Self::Item>>;
}

/// Passed to [`CachedQuery::store`] when a validated response arrives.
pub struct StoreRequest<'a, Q: CachedQuery> {
    pub key: &'a CacheKey,
    pub args: &'a Q::Args,
    /// The validated wire payload.
    pub data: Q::Data,
    /// Re-entrant coordinator handle, owned so a fetch-more hook can capture it.
    pub requester: Requester<Q>,
}

/// Passed to [`CachedQuery::lookup`] on every access.
pub struct LookupRequest<'a, Q: CachedQuery> {
    pub key: &'a CacheKey,
    pub args: &'a Q::Args,
    pub requester: &'a Requester<Q>,
}

/// The wire envelope every query resolves with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse<D> {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<D>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<D> QueryResponse<D> {
    /// A successful envelope.
    pub fn ok(data: D) -> Self {
        Self {
            status: 200,
            data: Some(data),
            error: None,
        }
    }

    /// Validates the envelope and extracts its payload.
    pub(crate) fn into_data(self) -> Result<D, QueryError> {
        if self.status != 200 || self.error.is_some() {
            return Err(QueryError::Response {
                status: self.status,
                message: self.error,
            });
        }
        self.data.ok_or(QueryError::Response {
            status: self.status,
            message: None,
        })
    }
}

/// Re-issues the coordinated request for the "next" page of a paginated
/// result.
pub type FetchMore<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Materialized<T>, QueryError>> + Send + Sync>;

/// A fully resolved result, ready for direct consumption.
///
/// `data` is shared (`Arc`), so repeated cache hits for a key hand out the
/// identical value.
pub struct Materialized<T> {
    pub data: Arc<T>,
    pub fetch_more: Option<FetchMore<T>>,
}

impl<T> Materialized<T> {
    pub fn new(data: Arc<T>) -> Self {
        Self {
            data,
            fetch_more: None,
        }
    }

    pub fn with_fetch_more(mut self, fetch_more: FetchMore<T>) -> Self {
        self.fetch_more = Some(fetch_more);
        self
    }
}

impl<T> Clone for Materialized<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            fetch_more: self.fetch_more.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Materialized<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Materialized")
            .field("data", &self.data)
            .field("fetch_more", &self.fetch_more.is_some())
            .finish()
    }
}
