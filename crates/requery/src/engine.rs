use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::cache_key::CacheKey;
use crate::config::QueryCacheConfig;
use crate::coordinator::{Coordinator, Requester};
use crate::error::{ConfigError, QueryError};
use crate::request::{CachedQuery, LookupRequest, Materialized};
use crate::store::{CacheStore, LocalStore, RequestEntry, StoreRepository};
use crate::suspension::{Observation, Probe, SharedRequest};

/// What one accessor call produced.
///
/// The consuming layer pattern-matches instead of triggering hidden control
/// flow: `Pending` carries the waitable handle for the in-flight operation,
/// and a caller is expected to await it and call
/// [`fetch`](QueryCache::fetch) again.
pub enum QueryResult<T> {
    /// A materialized result, served from the data cache, from priming, or
    /// from a settled operation.
    Ready(Materialized<T>),
    /// Work is in flight. Await the handle cooperatively, then fetch again.
    Pending(SharedRequest<T>),
    /// The access failed; terminal failures repeat this on every call until
    /// the key is invalidated.
    Failed(QueryError),
}

impl<T> QueryResult<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, QueryResult::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, QueryResult::Pending(_))
    }

    pub fn into_ready(self) -> Option<Materialized<T>> {
        match self {
            QueryResult::Ready(materialized) => Some(materialized),
            _ => None,
        }
    }

    pub fn into_error(self) -> Option<QueryError> {
        match self {
            QueryResult::Failed(error) => Some(error),
            _ => None,
        }
    }
}

// Shared futures have no useful Debug representation, so this is hand-rolled.
impl<T: fmt::Debug> fmt::Debug for QueryResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryResult::Ready(materialized) => f.debug_tuple("Ready").field(materialized).finish(),
            QueryResult::Pending(_) => f.write_str("Pending(..)"),
            QueryResult::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// Coordinates cached access to one query.
///
/// Per call, [`fetch`](Self::fetch) decides between serving a materialized
/// result (cached or primed), reusing the in-flight operation, evicting an
/// expired entry, or issuing a fresh request; the decision runs
/// synchronously under a single store update. Cloning the engine is cheap
/// and all clones share the same bookkeeping.
pub struct QueryCache<Q, S = LocalStore<<Q as CachedQuery>::Item>>
where
    Q: CachedQuery,
    S: StoreRepository<Q::Item>,
{
    inner: Arc<Coordinator<Q, S>>,
}

impl<Q: CachedQuery> QueryCache<Q> {
    /// Builds an engine with its own in-process store.
    pub fn new(query: Q, config: QueryCacheConfig) -> Result<Self, ConfigError> {
        Self::with_store(query, config, LocalStore::new())
    }
}

impl<Q, S> QueryCache<Q, S>
where
    Q: CachedQuery,
    S: StoreRepository<Q::Item>,
{
    /// Builds an engine on a host-owned store.
    ///
    /// Configuration violations surface here, at setup, never at call time.
    pub fn with_store(query: Q, config: QueryCacheConfig, store: S) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Coordinator {
                query,
                config,
                store,
            }),
        })
    }

    /// A re-entrant requester tied to this engine.
    pub fn requester(&self) -> Requester<Q> {
        self.inner.requester()
    }

    /// The accessor: resolves one access for `args` without ever blocking.
    pub fn fetch(&self, args: &Q::Args) -> QueryResult<Q::Item> {
        let inner = &self.inner;
        let key = CacheKey::new(inner.query.cache_id(args));

        // the lookup may re-enter the requester, so it runs before the store
        // lock is taken
        let requester = inner.requester();
        let cached = inner.query.lookup(LookupRequest {
            key: &key,
            args,
            requester: &requester,
        });

        if inner.config.debug {
            tracing::debug!(
                query = inner.query.name(),
                key = %key,
                cached = cached.is_some(),
                "cache access"
            );
        }

        inner
            .store
            .update(|store| inner.decide(store, &key, args, cached))
    }

    /// Removes all bookkeeping for the key, including a terminal failure.
    ///
    /// This is the caller's sole retry mechanism: the core never retries on
    /// its own, and failure entries do not expire.
    pub fn invalidate(&self, args: &Q::Args) {
        let key = CacheKey::new(self.inner.query.cache_id(args));
        tracing::trace!(query = self.inner.query.name(), key = %key, "invalidating");
        self.inner.store.update(|store| store.evict(&key));
    }

    /// Callable adapter: fetches and cooperatively waits until the access
    /// settles.
    pub async fn resolve(&self, args: &Q::Args) -> Result<Materialized<Q::Item>, QueryError> {
        loop {
            match self.fetch(args) {
                QueryResult::Ready(materialized) => return Ok(materialized),
                QueryResult::Failed(error) => return Err(error),
                QueryResult::Pending(operation) => {
                    // the next fetch observes the settled probe; the value is
                    // not taken from here so the decision procedure stays the
                    // single source of results
                    let _ = operation.await;
                }
            }
        }
    }

    /// Declarative adapter: hands the current result to a children closure.
    pub fn render_with<R>(
        &self,
        args: &Q::Args,
        children: impl FnOnce(QueryResult<Q::Item>) -> R,
    ) -> R {
        children(self.fetch(args))
    }
}

impl<Q, S> Clone for QueryCache<Q, S>
where
    Q: CachedQuery,
    S: StoreRepository<Q::Item>,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Where the decision procedure left the key's request entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Missing,
    Expired,
    Satisfied,
    InFlight,
}

impl<Q, S> Coordinator<Q, S>
where
    Q: CachedQuery,
    S: StoreRepository<Q::Item>,
{
    /// The per-call decision procedure, run under one store update.
    fn decide(
        self: &Arc<Self>,
        store: &mut CacheStore<Q::Item>,
        key: &CacheKey,
        args: &Q::Args,
        mut cached: Option<Materialized<Q::Item>>,
    ) -> QueryResult<Q::Item> {
        let now = Instant::now();

        let status = match store.requests.get(key) {
            None => EntryStatus::Missing,
            Some(RequestEntry::Failed(error)) => return QueryResult::Failed(error.clone()),
            Some(entry) if entry.is_expired(now) => EntryStatus::Expired,
            Some(entry) if entry.is_satisfied() => EntryStatus::Satisfied,
            Some(_) => EntryStatus::InFlight,
        };

        match status {
            EntryStatus::Expired => {
                // both entries go together; the next steps treat the key as
                // never requested
                tracing::trace!(query = self.query.name(), key = %key, "entry expired, evicting");
                store.evict(key);
            }
            EntryStatus::Satisfied => {
                if let Some(materialized) = cached.take() {
                    return QueryResult::Ready(materialized);
                }
                // settled, but nothing materialized to serve; fall through to
                // the probe, which replays the operation's own result
            }
            EntryStatus::Missing | EntryStatus::InFlight => {}
        }

        if matches!(status, EntryStatus::Missing | EntryStatus::Expired)
            && self.config.primable
        {
            if let Some(materialized) = cached.take() {
                if self.config.debug {
                    tracing::debug!(query = self.query.name(), key = %key, "primed from data cache");
                }
                store.requests.insert(
                    key.clone(),
                    RequestEntry::Primed {
                        expires_at: now + self.config.duration,
                    },
                );
                return QueryResult::Ready(materialized);
            }
        }

        self.observe(store, key, args)
    }

    /// Probes the key's operation, creating and caching the probe (and, if
    /// needed, the operation itself) on first use.
    fn observe(
        self: &Arc<Self>,
        store: &mut CacheStore<Q::Item>,
        key: &CacheKey,
        args: &Q::Args,
    ) -> QueryResult<Q::Item> {
        let existing = store.probes.get(key).cloned();
        let probe = match existing {
            Some(probe) => probe,
            None => {
                let handle = match self.get_or_create_request(store, key, args) {
                    Ok(handle) => handle,
                    Err(error) => return QueryResult::Failed(error),
                };
                let probe = Probe::new(handle.shared());
                store.probes.insert(key.clone(), probe.clone());
                probe
            }
        };

        match probe.observe() {
            Observation::Pending(operation) => QueryResult::Pending(operation),
            Observation::Ready(materialized) => QueryResult::Ready(materialized),
            Observation::Failed(error) => {
                // keep the failure visible to synchronous reads without
                // re-suspending; only invalidation clears it
                store.fail(key, error.clone());
                QueryResult::Failed(error)
            }
        }
    }
}
