use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;

use crate::cache_key::CacheKey;
use crate::config::QueryCacheConfig;
use crate::error::QueryError;
use crate::request::{CachedQuery, Materialized, StoreRequest};
use crate::store::{CacheStore, RequestEntry, RequestHandle, RequestProgress, StoreRepository};
use crate::suspension::SharedRequest;

/// The engine core shared by [`QueryCache`](crate::QueryCache) handles and
/// re-entrant [`Requester`]s: the collaborator, the configuration, and the
/// bookkeeping store.
pub(crate) struct Coordinator<Q: CachedQuery, S> {
    pub(crate) query: Q,
    pub(crate) config: QueryCacheConfig,
    pub(crate) store: S,
}

/// The operations a [`Requester`] can re-enter without knowing the store
/// host type.
pub(crate) trait Coordinate<Q: CachedQuery>: Send + Sync {
    fn issue(self: Arc<Self>, args: Q::Args) -> Result<RequestHandle<Q::Item>, QueryError>;
    fn persist_failure(&self, key: &CacheKey, error: QueryError);
}

/// Re-entrant handle to the coordinator.
///
/// Handed to [`CachedQuery::store`] and [`CachedQuery::lookup`] so that
/// shaped results can issue follow-up requests (pagination-style fetch
/// more) through the same deduplication and bookkeeping as any other
/// access. Holds only a weak reference, so a hook captured inside the
/// store cannot keep the engine alive.
pub struct Requester<Q: CachedQuery> {
    coordinator: Weak<dyn Coordinate<Q>>,
}

impl<Q: CachedQuery> Requester<Q> {
    pub(crate) fn new(coordinator: Weak<dyn Coordinate<Q>>) -> Self {
        Self { coordinator }
    }

    /// Returns the shared operation for `args`, issuing one if none exists.
    pub fn request(&self, args: Q::Args) -> Result<RequestHandle<Q::Item>, QueryError> {
        let coordinator = self.coordinator.upgrade().ok_or(QueryError::Detached)?;
        coordinator.issue(args)
    }

    pub(crate) fn persist_failure(&self, key: &CacheKey, error: QueryError) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.persist_failure(key, error);
        }
    }
}

impl<Q: CachedQuery> Clone for Requester<Q> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Weak::clone(&self.coordinator),
        }
    }
}

impl<Q, S> Coordinate<Q> for Coordinator<Q, S>
where
    Q: CachedQuery,
    S: StoreRepository<Q::Item>,
{
    fn issue(self: Arc<Self>, args: Q::Args) -> Result<RequestHandle<Q::Item>, QueryError> {
        let key = CacheKey::new(self.query.cache_id(&args));
        self.store
            .update(|store| self.get_or_create_request(store, &key, &args))
    }

    fn persist_failure(&self, key: &CacheKey, error: QueryError) {
        self.store.update(|store| store.fail(key, error));
    }
}

impl<Q, S> Coordinator<Q, S>
where
    Q: CachedQuery,
    S: StoreRepository<Q::Item>,
{
    /// A fresh re-entrant handle to this coordinator.
    pub(crate) fn requester(self: &Arc<Self>) -> Requester<Q> {
        Requester::new(Arc::downgrade(self) as Weak<dyn Coordinate<Q>>)
    }

    /// Returns the single shared operation for `key`, creating one only if
    /// absent.
    ///
    /// Runs within one synchronous store update, so concurrent callers for
    /// the same key always observe a single in-flight operation. A terminal
    /// failure entry fails fast; there is no retry here.
    pub(crate) fn get_or_create_request(
        self: &Arc<Self>,
        store: &mut CacheStore<Q::Item>,
        key: &CacheKey,
        args: &Q::Args,
    ) -> Result<RequestHandle<Q::Item>, QueryError> {
        match store.requests.get(key) {
            Some(RequestEntry::InFlight { handle, .. }) => return Ok(handle.clone()),
            Some(RequestEntry::Failed(error)) => return Err(error.clone()),
            // a primed entry carries no operation; the data cache read that
            // justified it no longer does, so issue a real request
            Some(RequestEntry::Primed { .. }) | None => {}
        }

        tracing::trace!(
            query = self.query.name(),
            key = %key,
            "spawning deduplicated query operation"
        );

        let handle = self.issue_request(key, args);
        store.requests.insert(
            key.clone(),
            RequestEntry::InFlight {
                expires_at: Instant::now() + self.config.duration,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// Spawns the query operation and wraps it for sharing.
    ///
    /// The wrapper validates the response envelope, delegates result shaping
    /// to the collaborator, applies the duration constraints, and only then
    /// records completion in the progress companion. It runs to completion
    /// whether or not anybody is awaiting the handle.
    fn issue_request(self: &Arc<Self>, key: &CacheKey, args: &Q::Args) -> RequestHandle<Q::Item> {
        let progress = Arc::new(RequestProgress::default());
        let started = Instant::now();

        let task = {
            let query = self.query.clone();
            let config = self.config.clone();
            let key = key.clone();
            let args = args.clone();
            let progress = Arc::clone(&progress);
            let requester = self.requester();
            async move {
                let result = run_query(&query, &key, args, requester.clone()).await;
                let elapsed = started.elapsed();
                // an enforced overrun is persisted before the entry counts as
                // settled, so no concurrent access can serve the result that
                // is about to become a terminal timeout
                let result = enforce_constraints(&query, &config, &key, result, elapsed, &requester);
                progress.finish(elapsed);
                result
            }
        };
        let task = tokio::spawn(task);

        let operation: SharedRequest<Q::Item> = async move {
            match task.await {
                Ok(result) => result,
                Err(error) => Err(QueryError::Transport(format!("query task failed: {error}"))),
            }
        }
        .boxed()
        .shared();

        RequestHandle::new(operation, progress)
    }
}

async fn run_query<Q: CachedQuery>(
    query: &Q,
    key: &CacheKey,
    args: Q::Args,
    requester: Requester<Q>,
) -> Result<Materialized<Q::Item>, QueryError> {
    let response = query.query(args.clone()).await?;
    let status = response.status;
    let data = response.into_data()?;

    tracing::trace!(query = query.name(), key = %key, status, "query resolved, storing result");
    Ok(query.store(StoreRequest {
        key,
        args: &args,
        data,
        requester,
    }))
}

/// Applies the configured duration constraints to a settled operation.
///
/// An overrun on a successful result either becomes a terminal
/// [`QueryError::Timeout`] for the key (enforced) or is merely logged. A
/// result that already failed is passed through untouched.
fn enforce_constraints<Q: CachedQuery>(
    query: &Q,
    config: &QueryCacheConfig,
    key: &CacheKey,
    result: Result<Materialized<Q::Item>, QueryError>,
    elapsed: Duration,
    requester: &Requester<Q>,
) -> Result<Materialized<Q::Item>, QueryError> {
    if result.is_err() {
        return result;
    }
    let Some(max_delay) = config.constraints.max_delay else {
        return result;
    };
    if elapsed <= max_delay {
        return result;
    }

    if !config.constraints.enforce {
        tracing::warn!(
            query = query.name(),
            key = %key,
            elapsed = ?elapsed,
            max_delay = ?max_delay,
            "query exceeded max delay (not enforced)"
        );
        return result;
    }

    let error = QueryError::Timeout {
        query: query.name().to_owned(),
        key: key.clone(),
        elapsed,
        max_delay,
    };
    tracing::warn!(error = %error, "query exceeded max delay, persisting failure");
    requester.persist_failure(key, error.clone());
    Err(error)
}
