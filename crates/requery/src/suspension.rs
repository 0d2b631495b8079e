use futures::future::{BoxFuture, Shared};

use crate::error::QueryError;
use crate::request::Materialized;

/// One in-flight (or settled) operation, shareable between any number of
/// callers. Awaiting a clone never re-runs the underlying operation.
pub type SharedRequest<T> = Shared<BoxFuture<'static, Result<Materialized<T>, QueryError>>>;

/// Synchronous accessor over an asynchronous operation's terminal state.
///
/// A probe is cached per key in the [`CacheStore`](crate::CacheStore) the
/// first time a pending operation is surfaced, and reused for every
/// subsequent access to that key. It is purely a pending/success/error
/// mirror of its operation; no timeout logic lives here.
pub struct Probe<T> {
    operation: SharedRequest<T>,
}

/// What a [`Probe`] sees when it looks at its operation.
pub enum Observation<T> {
    /// Not settled yet. The caller awaits the handle cooperatively and then
    /// probes again; nothing ever busy-polls.
    Pending(SharedRequest<T>),
    /// Settled successfully; the same value is handed out on every probe.
    Ready(Materialized<T>),
    /// Settled with an error, replayed verbatim on every probe.
    Failed(QueryError),
}

impl<T> Probe<T> {
    pub fn new(operation: SharedRequest<T>) -> Self {
        Self { operation }
    }

    /// Observes the operation without blocking or polling it.
    pub fn observe(&self) -> Observation<T> {
        match self.operation.peek() {
            Some(Ok(materialized)) => Observation::Ready(materialized.clone()),
            Some(Err(error)) => Observation::Failed(error.clone()),
            None => Observation::Pending(self.operation.clone()),
        }
    }
}

impl<T> Clone for Probe<T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
        }
    }
}
