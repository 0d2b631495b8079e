use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::cache_key::CacheKey;
use crate::error::QueryError;
use crate::suspension::{Probe, SharedRequest};

/// Explicit completion record for one issued operation.
///
/// The handle and its completion state travel together; nothing is attached
/// to the operation after the fact. `finish` is called exactly once, by the
/// coordinator, when the operation settles.
#[derive(Debug, Default)]
pub struct RequestProgress {
    elapsed: OnceLock<Duration>,
}

impl RequestProgress {
    /// Whether the operation has settled (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.elapsed.get().is_some()
    }

    /// Wall-clock duration of the operation, once settled.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed.get().copied()
    }

    pub(crate) fn finish(&self, elapsed: Duration) {
        let _ = self.elapsed.set(elapsed);
    }
}

/// Handle to the single shared operation for a cache key.
pub struct RequestHandle<T> {
    operation: SharedRequest<T>,
    progress: Arc<RequestProgress>,
}

impl<T> RequestHandle<T> {
    pub(crate) fn new(operation: SharedRequest<T>, progress: Arc<RequestProgress>) -> Self {
        Self {
            operation,
            progress,
        }
    }

    /// A clone of the shared operation, awaitable without re-running it.
    pub fn shared(&self) -> SharedRequest<T> {
        self.operation.clone()
    }

    pub fn progress(&self) -> &RequestProgress {
        &self.progress
    }
}

impl<T> Clone for RequestHandle<T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            progress: Arc::clone(&self.progress),
        }
    }
}

/// Bookkeeping for one cache key.
///
/// Absence of an entry means "never requested" (or evicted after expiry).
pub enum RequestEntry<T> {
    /// A request has been issued; all concurrent callers share its handle.
    /// `expires_at` only becomes meaningful once the operation finishes.
    InFlight {
        expires_at: Instant,
        handle: RequestHandle<T>,
    },
    /// Satisfied from the external data cache without issuing a request;
    /// exists purely to carry the expiry timestamp.
    Primed { expires_at: Instant },
    /// A terminal failure, replayed verbatim on every subsequent access.
    /// Never expires; only explicit invalidation removes it.
    Failed(QueryError),
}

impl<T> RequestEntry<T> {
    /// Whether the entry represents a settled key: a finished operation or a
    /// primed placeholder. In-flight work and terminal failures never count.
    pub fn is_satisfied(&self) -> bool {
        match self {
            RequestEntry::InFlight { handle, .. } => handle.progress().is_finished(),
            RequestEntry::Primed { .. } => true,
            RequestEntry::Failed(_) => false,
        }
    }

    /// Whether the entry is past its expiry. Only satisfied entries expire.
    pub fn is_expired(&self, now: Instant) -> bool {
        let expires_at = match self {
            RequestEntry::InFlight { expires_at, .. } => *expires_at,
            RequestEntry::Primed { expires_at } => *expires_at,
            RequestEntry::Failed(_) => return false,
        };
        self.is_satisfied() && now > expires_at
    }
}

/// The engine's bookkeeping maps: in-flight/completed request entries and
/// the derived probes.
///
/// Materialized data never lives here; the external data cache owns it.
pub struct CacheStore<T> {
    pub(crate) requests: HashMap<CacheKey, RequestEntry<T>>,
    pub(crate) probes: HashMap<CacheKey, Probe<T>>,
}

impl<T> CacheStore<T> {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            probes: HashMap::new(),
        }
    }

    /// The number of keys with request bookkeeping.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The terminal failure recorded for the key, if any.
    pub fn terminal_error(&self, key: &CacheKey) -> Option<&QueryError> {
        match self.requests.get(key) {
            Some(RequestEntry::Failed(error)) => Some(error),
            _ => None,
        }
    }

    /// Removes both the request entry and the probe for the key.
    ///
    /// The two are always invalidated together; a probe over an evicted
    /// request would replay data the store no longer vouches for.
    pub fn evict(&mut self, key: &CacheKey) {
        self.requests.remove(key);
        self.probes.remove(key);
    }

    /// Replaces the key's entry with a terminal failure and drops its probe.
    pub fn fail(&mut self, key: &CacheKey, error: QueryError) {
        self.requests.insert(key.clone(), RequestEntry::Failed(error));
        self.probes.remove(key);
    }
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-owned container for the [`CacheStore`].
///
/// The engine never touches the maps directly; every read and every update
/// goes through the repository, which must apply them synchronously and
/// serialize concurrent updates in submission order. Hosts may implement
/// this with whatever discipline fits them; [`LocalStore`] is the default
/// in-process implementation.
pub trait StoreRepository<T>: Send + Sync + 'static {
    fn read<R>(&self, f: impl FnOnce(&CacheStore<T>) -> R) -> R;
    fn update<R>(&self, f: impl FnOnce(&mut CacheStore<T>) -> R) -> R;
}

/// The default in-process store host: a mutex over the maps.
pub struct LocalStore<T>(Arc<Mutex<CacheStore<T>>>);

impl<T> LocalStore<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(CacheStore::new())))
    }
}

impl<T> Default for LocalStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for LocalStore<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Send + Sync + 'static> StoreRepository<T> for LocalStore<T> {
    fn read<R>(&self, f: impl FnOnce(&CacheStore<T>) -> R) -> R {
        f(&self.0.lock().unwrap())
    }

    fn update<R>(&self, f: impl FnOnce(&mut CacheStore<T>) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }
}
