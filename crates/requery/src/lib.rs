//! # requery — a deduplicating, suspendable query cache
//!
//! `requery` coordinates client-side access to an asynchronous "query"
//! operation keyed by request arguments. It deduplicates concurrent requests
//! for a key, caches resolved results for a bounded time, can prime a result
//! from a separately maintained data cache, and exposes a synchronization
//! primitive that lets a consumer wait for in-flight work without ever
//! blocking a thread.
//!
//! ## Architecture
//!
//! The engine is a small state machine per cache key, built from the
//! following layers (leaves first):
//!
//! - The **suspension primitive** ([`Probe`]) mirrors one shared operation's
//!   pending/success/error state through a zero-argument synchronous
//!   observation. A pending observation carries a waitable handle (a clone of
//!   the shared operation) instead of raising hidden control flow: the caller
//!   awaits the handle cooperatively and probes again.
//! - The **cache store** ([`CacheStore`]) holds two independent maps keyed by
//!   [`CacheKey`]: request bookkeeping ([`RequestEntry`]) and the derived
//!   probes. The store is owned by its host behind the [`StoreRepository`]
//!   trait; the engine only ever applies synchronous read/update closures.
//!   [`LocalStore`] is the default in-process host.
//! - The **request coordinator** issues at most one operation per key,
//!   distributes it through a shared future, validates the response envelope
//!   ([`QueryResponse`]), delegates result shaping to the collaborator, and
//!   applies the configured duration constraints when the operation settles.
//! - The **accessor engine** ([`QueryCache`]) runs the per-call decision
//!   procedure: serve a terminal failure, evict on expiry, serve a
//!   materialized cache hit, prime from the data cache, or fall through to
//!   the probe.
//!
//! The external collaborator — the query transport plus the materialized
//! data cache — is described by the [`CachedQuery`] trait. The engine never
//! performs I/O itself and never owns materialized data: the data cache is
//! the sole source of truth for values, while the engine's maps are
//! bookkeeping only.
//!
//! ## Result lifecycle
//!
//! An access returns a [`QueryResult`]:
//!
//! - `Ready` — a [`Materialized`] value; `data` is an `Arc`, so repeated hits
//!   for an unexpired key hand out the identical value.
//! - `Pending` — the operation is in flight; await the handle, fetch again.
//! - `Failed` — the access failed. Failures that have been surfaced are
//!   persisted as terminal entries and replay on every subsequent access;
//!   only [`QueryCache::invalidate`] clears them. The core never retries.
//!
//! Completed entries expire `duration` after the request was issued; expiry
//! always evicts the request entry and its probe together, and the next
//! access starts the cycle over.
//!
//! ## Duration constraints
//!
//! With `constraints.max_delay` configured, the coordinator measures the
//! wall-clock duration of every operation. An overrun either converts the
//! result into a permanent [`QueryError::Timeout`] for the key (when
//! `constraints.enforce` is set) or is only logged. Enforcement happens when
//! the operation settles, so a slow query becomes a stable failure even if
//! nothing is watching at that moment.

mod cache_key;
mod config;
mod coordinator;
mod engine;
mod error;
mod request;
mod store;
mod suspension;

pub use cache_key::CacheKey;
pub use config::{Constraints, QueryCacheConfig};
pub use coordinator::Requester;
pub use engine::{QueryCache, QueryResult};
pub use error::{ConfigError, QueryError};
pub use request::{
    CachedQuery, FetchMore, LookupRequest, Materialized, QueryResponse, StoreRequest,
};
pub use store::{
    CacheStore, LocalStore, RequestEntry, RequestHandle, RequestProgress, StoreRepository,
};
pub use suspension::{Observation, Probe, SharedRequest};
