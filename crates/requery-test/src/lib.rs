//! Helpers for testing the query cache engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - [`BookQuery`] is a scripted collaborator: script an outcome per book id
//!    before fetching, and use [`BookQuery::invocations`] to assert how often
//!    the transport actually ran. Its "external data cache" is an in-memory
//!    shelf keyed by cache id, which tests can pre-populate to exercise
//!    priming.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use requery::{
    CachedQuery, LookupRequest, Materialized, QueryError, QueryResponse, StoreRequest,
};

/// Setup the test environment.
///
///  - Initializes logs: the logger only captures logs from the `requery`
///    crate and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("requery=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
}

impl Book {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// The externally owned materialized data cache, keyed by cache id.
pub type Shelf = Arc<Mutex<HashMap<String, Arc<Book>>>>;

/// Scripted outcome for one book id.
#[derive(Debug, Clone)]
pub enum Script {
    /// A well-formed 200 envelope carrying the book.
    Ok(Book),
    /// A non-200 envelope, optionally with an error message.
    Status(u16, Option<String>),
    /// A 200 envelope with a populated error field.
    Error(String),
    /// A 200 envelope with no data and no error.
    MissingData,
    /// The transport itself fails before producing an envelope.
    Transport(String),
}

/// A scripted book-lookup query with an in-memory data cache.
///
/// Cache ids follow the `getBook#id#<id>` convention.
#[derive(Clone, Default)]
pub struct BookQuery {
    shelf: Shelf,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    invocations: Arc<AtomicUsize>,
    delay: Arc<Mutex<Duration>>,
}

impl BookQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the outcome for a book id.
    pub fn script(&self, id: &str, script: Script) {
        self.scripts.lock().unwrap().insert(id.to_owned(), script);
    }

    /// Delays every transport invocation by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Pre-populates the external data cache under the given cache id.
    pub fn shelve(&self, cache_id: &str, book: Book) {
        self.shelf
            .lock()
            .unwrap()
            .insert(cache_id.to_owned(), Arc::new(book));
    }

    /// Drops a book from the external data cache.
    pub fn unshelve(&self, cache_id: &str) {
        self.shelf.lock().unwrap().remove(cache_id);
    }

    /// How often the transport has been invoked.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl CachedQuery for BookQuery {
    type Args = String;
    type Data = Book;
    type Item = Book;

    fn name(&self) -> &str {
        "getBook"
    }

    fn cache_id(&self, args: &String) -> String {
        format!("getBook#id#{args}")
    }

    fn query(&self, args: String) -> BoxFuture<'static, Result<QueryResponse<Book>, QueryError>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().get(&args).cloned();
        let delay = *self.delay.lock().unwrap();

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match script {
                Some(Script::Ok(book)) => Ok(QueryResponse::ok(book)),
                Some(Script::Status(status, error)) => Ok(QueryResponse {
                    status,
                    data: None,
                    error,
                }),
                Some(Script::Error(message)) => Ok(QueryResponse {
                    status: 200,
                    data: None,
                    error: Some(message),
                }),
                Some(Script::MissingData) => Ok(QueryResponse {
                    status: 200,
                    data: None,
                    error: None,
                }),
                Some(Script::Transport(message)) => Err(QueryError::Transport(message)),
                None => Ok(QueryResponse {
                    status: 404,
                    data: None,
                    error: Some(format!("no book with id {args}")),
                }),
            }
        }
        .boxed()
    }

    fn store(&self, request: StoreRequest<'_, Self>) -> Materialized<Book> {
        let data = Arc::new(request.data);
        self.shelf
            .lock()
            .unwrap()
            .insert(request.key.as_str().to_owned(), Arc::clone(&data));
        Materialized::new(data)
    }

    fn lookup(&self, request: LookupRequest<'_, Self>) -> Option<Materialized<Book>> {
        self.shelf
            .lock()
            .unwrap()
            .get(request.key.as_str())
            .map(|book| Materialized::new(Arc::clone(book)))
    }
}
