use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;

use requery::{
    CachedQuery, Constraints, LookupRequest, Materialized, QueryCache, QueryCacheConfig,
    QueryError, QueryResponse, QueryResult, StoreRepository, StoreRequest,
};
use requery_test::{Book, BookQuery, Script};

use requery_test as test;

fn book_cache(query: &BookQuery, config: QueryCacheConfig) -> QueryCache<BookQuery> {
    QueryCache::new(query.clone(), config).unwrap()
}

#[tokio::test]
async fn test_first_access_suspends_and_queries_once() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    query.set_delay(Duration::from_millis(50));
    let cache = book_cache(&query, QueryCacheConfig::default());
    let args = "0".to_string();

    let handle = match cache.fetch(&args) {
        QueryResult::Pending(handle) => handle,
        _ => panic!("first access must be pending"),
    };
    // a concurrent caller shares the in-flight operation instead of
    // issuing another one
    assert!(cache.fetch(&args).is_pending());

    handle.await.unwrap();

    let result = cache.fetch(&args).into_ready().unwrap();
    assert_eq!(result.data.title, "Dune");
    assert_eq!(query.invocations(), 1);
}

#[tokio::test]
async fn test_cached_result_is_reference_stable() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    let cache = book_cache(&query, QueryCacheConfig::default());
    let args = "0".to_string();

    let first = cache.resolve(&args).await.unwrap();
    let second = cache.fetch(&args).into_ready().unwrap();

    assert!(Arc::ptr_eq(&first.data, &second.data));
    assert_eq!(query.invocations(), 1);
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_operation() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    query.set_delay(Duration::from_millis(20));
    let cache = book_cache(&query, QueryCacheConfig::default());
    let args = "0".to_string();

    let (a, b) = tokio::join!(cache.resolve(&args), cache.resolve(&args));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a.data, &b.data));
    assert_eq!(query.invocations(), 1);
}

#[tokio::test]
async fn test_priming_satisfies_without_querying() {
    test::setup();

    let query = BookQuery::new();
    query.shelve("getBook#id#7", Book::new("7", "Foundation"));
    let cache = book_cache(
        &query,
        QueryCacheConfig {
            primable: true,
            ..Default::default()
        },
    );
    let args = "7".to_string();

    let primed = cache.fetch(&args).into_ready().unwrap();
    assert_eq!(primed.data.title, "Foundation");

    // the primed entry satisfies repeat accesses as well
    let again = cache.fetch(&args).into_ready().unwrap();
    assert!(Arc::ptr_eq(&primed.data, &again.data));
    assert_eq!(query.invocations(), 0);
}

#[tokio::test]
async fn test_priming_disabled_still_queries() {
    test::setup();

    let query = BookQuery::new();
    query.script("7", Script::Ok(Book::new("7", "Foundation")));
    query.shelve("getBook#id#7", Book::new("7", "Foundation (stale)"));
    let cache = book_cache(&query, QueryCacheConfig::default());
    let args = "7".to_string();

    let result = cache.resolve(&args).await.unwrap();
    assert_eq!(result.data.title, "Foundation");
    assert_eq!(query.invocations(), 1);
}

#[tokio::test]
async fn test_response_validation_failures() {
    test::setup();

    let query = BookQuery::new();
    query.script(
        "a",
        Script::Status(500, Some("Internal Server Error".into())),
    );
    query.script("b", Script::Error("flagged by upstream".into()));
    query.script("c", Script::MissingData);
    let cache = book_cache(&query, QueryCacheConfig::default());

    let err = cache.resolve(&"a".to_string()).await.unwrap_err();
    assert_eq!(err.to_string(), "(500) Response failed: Internal Server Error");

    let err = cache.resolve(&"b".to_string()).await.unwrap_err();
    assert_eq!(err.to_string(), "(200) Response failed: flagged by upstream");

    let err = cache.resolve(&"c".to_string()).await.unwrap_err();
    assert_eq!(err.to_string(), "(200) Response failed");
}

#[tokio::test]
async fn test_failures_are_terminal_until_invalidated() {
    test::setup();

    let query = BookQuery::new();
    query.script("x", Script::Transport("connection reset".into()));
    let cache = book_cache(&query, QueryCacheConfig::default());
    let args = "x".to_string();

    let err = cache.resolve(&args).await.unwrap_err();
    assert!(matches!(err, QueryError::Transport(_)));
    assert_eq!(query.invocations(), 1);

    // fixing the upstream does not help: the failure entry replays without
    // re-querying, and it never expires
    query.script("x", Script::Ok(Book::new("x", "Hyperion")));
    assert!(matches!(cache.fetch(&args), QueryResult::Failed(_)));
    assert_eq!(query.invocations(), 1);

    cache.invalidate(&args);
    let result = cache.resolve(&args).await.unwrap();
    assert_eq!(result.data.title, "Hyperion");
    assert_eq!(query.invocations(), 2);
}

#[tokio::test]
async fn test_enforced_max_delay_becomes_a_stable_timeout() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    query.set_delay(Duration::from_millis(50));
    let cache = book_cache(
        &query,
        QueryCacheConfig {
            constraints: Constraints {
                enforce: true,
                max_delay: Some(Duration::from_millis(10)),
            },
            ..Default::default()
        },
    );
    let args = "0".to_string();

    let err = cache.resolve(&args).await.unwrap_err();
    match &err {
        QueryError::Timeout { query, key, .. } => {
            assert_eq!(query, "getBook");
            assert_eq!(key.as_str(), "getBook#id#0");
        }
        other => panic!("expected a timeout, got {other}"),
    }

    // stable across accesses, without another query
    assert!(matches!(
        cache.fetch(&args),
        QueryResult::Failed(QueryError::Timeout { .. })
    ));
    assert_eq!(query.invocations(), 1);

    // explicit invalidation is the only way out
    query.set_delay(Duration::ZERO);
    cache.invalidate(&args);
    let result = cache.resolve(&args).await.unwrap();
    assert_eq!(result.data.title, "Dune");
    assert_eq!(query.invocations(), 2);
}

#[tokio::test]
async fn test_enforced_timeout_is_never_observed_as_ready() {
    test::setup();

    // an operation that must time out settles while another thread hammers
    // the synchronous accessor; no interleaving may serve it as ready
    for _ in 0..100 {
        let query = BookQuery::new();
        query.script("0", Script::Ok(Book::new("0", "Dune")));
        query.set_delay(Duration::from_millis(2));
        let cache = book_cache(
            &query,
            QueryCacheConfig {
                constraints: Constraints {
                    enforce: true,
                    max_delay: Some(Duration::from_millis(1)),
                },
                ..Default::default()
            },
        );
        let args = "0".to_string();

        assert!(cache.fetch(&args).is_pending());

        let watcher = {
            let cache = cache.clone();
            let args = args.clone();
            std::thread::spawn(move || loop {
                match cache.fetch(&args) {
                    QueryResult::Ready(_) => break true,
                    QueryResult::Failed(_) => break false,
                    QueryResult::Pending(_) => std::thread::yield_now(),
                }
            })
        };

        assert!(matches!(
            cache.resolve(&args).await.unwrap_err(),
            QueryError::Timeout { .. }
        ));
        assert!(
            !watcher.join().unwrap(),
            "a concurrent access served a result that must be an enforced timeout"
        );
    }
}

#[tokio::test]
async fn test_unenforced_max_delay_only_logs() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    query.set_delay(Duration::from_millis(50));
    let cache = book_cache(
        &query,
        QueryCacheConfig {
            constraints: Constraints {
                enforce: false,
                max_delay: Some(Duration::from_millis(10)),
            },
            ..Default::default()
        },
    );

    let result = cache.resolve(&"0".to_string()).await.unwrap();
    assert_eq!(result.data.title, "Dune");
}

#[tokio::test]
async fn test_expiry_evicts_and_requeries() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    let cache = book_cache(
        &query,
        QueryCacheConfig {
            duration: Duration::from_millis(50),
            ..Default::default()
        },
    );
    let args = "0".to_string();

    cache.resolve(&args).await.unwrap();
    assert!(cache.fetch(&args).is_ready());
    assert_eq!(query.invocations(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    // the entry and its probe are gone; this access starts over
    assert!(cache.fetch(&args).is_pending());
    cache.resolve(&args).await.unwrap();
    assert_eq!(query.invocations(), 2);
}

#[tokio::test]
async fn test_settled_operation_serves_without_data_cache() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    let cache = book_cache(&query, QueryCacheConfig::default());
    let args = "0".to_string();

    cache.resolve(&args).await.unwrap();
    query.unshelve("getBook#id#0");

    // the probe replays the settled operation's result
    let replayed = cache.fetch(&args).into_ready().unwrap();
    assert_eq!(replayed.data.title, "Dune");
    assert_eq!(query.invocations(), 1);
}

#[tokio::test]
async fn test_host_owned_store() -> Result<()> {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    let store = requery::LocalStore::new();
    let cache = QueryCache::with_store(query.clone(), QueryCacheConfig::default(), store.clone())?;
    let args = "0".to_string();

    cache.resolve(&args).await?;

    // the host observes the bookkeeping the engine wrote
    assert_eq!(store.read(|store| store.len()), 1);
    store.update(|store| store.evict(&"getBook#id#0".into()));
    assert!(cache.fetch(&args).is_pending());

    Ok(())
}

#[tokio::test]
async fn test_render_with_hands_out_the_current_result() {
    test::setup();

    let query = BookQuery::new();
    query.script("0", Script::Ok(Book::new("0", "Dune")));
    let cache = book_cache(&query, QueryCacheConfig::default());
    let args = "0".to_string();

    let rendered = cache.render_with(&args, |result| match result {
        QueryResult::Pending(_) => "loading".to_string(),
        QueryResult::Ready(book) => book.data.title.clone(),
        QueryResult::Failed(error) => error.to_string(),
    });
    assert_eq!(rendered, "loading");

    cache.resolve(&args).await.unwrap();
    let rendered = cache.render_with(&args, |result| match result {
        QueryResult::Ready(book) => book.data.title.clone(),
        _ => panic!("expected a ready result"),
    });
    assert_eq!(rendered, "Dune");
}

/// A paginated feed whose shaped results install a fetch-more hook that
/// re-enters the coordinator for the next page.
#[derive(Clone)]
struct FeedQuery {
    pages: Arc<Vec<Vec<u32>>>,
    cache: Arc<Mutex<HashMap<String, Arc<Page>>>>,
    invocations: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Page {
    items: Vec<u32>,
    next: Option<u32>,
}

impl FeedQuery {
    fn new(pages: Vec<Vec<u32>>) -> Self {
        Self {
            pages: Arc::new(pages),
            cache: Default::default(),
            invocations: Default::default(),
        }
    }

    fn fetch_more_hook(
        &self,
        page: &Arc<Page>,
        requester: &requery::Requester<Self>,
    ) -> Materialized<Page> {
        let materialized = Materialized::new(Arc::clone(page));
        match page.next {
            Some(next) => {
                let requester = requester.clone();
                materialized.with_fetch_more(Arc::new(move || {
                    let requester = requester.clone();
                    async move { requester.request(next)?.shared().await }.boxed()
                }))
            }
            None => materialized,
        }
    }
}

impl CachedQuery for FeedQuery {
    type Args = u32;
    type Data = Page;
    type Item = Page;

    fn name(&self) -> &str {
        "getFeed"
    }

    fn cache_id(&self, args: &u32) -> String {
        format!("getFeed#page#{args}")
    }

    fn query(&self, args: u32) -> BoxFuture<'static, Result<QueryResponse<Page>, QueryError>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let page = self.pages.get(args as usize).cloned();
        let next = (args as usize + 1 < self.pages.len()).then_some(args + 1);

        async move {
            match page {
                Some(items) => Ok(QueryResponse::ok(Page { items, next })),
                None => Ok(QueryResponse {
                    status: 404,
                    data: None,
                    error: Some(format!("no page {args}")),
                }),
            }
        }
        .boxed()
    }

    fn store(&self, request: StoreRequest<'_, Self>) -> Materialized<Page> {
        let page = Arc::new(request.data);
        self.cache
            .lock()
            .unwrap()
            .insert(request.key.as_str().to_owned(), Arc::clone(&page));
        self.fetch_more_hook(&page, &request.requester)
    }

    fn lookup(&self, request: LookupRequest<'_, Self>) -> Option<Materialized<Page>> {
        let page = self.cache.lock().unwrap().get(request.key.as_str()).cloned();
        page.map(|page| self.fetch_more_hook(&page, request.requester))
    }
}

#[tokio::test]
async fn test_fetch_more_pages_through_the_coordinator() {
    test::setup();

    let feed = FeedQuery::new(vec![vec![1, 2], vec![3, 4], vec![5]]);
    let cache = QueryCache::new(feed.clone(), QueryCacheConfig::default()).unwrap();

    let first = cache.resolve(&0).await.unwrap();
    assert_eq!(first.data.items, vec![1, 2]);

    let second = first.fetch_more.as_ref().unwrap()().await.unwrap();
    assert_eq!(second.data.items, vec![3, 4]);

    // the follow-up went through the same bookkeeping, so page 1 is cached
    assert!(cache.fetch(&1).is_ready());
    assert_eq!(feed.invocations.load(Ordering::SeqCst), 2);

    let third = second.fetch_more.as_ref().unwrap()().await.unwrap();
    assert_eq!(third.data.items, vec![5]);
    assert!(third.fetch_more.is_none());
}
