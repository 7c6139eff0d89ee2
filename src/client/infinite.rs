//! Paginated queries: `{pages, pageParams}` grown one page at a time and
//! refreshed by replaying every recorded page param in order.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::histogram;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::fetch::{EntryPolicy, FetchStart, QueryOptions, Resolved, join_shared, query_option_setters};
use super::{Aborter, ClientState, InFlight, QueryClient, SharedFetch, spawn};
use crate::cache::{
    Counter, InfiniteData, KeyHash, METRIC_FETCH_MS, PageDirection, QueryData, QueryKey,
    RetryPolicy, run_with_retry,
};
use crate::error::QueryError;

/// Fetches one page for a page param. Implemented for any
/// `Fn(QueryData, CancellationToken) -> impl Future<Output = Result<QueryData, QueryError>>`.
pub trait PageFetcher: Send + Sync {
    fn fetch_page(
        &self,
        page_param: QueryData,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<QueryData, QueryError>>;
}

impl<F, Fut> PageFetcher for F
where
    F: Fn(QueryData, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<QueryData, QueryError>> + Send + 'static,
{
    fn fetch_page(
        &self,
        page_param: QueryData,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<QueryData, QueryError>> {
        Box::pin(self(page_param, token))
    }
}

/// Options for [`QueryClient::fetch_infinite_query`].
#[derive(Clone)]
pub struct InfiniteOptions {
    fetcher: Arc<dyn PageFetcher>,
    page_param: QueryData,
    direction: PageDirection,
    common: QueryOptions,
}

impl InfiniteOptions {
    pub fn new<F, Fut>(fetcher: F) -> Self
    where
        F: Fn(QueryData, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryData, QueryError>> + Send + 'static,
    {
        Self::with_fetcher(fetcher)
    }

    pub fn with_fetcher(fetcher: impl PageFetcher + 'static) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            page_param: QueryData::Null,
            direction: PageDirection::Init,
            common: QueryOptions::default(),
        }
    }

    pub fn page_param(mut self, page_param: impl Into<QueryData>) -> Self {
        self.page_param = page_param.into();
        self
    }

    /// `Init` replaces the pages, `Forward` appends, `Backward` prepends.
    pub fn direction(mut self, direction: PageDirection) -> Self {
        self.direction = direction;
        self
    }

    query_option_setters!();
}

struct PageRun {
    hash: KeyHash,
    key_string: String,
    id: u64,
    token: CancellationToken,
    retry: RetryPolicy,
    fetcher: Arc<dyn PageFetcher>,
    page_param: QueryData,
    direction: PageDirection,
    resolved: Resolved,
}

struct RefetchRun {
    hash: KeyHash,
    key_string: String,
    id: u64,
    token: CancellationToken,
    retry: RetryPolicy,
    fetcher: Arc<dyn PageFetcher>,
    page_params: Vec<QueryData>,
}

impl QueryClient {
    /// Fetch one page of an infinite query and merge it by direction.
    ///
    /// Fresh data is only served for `Init` requests that are not marked
    /// background. A stale `Init` request with background revalidation
    /// serves the cached pages and refetches every page.
    #[instrument(skip(self, options))]
    pub async fn fetch_infinite_query(
        &self,
        key: &QueryKey,
        options: InfiniteOptions,
    ) -> Result<InfiniteData, QueryError> {
        let hash = key.hash()?;
        let key_string = key.display_string()?;
        let data = self
            .begin_infinite(&hash, key, &key_string, options)?
            .resolve()
            .await?;
        Ok(InfiniteData::from_data(Some(&data)))
    }

    /// Refetch every recorded page, sequentially and in order. The pages are
    /// replaced only if every page succeeds. Returns `None` when the key has
    /// no cached pages or no page fetcher.
    #[instrument(skip(self))]
    pub async fn refetch_infinite_query(
        &self,
        key: &QueryKey,
    ) -> Result<Option<InfiniteData>, QueryError> {
        let hash = key.hash()?;
        match self.begin_refetch_infinite(&hash)? {
            Some(future) => {
                let data = future.await?;
                Ok(Some(InfiniteData::from_data(Some(&data))))
            }
            None => Ok(None),
        }
    }

    /// Direction of the page fetch in flight for `key`, if any.
    pub fn get_in_flight_direction(&self, key: &QueryKey) -> Result<Option<PageDirection>, QueryError> {
        let hash = key.hash()?;
        let state = self.lock("get_in_flight_direction");
        Ok(state
            .in_flight
            .get(&hash)
            .and_then(|in_flight| in_flight.direction))
    }

    fn begin_infinite(
        &self,
        hash: &str,
        key: &QueryKey,
        key_string: &str,
        options: InfiniteOptions,
    ) -> Result<FetchStart, QueryError> {
        let now = self.now();
        let mut guard = self.lock("fetch_infinite_query");
        let state = &mut *guard;

        let defaults = state.config.query_defaults_for(key_string);
        let InfiniteOptions {
            fetcher,
            page_param,
            direction,
            common,
        } = options;
        let resolved = common.resolve(&defaults);

        state.store.remember_key(hash, key);
        state
            .page_fetchers
            .insert(hash.to_string(), fetcher.clone());
        state
            .store
            .upsert(hash, || key_string.to_string(), |entry| resolved.policy.apply(entry));
        state.store.sync_tags(hash, resolved.policy.tags.as_ref());
        self.ensure_poller(state, hash, resolved.policy.refetch_interval_ms);

        let (cached, stale) = match state.store.get(hash) {
            Some(entry) => (entry.data.clone(), entry.is_stale(now)),
            None => (None, true),
        };
        let init = direction == PageDirection::Init;

        let start = if let Some(data) = cached
            .clone()
            .filter(|_| init && !stale && !resolved.background)
        {
            state.bump(Counter::Hits);
            state.store.touch(hash, now);
            debug!(key = %hash, "Infinite query cache hit");
            FetchStart::Ready(data)
        } else if let Some(future) = state
            .in_flight
            .get(hash)
            .map(|in_flight| in_flight.future.clone())
        {
            state.bump(Counter::Dedupes);
            debug!(key = %hash, "Joined in-flight page fetch");
            FetchStart::Pending(future)
        } else if let Some(data) = cached.filter(|_| {
            init && stale && (resolved.background || state.config.stale_while_revalidate)
        }) {
            state.bump(Counter::Hits);
            state.bump(Counter::BackgroundFetches);
            debug!(key = %hash, "Serving stale pages; refetching all pages");
            self.start_refetch_infinite(state, hash)?;
            state.store.touch(hash, now);
            FetchStart::Ready(data)
        } else {
            if resolved.abort_on_new_fetch {
                state.abort(hash);
            }
            state.bump(Counter::Misses);
            state.bump(Counter::Fetches);
            debug!(key = %hash, ?direction, "Fetching page");

            let id = state.next_id();
            let token = CancellationToken::new();
            let retry = state.retry_for(hash, resolved.policy.retry.as_ref());
            let task = spawn(run_page_fetch(
                self.clone(),
                PageRun {
                    hash: hash.to_string(),
                    key_string: key_string.to_string(),
                    id,
                    token: token.clone(),
                    retry,
                    fetcher,
                    page_param,
                    direction,
                    resolved,
                },
            ))?;
            let future = join_shared(task);
            state
                .aborters
                .insert(hash.to_string(), Aborter { id, token });
            state.in_flight.insert(
                hash.to_string(),
                InFlight {
                    id,
                    future: future.clone(),
                    direction: Some(direction),
                },
            );
            FetchStart::Pending(future)
        };

        self.settle(state);
        Ok(start)
    }

    /// Start (or join) a full refetch. `None` when there is nothing to
    /// refetch.
    pub(super) fn begin_refetch_infinite(&self, hash: &str) -> Result<Option<SharedFetch>, QueryError> {
        let mut guard = self.lock("refetch_infinite_query");
        let state = &mut *guard;
        let future = self.start_refetch_infinite(state, hash)?;
        self.settle(state);
        Ok(future)
    }

    fn start_refetch_infinite(
        &self,
        state: &mut ClientState,
        hash: &str,
    ) -> Result<Option<SharedFetch>, QueryError> {
        let Some(entry) = state.store.get(hash) else {
            return Ok(None);
        };
        let Some(fetcher) = state.page_fetchers.get(hash).cloned() else {
            return Ok(None);
        };
        let Some(data) = entry.data.as_ref() else {
            return Ok(None);
        };
        if let Some(in_flight) = state.in_flight.get(hash) {
            return Ok(Some(in_flight.future.clone()));
        }
        let page_params = InfiniteData::from_data(Some(data)).page_params;
        let key_string = entry.key_string.clone();

        let id = state.next_id();
        let token = CancellationToken::new();
        let retry = state.retry_for(hash, None);
        let task = spawn(run_refetch_infinite(
            self.clone(),
            RefetchRun {
                hash: hash.to_string(),
                key_string,
                id,
                token: token.clone(),
                retry,
                fetcher,
                page_params,
            },
        ))?;
        let future = join_shared(task);
        state
            .aborters
            .insert(hash.to_string(), Aborter { id, token });
        state.in_flight.insert(
            hash.to_string(),
            InFlight {
                id,
                future: future.clone(),
                direction: Some(PageDirection::Init),
            },
        );
        debug!(key = %hash, "Refetching all pages");
        Ok(Some(future))
    }

    /// Merge a fetched page into the pages cached at completion time.
    fn finish_page_fetch(
        &self,
        run: &PageRun,
        result: Result<QueryData, QueryError>,
    ) -> Result<QueryData, QueryError> {
        let now = self.now();
        let mut guard = self.lock("fetch_infinite_query.finish");
        let state = &mut *guard;

        let result = match result {
            Ok(page) => {
                let mut pages =
                    InfiniteData::from_data(state.store.get(&run.hash).and_then(|entry| entry.data.as_ref()));
                pages.apply(run.direction, page, run.page_param.clone());
                let policy: &EntryPolicy = &run.resolved.policy;
                let shared = state.store.set_data(
                    &run.hash,
                    || run.key_string.clone(),
                    pages.into_data(),
                    |entry| {
                        policy.apply(entry);
                        entry.error = None;
                        entry.fetched_at = Some(now);
                        entry.accessed_at = Some(now);
                    },
                );
                state.store.sync_tags(&run.hash, policy.tags.as_ref());
                state.evict_lru();
                state.store.request_flush();
                debug!(key = %run.hash, direction = ?run.direction, "Page fetch succeeded");
                Ok(shared)
            }
            Err(error) => {
                state.record_failure(&run.hash, &error, now);
                Err(error)
            }
        };

        state.release(&run.hash, run.id);
        self.settle(state);
        result
    }

    fn finish_refetch_infinite(
        &self,
        run: &RefetchRun,
        result: Result<Vec<QueryData>, QueryError>,
    ) -> Result<QueryData, QueryError> {
        let now = self.now();
        let mut guard = self.lock("refetch_infinite_query.finish");
        let state = &mut *guard;

        let result = match result {
            Ok(pages) => {
                let rebuilt = InfiniteData {
                    pages,
                    page_params: run.page_params.clone(),
                };
                let shared = state.store.set_data(
                    &run.hash,
                    || run.key_string.clone(),
                    rebuilt.into_data(),
                    |entry| {
                        entry.error = None;
                        entry.fetched_at = Some(now);
                        entry.accessed_at = Some(now);
                    },
                );
                state.store.request_flush();
                debug!(key = %run.hash, pages = run.page_params.len(), "Refetched all pages");
                Ok(shared)
            }
            Err(error) => {
                state.record_failure(&run.hash, &error, now);
                Err(error)
            }
        };

        state.release(&run.hash, run.id);
        self.settle(state);
        result
    }
}

#[instrument(skip_all, fields(key = %run.hash))]
async fn run_page_fetch(client: QueryClient, run: PageRun) -> Result<QueryData, QueryError> {
    let started = Instant::now();
    let result = run_with_retry(
        &run.retry,
        &run.token,
        |_| run.fetcher.fetch_page(run.page_param.clone(), run.token.clone()),
        |attempt, attempts| client.record_retry(&run.hash, attempt, attempts),
    )
    .await;
    histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    let result = client.finish_page_fetch(&run, result);
    run.resolved.callbacks.notify(&result);
    result
}

#[instrument(skip_all, fields(key = %run.hash, pages = run.page_params.len()))]
async fn run_refetch_infinite(client: QueryClient, run: RefetchRun) -> Result<QueryData, QueryError> {
    let started = Instant::now();
    let mut pages = Vec::with_capacity(run.page_params.len());
    let mut failure = None;
    for param in &run.page_params {
        let page = run_with_retry(
            &run.retry,
            &run.token,
            |_| run.fetcher.fetch_page(param.clone(), run.token.clone()),
            |attempt, attempts| client.record_retry(&run.hash, attempt, attempts),
        )
        .await;
        match page {
            Ok(page) => pages.push(page),
            Err(error) => {
                failure = Some(error);
                break;
            }
        }
    }
    histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    let result = match failure {
        Some(error) => Err(error),
        None => Ok(pages),
    };
    client.finish_refetch_infinite(&run, result)
}
