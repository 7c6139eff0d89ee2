//! Single-flight fetch protocol: fresh hit, in-flight dedupe,
//! stale-while-revalidate, network fetch.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::histogram;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{Aborter, ClientState, InFlight, QueryClient, SharedFetch, spawn};
use crate::cache::{
    Counter, DEFAULT_CACHE_TIME_MS, DEFAULT_STALE_TIME_MS, Entry, KeyHash, METRIC_FETCH_MS,
    QueryData, QueryKey, RetryPolicy, RetrySettings, run_with_retry,
};
use crate::config::QueryDefaultOptions;
use crate::error::QueryError;

/// Produces the data for one query. Implemented for any
/// `Fn(CancellationToken) -> impl Future<Output = Result<QueryData, QueryError>>`.
///
/// Fetchers should return promptly once the token is cancelled.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, token: CancellationToken) -> BoxFuture<'static, Result<QueryData, QueryError>>;
}

impl<F, Fut> Fetcher for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<QueryData, QueryError>> + Send + 'static,
{
    fn fetch(&self, token: CancellationToken) -> BoxFuture<'static, Result<QueryData, QueryError>> {
        Box::pin(self(token))
    }
}

pub type SuccessCallback = Arc<dyn Fn(&QueryData) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;
pub type SettledCallback = Arc<dyn Fn(Option<&QueryData>, Option<&QueryError>) + Send + Sync>;

#[derive(Clone, Default)]
pub(super) struct Callbacks {
    pub(super) on_success: Option<SuccessCallback>,
    pub(super) on_error: Option<ErrorCallback>,
    pub(super) on_settled: Option<SettledCallback>,
}

impl Callbacks {
    /// Cancellations are not reported.
    pub(super) fn notify(&self, result: &Result<QueryData, QueryError>) {
        match result {
            Ok(data) => {
                if let Some(on_success) = &self.on_success {
                    on_success(data);
                }
                if let Some(on_settled) = &self.on_settled {
                    on_settled(Some(data), None);
                }
            }
            Err(error) if error.is_cancelled() => {}
            Err(error) => {
                if let Some(on_error) = &self.on_error {
                    on_error(error);
                }
                if let Some(on_settled) = &self.on_settled {
                    on_settled(None, Some(error));
                }
            }
        }
    }
}

/// Options shared by plain and infinite queries.
#[derive(Clone, Default)]
pub(super) struct QueryOptions {
    pub(super) stale_time_ms: Option<u64>,
    pub(super) cache_time_ms: Option<u64>,
    pub(super) tags: Option<Vec<String>>,
    pub(super) retry: Option<RetryPolicy>,
    pub(super) refetch_interval_ms: Option<u64>,
    pub(super) background: Option<bool>,
    pub(super) abort_on_new_fetch: Option<bool>,
    pub(super) meta: Option<QueryData>,
    pub(super) callbacks: Callbacks,
}

impl QueryOptions {
    /// Explicit options win over prefix defaults, which win over built-ins.
    pub(super) fn resolve(self, defaults: &QueryDefaultOptions) -> Resolved {
        let tags = self
            .tags
            .or_else(|| defaults.tags.clone())
            .map(|tags| tags.into_iter().collect());
        Resolved {
            policy: EntryPolicy {
                stale_time: self
                    .stale_time_ms
                    .or(defaults.stale_time_ms)
                    .unwrap_or(DEFAULT_STALE_TIME_MS),
                cache_time: self
                    .cache_time_ms
                    .or(defaults.cache_time_ms)
                    .unwrap_or(DEFAULT_CACHE_TIME_MS),
                refetch_interval_ms: self.refetch_interval_ms.or(defaults.refetch_interval_ms),
                tags,
                retry: self.retry.or_else(|| defaults.retry.map(RetryPolicy::from)),
                meta: self.meta,
            },
            background: self.background.or(defaults.background).unwrap_or(false),
            abort_on_new_fetch: self
                .abort_on_new_fetch
                .or(defaults.abort_on_new_fetch)
                .unwrap_or(true),
            callbacks: self.callbacks,
        }
    }
}

/// Entry fields written on every call and again on success.
#[derive(Clone)]
pub(super) struct EntryPolicy {
    pub(super) stale_time: u64,
    pub(super) cache_time: u64,
    pub(super) refetch_interval_ms: Option<u64>,
    pub(super) tags: Option<BTreeSet<String>>,
    pub(super) retry: Option<RetryPolicy>,
    pub(super) meta: Option<QueryData>,
}

impl EntryPolicy {
    pub(super) fn apply(&self, entry: &mut Entry) {
        entry.stale_time = self.stale_time;
        entry.cache_time = self.cache_time;
        entry.refetch_interval_ms = self.refetch_interval_ms;
        if let Some(tags) = &self.tags {
            entry.tags.clone_from(tags);
        }
        if let Some(retry) = &self.retry {
            entry.retry = Some(retry.settings());
        }
        if let Some(meta) = &self.meta {
            entry.meta = Some(meta.clone());
        }
    }
}

#[derive(Clone)]
pub(super) struct Resolved {
    pub(super) policy: EntryPolicy,
    pub(super) background: bool,
    pub(super) abort_on_new_fetch: bool,
    pub(super) callbacks: Callbacks,
}

/// Builder methods for the options shared by plain and infinite queries.
macro_rules! query_option_setters {
    () => {
        /// Milliseconds after a successful fetch before the data counts as
        /// stale.
        pub fn stale_time_ms(mut self, ms: u64) -> Self {
            self.common.stale_time_ms = Some(ms);
            self
        }

        /// Milliseconds after a successful fetch before gc may drop the entry.
        pub fn cache_time_ms(mut self, ms: u64) -> Self {
            self.common.cache_time_ms = Some(ms);
            self
        }

        /// Replace the entry's tags.
        pub fn tags<I, S>(mut self, tags: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.common.tags = Some(tags.into_iter().map(Into::into).collect());
            self
        }

        pub fn retry(mut self, policy: $crate::cache::RetryPolicy) -> Self {
            self.common.retry = Some(policy);
            self
        }

        /// Poll the query every `ms` milliseconds; zero disables polling.
        pub fn refetch_interval_ms(mut self, ms: u64) -> Self {
            self.common.refetch_interval_ms = Some(ms);
            self
        }

        /// Serve stale data immediately and revalidate in the background.
        pub fn background(mut self, background: bool) -> Self {
            self.common.background = Some(background);
            self
        }

        pub fn abort_on_new_fetch(mut self, abort: bool) -> Self {
            self.common.abort_on_new_fetch = Some(abort);
            self
        }

        pub fn meta(mut self, meta: impl Into<$crate::cache::QueryData>) -> Self {
            self.common.meta = Some(meta.into());
            self
        }

        pub fn on_success(
            mut self,
            f: impl Fn(&$crate::cache::QueryData) + Send + Sync + 'static,
        ) -> Self {
            self.common.callbacks.on_success = Some(::std::sync::Arc::new(f));
            self
        }

        pub fn on_error(
            mut self,
            f: impl Fn(&$crate::error::QueryError) + Send + Sync + 'static,
        ) -> Self {
            self.common.callbacks.on_error = Some(::std::sync::Arc::new(f));
            self
        }

        pub fn on_settled(
            mut self,
            f: impl Fn(Option<&$crate::cache::QueryData>, Option<&$crate::error::QueryError>)
            + Send
            + Sync
            + 'static,
        ) -> Self {
            self.common.callbacks.on_settled = Some(::std::sync::Arc::new(f));
            self
        }
    };
}

pub(super) use query_option_setters;

/// Options for [`QueryClient::fetch_query`].
#[derive(Clone)]
pub struct FetchOptions {
    fetcher: Arc<dyn Fetcher>,
    common: QueryOptions,
    skip_stale_while_revalidate: bool,
}

impl FetchOptions {
    pub fn new<F, Fut>(fetcher: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryData, QueryError>> + Send + 'static,
    {
        Self::with_fetcher(fetcher)
    }

    pub fn with_fetcher(fetcher: impl Fetcher + 'static) -> Self {
        Self::from_arc(Arc::new(fetcher))
    }

    pub fn from_arc(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            common: QueryOptions::default(),
            skip_stale_while_revalidate: false,
        }
    }

    query_option_setters!();

    /// Never serve stale data; a stale entry is refetched in the foreground.
    pub fn skip_stale_while_revalidate(mut self, skip: bool) -> Self {
        self.skip_stale_while_revalidate = skip;
        self
    }
}

/// Options for [`QueryClient::set_query_data`]. Unset fields keep the
/// entry's current values.
#[derive(Debug, Clone, Default)]
pub struct SetDataOptions {
    /// Defaults to now.
    pub fetched_at: Option<u64>,
    pub stale_time_ms: Option<u64>,
    pub cache_time_ms: Option<u64>,
    pub refetch_interval_ms: Option<u64>,
    pub tags: Option<Vec<String>>,
    pub retry: Option<RetrySettings>,
    pub meta: Option<QueryData>,
}

impl SetDataOptions {
    pub fn fetched_at(mut self, fetched_at: u64) -> Self {
        self.fetched_at = Some(fetched_at);
        self
    }

    pub fn stale_time_ms(mut self, ms: u64) -> Self {
        self.stale_time_ms = Some(ms);
        self
    }

    pub fn cache_time_ms(mut self, ms: u64) -> Self {
        self.cache_time_ms = Some(ms);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn meta(mut self, meta: impl Into<QueryData>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    pub(super) fn apply(
        &self,
        entry: &mut Entry,
        defaults: &QueryDefaultOptions,
        tags: Option<&BTreeSet<String>>,
        now: u64,
    ) {
        entry.error = None;
        entry.fetched_at = Some(self.fetched_at.unwrap_or(now));
        entry.accessed_at = Some(now);
        if let Some(ms) = self.stale_time_ms.or(defaults.stale_time_ms) {
            entry.stale_time = ms;
        }
        if let Some(ms) = self.cache_time_ms.or(defaults.cache_time_ms) {
            entry.cache_time = ms;
        }
        if let Some(ms) = self.refetch_interval_ms {
            entry.refetch_interval_ms = Some(ms);
        }
        if let Some(tags) = tags {
            entry.tags.clone_from(tags);
        }
        if let Some(retry) = self.retry {
            entry.retry = Some(retry);
        }
        if let Some(meta) = &self.meta {
            entry.meta = Some(meta.clone());
        }
    }
}

/// Outcome of the synchronous half of a fetch.
pub(super) enum FetchStart {
    Ready(QueryData),
    Pending(SharedFetch),
}

impl FetchStart {
    pub(super) async fn resolve(self) -> Result<QueryData, QueryError> {
        match self {
            FetchStart::Ready(data) => Ok(data),
            FetchStart::Pending(future) => future.await,
        }
    }
}

/// What a poll or stale sweep should rerun for an entry.
pub(super) enum PollTarget {
    Query {
        key_string: String,
        options: Box<FetchOptions>,
    },
    Infinite,
}

impl PollTarget {
    /// Needs the entry and a registered fetcher. Polls always run as
    /// background fetches without stale-while-revalidate.
    pub(super) fn for_entry(state: &ClientState, hash: &str) -> Option<Self> {
        let entry = state.store.get(hash)?;
        if state.page_fetchers.contains_key(hash) {
            return Some(Self::Infinite);
        }
        let fetcher = state.fetchers.get(hash)?.clone();
        let mut options = FetchOptions::from_arc(fetcher)
            .stale_time_ms(entry.stale_time)
            .cache_time_ms(entry.cache_time)
            .tags(entry.tags.iter().cloned())
            .background(true)
            .skip_stale_while_revalidate(true);
        options.common.refetch_interval_ms = entry.refetch_interval_ms;
        Some(Self::Query {
            key_string: entry.key_string.clone(),
            options: Box::new(options),
        })
    }
}

pub(super) fn join_shared(task: JoinHandle<Result<QueryData, QueryError>>) -> SharedFetch {
    async move {
        match task.await {
            Ok(result) => result,
            Err(error) => Err(QueryError::Task(error.to_string())),
        }
    }
    .boxed()
    .shared()
}

struct FetchRun {
    hash: KeyHash,
    key_string: String,
    id: u64,
    token: CancellationToken,
    retry: RetryPolicy,
    fetcher: Arc<dyn Fetcher>,
    resolved: Resolved,
}

impl ClientState {
    /// Terminal bookkeeping for a failed fetch. Entries removed meanwhile are
    /// not recreated.
    pub(super) fn record_failure(&mut self, hash: &str, error: &QueryError, now: u64) {
        if error.is_cancelled() {
            self.bump(Counter::Aborts);
            self.store.update(hash, |entry| {
                entry.error = Some(error.clone());
                entry.last_abort_at = Some(now);
            });
            debug!(key = %hash, "Fetch aborted");
        } else {
            self.bump(Counter::Errors);
            self.store.update(hash, |entry| entry.error = Some(error.clone()));
            warn!(key = %hash, error = %error, "Fetch failed");
        }
        self.store.request_flush();
    }

    /// Free the in-flight and cancellation slots if they still belong to
    /// fetch `id`.
    pub(super) fn release(&mut self, hash: &str, id: u64) {
        if self
            .in_flight
            .get(hash)
            .is_some_and(|in_flight| in_flight.id == id)
        {
            self.in_flight.remove(hash);
        }
        if self
            .aborters
            .get(hash)
            .is_some_and(|aborter| aborter.id == id)
        {
            self.aborters.remove(hash);
        }
    }
}

impl QueryClient {
    /// Fetch `key`, serving fresh cached data and joining any fetch already
    /// in flight. Errors from the fetcher are returned after the retry policy
    /// gives up; previously cached data stays in the entry.
    #[instrument(skip(self, options))]
    pub async fn fetch_query(
        &self,
        key: &QueryKey,
        options: FetchOptions,
    ) -> Result<QueryData, QueryError> {
        let hash = key.hash()?;
        let key_string = key.display_string()?;
        self.begin_fetch(&hash, Some(key), &key_string, options)?
            .resolve()
            .await
    }

    /// Foreground fetch that warms the cache without returning data.
    #[instrument(skip(self, options))]
    pub async fn prefetch_query(
        &self,
        key: &QueryKey,
        options: FetchOptions,
    ) -> Result<(), QueryError> {
        {
            let mut state = self.lock("prefetch_query");
            state.bump(Counter::Prefetched);
        }
        self.fetch_query(key, options.background(false))
            .await
            .map(|_| ())
    }

    /// Like [`fetch_query`](Self::fetch_query), but a failed fetch falls
    /// back to previously cached data unless `throw_on_error` is set.
    #[instrument(skip(self, options))]
    pub async fn get_or_fetch(
        &self,
        key: &QueryKey,
        options: FetchOptions,
    ) -> Result<QueryData, QueryError> {
        let hash = key.hash()?;
        let error = match self.fetch_query(key, options).await {
            Ok(data) => return Ok(data),
            Err(error) => error,
        };
        let fallback = {
            let state = self.lock("get_or_fetch");
            if state.config.throw_on_error {
                None
            } else {
                state.store.get(&hash).and_then(|entry| entry.data.clone())
            }
        };
        match fallback {
            Some(data) => {
                debug!(key = %hash, error = %error, "Serving stale data after failed fetch");
                Ok(data)
            }
            None => Err(error),
        }
    }

    /// Synchronous half of a fetch: side effects and the hit/dedupe/
    /// background/fetch decision, all under one lock.
    pub(super) fn begin_fetch(
        &self,
        hash: &str,
        key: Option<&QueryKey>,
        key_string: &str,
        options: FetchOptions,
    ) -> Result<FetchStart, QueryError> {
        let now = self.now();
        let mut guard = self.lock("fetch_query");
        let state = &mut *guard;

        let defaults = state.config.query_defaults_for(key_string);
        let FetchOptions {
            fetcher,
            common,
            skip_stale_while_revalidate,
        } = options;
        let resolved = common.resolve(&defaults);

        if let Some(key) = key {
            state.store.remember_key(hash, key);
        }
        state.fetchers.insert(hash.to_string(), fetcher.clone());
        state
            .store
            .upsert(hash, || key_string.to_string(), |entry| resolved.policy.apply(entry));
        state.store.sync_tags(hash, resolved.policy.tags.as_ref());
        self.ensure_poller(state, hash, resolved.policy.refetch_interval_ms);

        let (cached, stale) = match state.store.get(hash) {
            Some(entry) => (entry.data.clone(), entry.is_stale(now)),
            None => (None, true),
        };
        let revalidate_in_background = !skip_stale_while_revalidate
            && (resolved.background || state.config.stale_while_revalidate);

        let start = if let Some(data) = cached.clone().filter(|_| !stale) {
            state.bump(Counter::Hits);
            state.store.touch(hash, now);
            debug!(key = %hash, "Query cache hit");
            FetchStart::Ready(data)
        } else if let Some(future) = state
            .in_flight
            .get(hash)
            .map(|in_flight| in_flight.future.clone())
        {
            state.bump(Counter::Dedupes);
            debug!(key = %hash, "Joined in-flight fetch");
            FetchStart::Pending(future)
        } else if let Some(data) = cached.filter(|_| revalidate_in_background) {
            state.bump(Counter::Hits);
            state.bump(Counter::BackgroundFetches);
            debug!(key = %hash, "Serving stale data; revalidating in background");
            self.start_network_fetch(state, hash, key_string, fetcher, resolved)?;
            state.store.touch(hash, now);
            FetchStart::Ready(data)
        } else {
            FetchStart::Pending(self.start_network_fetch(state, hash, key_string, fetcher, resolved)?)
        };

        self.settle(state);
        Ok(start)
    }

    fn start_network_fetch(
        &self,
        state: &mut ClientState,
        hash: &str,
        key_string: &str,
        fetcher: Arc<dyn Fetcher>,
        resolved: Resolved,
    ) -> Result<SharedFetch, QueryError> {
        if resolved.abort_on_new_fetch {
            state.abort(hash);
        }
        state.bump(Counter::Misses);
        state.bump(Counter::Fetches);
        debug!(key = %hash, "Query cache miss; fetching");

        let id = state.next_id();
        let token = CancellationToken::new();
        let retry = state.retry_for(hash, resolved.policy.retry.as_ref());
        let task = spawn(run_fetch(
            self.clone(),
            FetchRun {
                hash: hash.to_string(),
                key_string: key_string.to_string(),
                id,
                token: token.clone(),
                retry,
                fetcher,
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
                direction: None,
            },
        );
        Ok(future)
    }

    pub(super) fn record_retry(&self, hash: &str, attempt: u32, attempts: u32) {
        let mut state = self.lock("retry");
        state.bump(Counter::Retries);
        self.settle(&mut state);
        debug!(key = %hash, attempt, attempts, "Retrying");
    }

    fn finish_fetch(
        &self,
        hash: &str,
        key_string: &str,
        id: u64,
        policy: &EntryPolicy,
        result: Result<QueryData, QueryError>,
    ) -> Result<QueryData, QueryError> {
        let now = self.now();
        let mut guard = self.lock("fetch.finish");
        let state = &mut *guard;

        let result = match result {
            Ok(data) => {
                let shared = state.store.set_data(hash, || key_string.to_string(), data, |entry| {
                    policy.apply(entry);
                    entry.error = None;
                    entry.fetched_at = Some(now);
                    entry.accessed_at = Some(now);
                });
                state.store.sync_tags(hash, policy.tags.as_ref());
                state.evict_lru();
                state.store.request_flush();
                debug!(key = %hash, "Fetch succeeded");
                Ok(shared)
            }
            Err(error) => {
                state.record_failure(hash, &error, now);
                Err(error)
            }
        };

        state.release(hash, id);
        self.settle(state);
        result
    }

    /// Kick off a background revalidation for a poll or stale sweep.
    pub(super) fn start_revalidation(&self, hash: &str, target: PollTarget) -> Result<(), QueryError> {
        match target {
            PollTarget::Query {
                key_string,
                options,
            } => {
                self.begin_fetch(hash, None, &key_string, *options)?;
            }
            PollTarget::Infinite => {
                self.begin_refetch_infinite(hash)?;
            }
        }
        Ok(())
    }
}

#[instrument(skip_all, fields(key = %run.hash))]
async fn run_fetch(client: QueryClient, run: FetchRun) -> Result<QueryData, QueryError> {
    let FetchRun {
        hash,
        key_string,
        id,
        token,
        retry,
        fetcher,
        resolved,
    } = run;

    let started = Instant::now();
    let result = run_with_retry(
        &retry,
        &token,
        |_| fetcher.fetch(token.clone()),
        |attempt, attempts| client.record_retry(&hash, attempt, attempts),
    )
    .await;
    histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    let result = client.finish_fetch(&hash, &key_string, id, &resolved.policy, result);
    resolved.callbacks.notify(&result);
    result
}
