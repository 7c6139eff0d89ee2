//! The query client: fetch, mutation and invalidation orchestration on top of
//! the entry store.
//!
//! All bookkeeping lives in one `ClientState` behind a mutex that is only held
//! for synchronous sections. Fetchers and mutation functions run on spawned
//! tasks, so dropping a caller's future never strands an in-flight slot or an
//! optimistic write. Caller-supplied updaters and selectors run while the
//! state lock is held and must not call back into the client.

mod fetch;
mod infinite;
mod mutation;
mod persistence;
mod sync;

pub use fetch::{
    ErrorCallback, FetchOptions, Fetcher, SetDataOptions, SettledCallback, SuccessCallback,
};
pub use infinite::{InfiniteOptions, PageFetcher};
pub use mutation::{
    CachePatch, MUTATION_KEY, MutateOptions, MutationFn, MutationRecord, MutationStatus,
    OptimisticUpdate,
};
pub use persistence::VersionCheck;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use metrics::gauge;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::lock::mutex_lock;
use crate::cache::{
    Clock, Counter, EntryStore, KeyHash, METRIC_ENTRIES, Metrics, PageDirection, QueryData,
    QueryKey, QueryState, RetryPolicy, Selector, SelectorMemo, SystemClock,
};
use crate::config::ClientConfig;
use crate::error::QueryError;
use crate::persist::{PersistenceBackend, backend_for};
use crate::sync::{BroadcastSyncChannel, SyncChannel, SyncKind, SyncMessage};

use fetch::PollTarget;
use persistence::VersionGuard;

const SOURCE: &str = "yokai_query::client";

pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<QueryData, QueryError>>>;

struct InFlight {
    id: u64,
    future: SharedFetch,
    direction: Option<PageDirection>,
}

struct Aborter {
    id: u64,
    token: CancellationToken,
}

struct Poller {
    interval_ms: u64,
    handle: JoinHandle<()>,
}

/// Whether an invalidation started here or is a replay of a peer's message.
/// Replays are never re-broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Local,
    Remote,
}

/// Observable summary published on every committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub query_keys: Vec<KeyHash>,
    pub in_flight_keys: Vec<KeyHash>,
    pub mutation_keys: Vec<KeyHash>,
    pub metrics: Metrics,
    pub config: ClientConfig,
}

struct ClientState {
    config: ClientConfig,
    default_retry: RetryPolicy,
    store: EntryStore,
    metrics: Metrics,
    in_flight: HashMap<KeyHash, InFlight>,
    aborters: HashMap<KeyHash, Aborter>,
    mutation_aborters: HashMap<KeyHash, Aborter>,
    fetchers: HashMap<KeyHash, Arc<dyn Fetcher>>,
    page_fetchers: HashMap<KeyHash, Arc<dyn PageFetcher>>,
    pollers: HashMap<KeyHash, Poller>,
    mutations: HashMap<KeyHash, MutationRecord>,
    version_guard: Option<VersionGuard>,
    flush_task: Option<JoinHandle<()>>,
    next_id: u64,
    /// Highest run id issued before the last `clear`.
    cleared_through: u64,
}

impl ClientState {
    fn new(config: ClientConfig, default_retry: RetryPolicy) -> Self {
        let store = EntryStore::new(config.structural_sharing);
        Self {
            config,
            default_retry,
            store,
            metrics: Metrics::default(),
            in_flight: HashMap::new(),
            aborters: HashMap::new(),
            mutation_aborters: HashMap::new(),
            fetchers: HashMap::new(),
            page_fetchers: HashMap::new(),
            pollers: HashMap::new(),
            mutations: HashMap::new(),
            version_guard: None,
            flush_task: None,
            next_id: 0,
            cleared_through: 0,
        }
    }

    fn bump(&mut self, counter: Counter) {
        self.metrics.bump(counter, 1);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Explicit policy, else the entry's remembered settings, else the client
    /// default.
    fn retry_for(&self, hash: &str, explicit: Option<&RetryPolicy>) -> RetryPolicy {
        if let Some(policy) = explicit {
            return policy.clone();
        }
        self.store
            .get(hash)
            .and_then(|entry| entry.retry)
            .map(RetryPolicy::from)
            .unwrap_or_else(|| self.default_retry.clone())
    }

    /// Cancel the running fetch for `hash` and free its slot.
    fn abort(&mut self, hash: &str) -> bool {
        let Some(aborter) = self.aborters.remove(hash) else {
            return false;
        };
        aborter.token.cancel();
        if self
            .in_flight
            .get(hash)
            .is_some_and(|in_flight| in_flight.id == aborter.id)
        {
            self.in_flight.remove(hash);
        }
        true
    }

    fn cancel_mutation(&mut self, hash: &str) -> bool {
        match self.mutation_aborters.remove(hash) {
            Some(aborter) => {
                aborter.token.cancel();
                true
            }
            None => false,
        }
    }

    fn drop_poller(&mut self, hash: &str) {
        if let Some(poller) = self.pollers.remove(hash) {
            poller.handle.abort();
        }
    }

    /// Remove an entry together with everything that can still act on it.
    fn evict(&mut self, hash: &str) {
        self.abort(hash);
        self.drop_poller(hash);
        self.fetchers.remove(hash);
        self.page_fetchers.remove(hash);
        self.store.remove(hash);
    }

    fn invalidate(&mut self, hash: &str) {
        self.abort(hash);
        self.store.invalidate(hash);
        self.store.request_flush();
    }

    fn evict_lru(&mut self) {
        let overflow = self.store.lru_overflow(self.config.max_entries);
        if overflow.is_empty() {
            return;
        }
        for hash in &overflow {
            self.evict(hash);
        }
        self.metrics
            .bump(Counter::LruEvictions, overflow.len() as u64);
        debug!(
            evicted = overflow.len(),
            max_entries = self.config.max_entries,
            "Evicted least recently used entries"
        );
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut in_flight_keys: Vec<_> = self.in_flight.keys().cloned().collect();
        in_flight_keys.sort();
        let mut mutation_keys: Vec<_> = self.mutations.keys().cloned().collect();
        mutation_keys.sort();
        StoreSnapshot {
            revision: self.store.revision(),
            query_keys: self.store.hashes(),
            in_flight_keys,
            mutation_keys,
            metrics: self.metrics,
            config: self.config.clone(),
        }
    }
}

pub(crate) struct Inner {
    state: Mutex<ClientState>,
    observers: DashMap<KeyHash, usize>,
    selectors: SelectorMemo,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    sync: Option<Arc<dyn SyncChannel>>,
    snapshots: watch::Sender<StoreSnapshot>,
    instance_id: Uuid,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, poller) in state.pollers.drain() {
            poller.handle.abort();
        }
        if let Some(task) = state.flush_task.take() {
            task.abort();
        }
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Spawn on the ambient tokio runtime, if there is one.
fn spawn<F>(future: F) -> Result<JoinHandle<F::Output>, QueryError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Handle::try_current()
        .map(|handle| handle.spawn(future))
        .map_err(|error| QueryError::Task(error.to_string()))
}

fn spawn_background<F>(task: &'static str, future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match spawn(future) {
        Ok(handle) => Some(handle),
        Err(error) => {
            warn!(task, error = %error, "No tokio runtime; background task not started");
            None
        }
    }
}

/// Handle to one isolated cache instance. Clones share the same cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("instance_id", &self.inner.instance_id)
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueryClient`]; carries the runtime-only knobs that cannot
/// come from a config file.
#[derive(Default)]
pub struct QueryClientBuilder {
    config: ClientConfig,
    clock: Option<Arc<dyn Clock>>,
    retry: Option<RetryPolicy>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    sync: Option<Arc<dyn SyncChannel>>,
}

impl QueryClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Default retry policy, overriding `config.retry`.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Persistence backend, overriding the one implied by
    /// `config.persistence.mode`.
    pub fn persistence_backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(backend);
        self
    }

    /// Sync channel shared with peer instances. Supplying one enables sync
    /// regardless of `config.multi_tab_sync.enabled`.
    pub fn sync_channel(mut self, channel: Arc<dyn SyncChannel>) -> Self {
        self.sync = Some(channel);
        self
    }

    /// Build the client. The gc sweep and the sync listener are started when
    /// a tokio runtime is available. Persisted entries are not loaded until
    /// [`QueryClient::restore`] is awaited.
    pub fn build(self) -> QueryClient {
        crate::telemetry::describe_metrics();

        let config = self.config;
        let persistence = self
            .persistence
            .or_else(|| backend_for(&config.persistence));
        let sync = self.sync.or_else(|| {
            config.multi_tab_sync.enabled.then(|| {
                BroadcastSyncChannel::named(&config.multi_tab_sync.channel_name)
                    as Arc<dyn SyncChannel>
            })
        });
        let default_retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from(config.retry));
        let selectors = SelectorMemo::new(config.select_memo_max_entries);
        let gc_interval_ms = config.gc_interval_ms;

        let state = ClientState::new(config, default_retry);
        let (snapshots, _) = watch::channel(state.snapshot());

        let client = QueryClient {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                observers: DashMap::new(),
                selectors,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                persistence,
                sync,
                snapshots,
                instance_id: Uuid::new_v4(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        if gc_interval_ms > 0 {
            client.spawn_gc(Duration::from_millis(gc_interval_ms));
        }
        client.spawn_sync_listener();

        info!(
            instance_id = %client.inner.instance_id,
            persistence = client.inner.persistence.is_some(),
            sync = client.inner.sync.is_some(),
            "Query client created"
        );
        client
    }
}

/// Ends a public batch when dropped, even if the closure panicked.
struct BatchGuard<'a> {
    client: &'a QueryClient,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.client.lock("batch.end");
        state.store.end_batch();
        self.client.settle(&mut state);
    }
}

impl QueryClient {
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// Client with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, ClientState> {
        mutex_lock(&self.inner.state, SOURCE, op)
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    /// Publish the snapshot and schedule a flush if one is owed. Deferred
    /// while a batch is open.
    fn settle(&self, state: &mut ClientState) {
        if state.store.in_batch() {
            return;
        }
        if state.store.take_flush() {
            self.schedule_flush(state);
        }
        gauge!(METRIC_ENTRIES).set(state.store.len() as f64);
        let snapshot = state.snapshot();
        self.inner.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn broadcast(&self, kind: SyncKind) {
        if let Some(channel) = &self.inner.sync {
            debug!(channel = channel.name(), kind = kind.label(), "Broadcasting sync message");
            channel.post(SyncMessage::new(self.inner.instance_id, kind));
        }
    }

    /// Run `f` with every store write inside it committed as one transition
    /// and at most one persistence flush.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock("batch.begin").store.begin_batch();
        let _guard = BatchGuard { client: self };
        f()
    }

    /// Current summary of the cache.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    /// Receiver that observes every committed transition.
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn metrics(&self) -> Metrics {
        self.lock("metrics").metrics
    }

    pub fn config(&self) -> ClientConfig {
        self.lock("config").config.clone()
    }

    /// Apply a partial configuration update. The gc interval is read once at
    /// build time.
    pub fn set_config(&self, update: impl FnOnce(&mut ClientConfig)) {
        let mut state = self.lock("set_config");
        let previous_retry = state.config.retry;
        update(&mut state.config);

        let config = &state.config;
        let (structural_sharing, memo_size, retry) = (
            config.structural_sharing,
            config.select_memo_max_entries,
            config.retry,
        );
        state.store.set_structural_sharing(structural_sharing);
        self.inner.selectors.resize(memo_size);
        if retry != previous_retry {
            state.default_retry = RetryPolicy::from(retry);
        }
        state.evict_lru();
        self.settle(&mut state);
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Result<Option<QueryData>, QueryError> {
        let hash = key.hash()?;
        let state = self.lock("get_query_data");
        Ok(state.store.get(&hash).and_then(|entry| entry.data.clone()))
    }

    pub fn get_query_state(&self, key: &QueryKey) -> Result<Option<QueryState>, QueryError> {
        let hash = key.hash()?;
        let now = self.now();
        let state = self.lock("get_query_state");
        let is_fetching = state.in_flight.contains_key(&hash);
        Ok(state
            .store
            .get(&hash)
            .map(|entry| entry.state(now, is_fetching)))
    }

    /// Cached data projected through `selector`. Results are memoized by
    /// selector and data identity, not by structural equality.
    pub fn select(
        &self,
        key: &QueryKey,
        selector: &Selector,
    ) -> Result<Option<QueryData>, QueryError> {
        Ok(self
            .get_query_data(key)?
            .map(|data| self.inner.selectors.select(selector, &data)))
    }

    /// Write data directly, as if it had just been fetched.
    pub fn set_query_data(
        &self,
        key: &QueryKey,
        data: QueryData,
        options: SetDataOptions,
    ) -> Result<QueryData, QueryError> {
        let hash = key.hash()?;
        let key_string = key.display_string()?;
        let now = self.now();

        let mut state = self.lock("set_query_data");
        state.store.remember_key(&hash, key);
        let defaults = state.config.query_defaults_for(&key_string);
        let tags: Option<BTreeSet<String>> = options
            .tags
            .clone()
            .or_else(|| defaults.tags.clone())
            .map(|tags| tags.into_iter().collect());
        let shared = state.store.set_data(&hash, || key_string, data, |entry| {
            options.apply(entry, &defaults, tags.as_ref(), now);
        });
        state.store.sync_tags(&hash, tags.as_ref());
        state.evict_lru();
        state.store.request_flush();
        self.settle(&mut state);
        debug!(key = %hash, "Query data set directly");
        Ok(shared)
    }

    /// Bump the observer count for `key`. Returns the new count.
    pub fn add_observer(&self, key: &QueryKey) -> Result<usize, QueryError> {
        let hash = key.hash()?;
        let mut count = self.inner.observers.entry(hash).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    /// Drop one observer for `key`. Returns the remaining count.
    pub fn remove_observer(&self, key: &QueryKey) -> Result<usize, QueryError> {
        let hash = key.hash()?;
        let remaining = match self.inner.observers.get_mut(&hash) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return Ok(0),
        };
        if remaining == 0 {
            self.inner.observers.remove_if(&hash, |_, count| *count == 0);
        }
        Ok(remaining)
    }

    pub fn observer_count(&self, key: &QueryKey) -> Result<usize, QueryError> {
        let hash = key.hash()?;
        Ok(self.inner.observers.get(&hash).map_or(0, |count| *count))
    }

    /// Cancel the running fetch for `key`, if any.
    pub fn abort(&self, key: &QueryKey) -> Result<bool, QueryError> {
        let hash = key.hash()?;
        let mut state = self.lock("abort");
        let aborted = state.abort(&hash);
        self.settle(&mut state);
        if aborted {
            debug!(key = %hash, "Fetch aborted");
        }
        Ok(aborted)
    }

    /// Cancel running fetches for every key carrying any of `tags`.
    pub fn cancel_by_tags<I, S>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: Vec<S> = tags.into_iter().collect();
        let mut state = self.lock("cancel_by_tags");
        let hashes = state
            .store
            .keys_for_tags(tags.iter().map(|tag| tag.as_ref()));
        let cancelled = hashes.iter().filter(|hash| state.abort(hash)).count();
        self.settle(&mut state);
        debug!(cancelled, "Cancelled fetches by tag");
        cancelled
    }

    /// Mark `key` maximally stale, cancel its running fetch and clear its
    /// error. Cached data stays readable until the next successful fetch.
    pub fn invalidate(&self, key: &QueryKey) -> Result<(), QueryError> {
        let hash = key.hash()?;
        self.invalidate_hash(&hash, Origin::Local);
        Ok(())
    }

    pub(crate) fn invalidate_hash(&self, hash: &str, origin: Origin) {
        {
            let mut state = self.lock("invalidate");
            state.bump(Counter::Invalidations);
            state.invalidate(hash);
            self.settle(&mut state);
        }
        debug!(key = %hash, ?origin, "Invalidated query");
        if origin == Origin::Local {
            self.broadcast(SyncKind::Invalidate {
                key: hash.to_string(),
            });
        }
    }

    /// Invalidate every entry whose key display string starts with `prefix`.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        self.invalidate_prefix_with_origin(prefix, Origin::Local)
    }

    pub(crate) fn invalidate_prefix_with_origin(&self, prefix: &str, origin: Origin) -> usize {
        let count = {
            let mut state = self.lock("invalidate_by_prefix");
            state.bump(Counter::Invalidations);
            let hashes = state.store.keys_with_prefix(prefix);
            state.store.begin_batch();
            for hash in &hashes {
                state.invalidate(hash);
            }
            state.store.end_batch();
            self.settle(&mut state);
            hashes.len()
        };
        debug!(prefix, count, ?origin, "Invalidated queries by prefix");
        if origin == Origin::Local {
            self.broadcast(SyncKind::InvalidateByPrefix {
                prefix: prefix.to_string(),
            });
        }
        count
    }

    /// Invalidate every entry carrying any of `tags`.
    pub fn invalidate_tags<I, S>(&self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.invalidate_tags_with_origin(tags, Origin::Local)
    }

    pub(crate) fn invalidate_tags_with_origin(&self, tags: Vec<String>, origin: Origin) -> usize {
        let count = {
            let mut state = self.lock("invalidate_tags");
            state.bump(Counter::Invalidations);
            let hashes = state.store.keys_for_tags(tags.iter().map(String::as_str));
            state.store.begin_batch();
            for hash in &hashes {
                state.invalidate(hash);
            }
            state.store.end_batch();
            self.settle(&mut state);
            hashes.len()
        };
        debug!(tags = ?tags, count, ?origin, "Invalidated queries by tag");
        if origin == Origin::Local {
            self.broadcast(SyncKind::InvalidateTags { tags });
        }
        count
    }

    /// Drop entries older than their cache time. Invalidated entries are
    /// never collected by age.
    pub fn gc(&self) -> usize {
        let now = self.now();
        let mut state = self.lock("gc");
        let expired = state.store.expired(now);
        if expired.is_empty() {
            return 0;
        }
        state.store.begin_batch();
        for hash in &expired {
            state.evict(hash);
        }
        state.store.request_flush();
        state.store.end_batch();
        state
            .metrics
            .bump(Counter::GcEvictions, expired.len() as u64);
        self.settle(&mut state);
        info!(evicted = expired.len(), "Garbage collected expired entries");
        expired.len()
    }

    /// Drop every entry, fetch, poller, observer and mutation record.
    pub fn clear(&self) {
        self.clear_with_origin(Origin::Local);
    }

    pub(crate) fn clear_with_origin(&self, origin: Origin) {
        {
            let mut state = self.lock("clear");
            for (_, aborter) in state.aborters.drain() {
                aborter.token.cancel();
            }
            for (_, poller) in state.pollers.drain() {
                poller.handle.abort();
            }
            for (_, aborter) in state.mutation_aborters.drain() {
                aborter.token.cancel();
            }
            state.cleared_through = state.next_id;
            state.in_flight.clear();
            state.fetchers.clear();
            state.page_fetchers.clear();
            state.mutations.clear();
            state.store.clear();
            state.store.request_flush();
            self.inner.selectors.clear();
            self.inner.observers.clear();
            self.settle(&mut state);
        }
        info!(?origin, "Query cache cleared");
        if origin == Origin::Local {
            self.broadcast(SyncKind::Clear);
        }
    }

    /// Revalidate every stale entry that has observers and data. Returns the
    /// number of refetches started.
    pub fn refetch_stale(&self) -> usize {
        let now = self.now();
        let targets: Vec<(KeyHash, PollTarget)> = {
            let mut state = self.lock("refetch_stale");
            let candidates: Vec<KeyHash> = state
                .store
                .iter()
                .filter(|(hash, entry)| {
                    entry.data.is_some()
                        && entry.is_stale(now)
                        && self
                            .inner
                            .observers
                            .get(hash.as_str())
                            .is_some_and(|count| *count > 0)
                })
                .map(|(hash, _)| hash.clone())
                .collect();
            let mut targets = Vec::with_capacity(candidates.len());
            for hash in candidates {
                let Some(target) = PollTarget::for_entry(&state, &hash) else {
                    continue;
                };
                state.bump(Counter::BackgroundFetches);
                targets.push((hash, target));
            }
            self.settle(&mut state);
            targets
        };

        let started = targets.len();
        for (hash, target) in targets {
            if let Err(error) = self.start_revalidation(&hash, target) {
                warn!(key = %hash, error = %error, "Failed to start revalidation");
            }
        }
        debug!(started, "Refetching stale observed queries");
        started
    }

    /// (Re)establish the poller for `hash`; `None` or zero removes it.
    fn ensure_poller(&self, state: &mut ClientState, hash: &str, interval_ms: Option<u64>) {
        let Some(interval_ms) = interval_ms.filter(|ms| *ms > 0) else {
            state.drop_poller(hash);
            return;
        };
        if state
            .pollers
            .get(hash)
            .is_some_and(|poller| poller.interval_ms == interval_ms && !poller.handle.is_finished())
        {
            return;
        }
        state.drop_poller(hash);

        let weak = Arc::downgrade(&self.inner);
        let poll_hash = hash.to_string();
        let task = async move {
            let period = Duration::from_millis(interval_ms);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                QueryClient { inner }.poll(&poll_hash);
            }
        };
        if let Some(handle) = spawn_background("poller", task) {
            state.pollers.insert(
                hash.to_string(),
                Poller {
                    interval_ms,
                    handle,
                },
            );
        }
    }

    fn poll(&self, hash: &str) {
        let target = {
            let state = self.lock("poll");
            PollTarget::for_entry(&state, hash)
        };
        let Some(target) = target else {
            return;
        };
        debug!(key = %hash, "Polling query");
        if let Err(error) = self.start_revalidation(hash, target) {
            warn!(key = %hash, error = %error, "Poll failed to start");
        }
    }

    fn spawn_gc(&self, period: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                QueryClient { inner }.gc();
            }
        };
        if let Some(handle) = spawn_background("gc", task) {
            mutex_lock(&self.inner.tasks, SOURCE, "spawn_gc").push(handle);
        }
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}
