//! Mutation pipeline: optimistic apply, run under retry, then either patch
//! and invalidate or roll back to the pre-update snapshots.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, instrument, warn};

use super::{Aborter, QueryClient, spawn};
use crate::cache::{
    Counter, InvalidationPlan, KeyHash, QueryData, QueryKey, RetryPolicy, run_with_retry,
};
use crate::config::MutationDefaultOptions;
use crate::error::QueryError;
use crate::sync::SyncKind;

/// Mutation key used when none is given. Unkeyed mutations share one record.
pub const MUTATION_KEY: &str = "__mutation__";

/// Performs a write. Implemented for any
/// `Fn(QueryData, CancellationToken) -> impl Future<Output = Result<QueryData, QueryError>>`.
pub trait MutationFn: Send + Sync {
    fn mutate(
        &self,
        variables: QueryData,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<QueryData, QueryError>>;
}

impl<F, Fut> MutationFn for F
where
    F: Fn(QueryData, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<QueryData, QueryError>> + Send + 'static,
{
    fn mutate(
        &self,
        variables: QueryData,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<QueryData, QueryError>> {
        Box::pin(self(variables, token))
    }
}

type Updater = Arc<dyn Fn(Option<&QueryData>) -> QueryData + Send + Sync>;
type Patcher = Arc<dyn Fn(Option<&QueryData>, &QueryData) -> QueryData + Send + Sync>;

/// Speculative write applied before the mutation runs.
#[derive(Clone)]
pub struct OptimisticUpdate {
    key: QueryKey,
    update: Updater,
}

impl OptimisticUpdate {
    pub fn new(
        key: QueryKey,
        update: impl Fn(Option<&QueryData>) -> QueryData + Send + Sync + 'static,
    ) -> Self {
        Self {
            key,
            update: Arc::new(update),
        }
    }
}

/// Cache write derived from the mutation result.
#[derive(Clone)]
pub struct CachePatch {
    key: QueryKey,
    update: Patcher,
}

impl CachePatch {
    pub fn new(
        key: QueryKey,
        update: impl Fn(Option<&QueryData>, &QueryData) -> QueryData + Send + Sync + 'static,
    ) -> Self {
        Self {
            key,
            update: Arc::new(update),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Latest state of the mutation running under one mutation key.
#[derive(Debug, Clone, Default)]
pub struct MutationRecord {
    pub status: MutationStatus,
    pub data: Option<QueryData>,
    pub error: Option<QueryError>,
    pub variables: Option<QueryData>,
    pub updated_at: u64,
    pub(super) generation: u64,
}

/// Options for [`QueryClient::mutate`]. Unset invalidation lists, retry and
/// abort settings fall back to matching mutation defaults.
#[derive(Clone)]
pub struct MutateOptions {
    mutation_fn: Arc<dyn MutationFn>,
    variables: QueryData,
    mutation_key: Option<QueryKey>,
    optimistic: Vec<OptimisticUpdate>,
    update_cache: Vec<CachePatch>,
    invalidate_keys: Option<Vec<QueryKey>>,
    invalidate_prefixes: Option<Vec<String>>,
    invalidate_tags: Option<Vec<String>>,
    retry: Option<RetryPolicy>,
    abort_on_new_mutation: Option<bool>,
    on_success: Option<Arc<dyn Fn(&QueryData, &QueryData) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&QueryError, &QueryData) + Send + Sync>>,
}

impl MutateOptions {
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(QueryData, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryData, QueryError>> + Send + 'static,
    {
        Self::with_mutation_fn(mutation_fn)
    }

    pub fn with_mutation_fn(mutation_fn: impl MutationFn + 'static) -> Self {
        Self {
            mutation_fn: Arc::new(mutation_fn),
            variables: QueryData::Null,
            mutation_key: None,
            optimistic: Vec::new(),
            update_cache: Vec::new(),
            invalidate_keys: None,
            invalidate_prefixes: None,
            invalidate_tags: None,
            retry: None,
            abort_on_new_mutation: None,
            on_success: None,
            on_error: None,
        }
    }

    pub fn variables(mut self, variables: impl Into<QueryData>) -> Self {
        self.variables = variables.into();
        self
    }

    pub fn mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    pub fn optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic.push(update);
        self
    }

    pub fn update_cache(mut self, patch: CachePatch) -> Self {
        self.update_cache.push(patch);
        self
    }

    pub fn invalidate_keys(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        self.invalidate_keys = Some(keys.into_iter().collect());
        self
    }

    pub fn invalidate_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_prefixes = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    pub fn invalidate_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidate_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn abort_on_new_mutation(mut self, abort: bool) -> Self {
        self.abort_on_new_mutation = Some(abort);
        self
    }

    /// Called with the result and the variables.
    pub fn on_success(
        mut self,
        f: impl Fn(&QueryData, &QueryData) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called with the final error and the variables, after rollback.
    pub fn on_error(mut self, f: impl Fn(&QueryError, &QueryData) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    fn plan(&self, defaults: &MutationDefaultOptions) -> Result<InvalidationPlan, QueryError> {
        let keys = self
            .invalidate_keys
            .as_ref()
            .or(defaults.invalidate_keys.as_ref())
            .map(|keys| keys.iter().map(QueryKey::hash).collect::<Result<BTreeSet<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        let prefixes = self
            .invalidate_prefixes
            .as_ref()
            .or(defaults.invalidate_prefixes.as_ref())
            .map(|prefixes| prefixes.iter().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default();
        let tags = self
            .invalidate_tags
            .as_ref()
            .or(defaults.invalidate_tags.as_ref())
            .map(|tags| tags.iter().cloned().collect::<BTreeSet<_>>())
            .unwrap_or_default();
        Ok(InvalidationPlan {
            keys,
            prefixes,
            tags,
        })
    }
}

/// A cache key resolved once, before any write.
struct Target {
    hash: KeyHash,
    key: QueryKey,
    key_string: String,
}

impl Target {
    fn of(key: &QueryKey) -> Result<Self, QueryError> {
        Ok(Self {
            hash: key.hash()?,
            key: key.clone(),
            key_string: key.display_string()?,
        })
    }
}

/// Cache state of an optimistic target before its first write.
struct Snapshot {
    hash: KeyHash,
    key_string: String,
    previous: Option<QueryData>,
    existed: bool,
}

struct MutationRun {
    mutation_hash: KeyHash,
    id: u64,
    token: CancellationToken,
    retry: RetryPolicy,
    mutation_fn: Arc<dyn MutationFn>,
    variables: QueryData,
    snapshots: Vec<Snapshot>,
    patches: Vec<(Target, Patcher)>,
    plan: InvalidationPlan,
    on_success: Option<Arc<dyn Fn(&QueryData, &QueryData) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&QueryError, &QueryData) + Send + Sync>>,
}

impl QueryClient {
    /// Run a mutation.
    ///
    /// Optimistic updates are applied once, as one batch, before the first
    /// attempt. On success the cache patches run, then the invalidation
    /// cascade. On failure every optimistic key is restored to exactly its
    /// pre-update value. The work runs on its own task, so dropping the
    /// returned future does not skip the rollback.
    #[instrument(skip_all, fields(mutation_key))]
    pub async fn mutate(&self, options: MutateOptions) -> Result<QueryData, QueryError> {
        let mutation_key = options
            .mutation_key
            .clone()
            .unwrap_or_else(|| QueryKey::Str(MUTATION_KEY.to_string()));
        let mutation_hash = mutation_key.hash()?;
        Span::current().record("mutation_key", mutation_hash.as_str());

        let defaults_key = options
            .mutation_key
            .as_ref()
            .map(QueryKey::display_string)
            .transpose()?;
        let optimistic = options
            .optimistic
            .iter()
            .map(|update| Ok((Target::of(&update.key)?, update.update.clone())))
            .collect::<Result<Vec<_>, QueryError>>()?;
        let patches = options
            .update_cache
            .iter()
            .map(|patch| Ok((Target::of(&patch.key)?, patch.update.clone())))
            .collect::<Result<Vec<_>, QueryError>>()?;
        let now = self.now();

        let run = {
            let mut guard = self.lock("mutate");
            let state = &mut *guard;

            let defaults = defaults_key
                .as_deref()
                .map(|key| state.config.mutation_defaults_for(key))
                .unwrap_or_default();
            let plan = options.plan(&defaults)?;

            state.bump(Counter::Mutations);
            let abort_previous = options
                .abort_on_new_mutation
                .or(defaults.abort_on_new_mutation)
                .unwrap_or(true);
            if abort_previous && state.cancel_mutation(&mutation_hash) {
                debug!(mutation_key = %mutation_hash, "Cancelled superseded mutation");
            }

            let id = state.next_id();
            let token = CancellationToken::new();
            state.mutation_aborters.insert(
                mutation_hash.clone(),
                Aborter {
                    id,
                    token: token.clone(),
                },
            );
            let previous = state
                .mutations
                .get(&mutation_hash)
                .and_then(|record| record.data.clone());
            state.mutations.insert(
                mutation_hash.clone(),
                MutationRecord {
                    status: MutationStatus::Loading,
                    data: previous,
                    error: None,
                    variables: Some(options.variables.clone()),
                    updated_at: now,
                    generation: id,
                },
            );

            let mut snapshots: Vec<Snapshot> = Vec::new();
            if !optimistic.is_empty() {
                state.bump(Counter::OptimisticApplied);
                state.store.begin_batch();
                for (target, update) in &optimistic {
                    let existing = state.store.get(&target.hash);
                    let existed = existing.is_some();
                    let previous = existing.and_then(|entry| entry.data.clone());
                    if !snapshots.iter().any(|snapshot| snapshot.hash == target.hash) {
                        snapshots.push(Snapshot {
                            hash: target.hash.clone(),
                            key_string: target.key_string.clone(),
                            previous: previous.clone(),
                            existed,
                        });
                    }
                    let next = update(previous.as_ref());
                    state.store.remember_key(&target.hash, &target.key);
                    state.store.set_data(
                        &target.hash,
                        || target.key_string.clone(),
                        next,
                        |entry| entry.accessed_at = Some(now),
                    );
                }
                state.store.request_flush();
                state.store.end_batch();
                debug!(
                    mutation_key = %mutation_hash,
                    keys = snapshots.len(),
                    "Applied optimistic updates"
                );
            }

            let retry = options
                .retry
                .clone()
                .or_else(|| defaults.retry.map(RetryPolicy::from))
                .unwrap_or_else(|| state.default_retry.clone());
            self.settle(state);

            MutationRun {
                mutation_hash,
                id,
                token,
                retry,
                mutation_fn: options.mutation_fn,
                variables: options.variables,
                snapshots,
                patches,
                plan,
                on_success: options.on_success,
                on_error: options.on_error,
            }
        };

        match spawn(run_mutation(self.clone(), run))?.await {
            Ok(result) => result,
            Err(error) => Err(QueryError::Task(error.to_string())),
        }
    }

    /// Record for the mutation key, if any mutation ran under it.
    pub fn get_mutation(&self, key: &QueryKey) -> Result<Option<MutationRecord>, QueryError> {
        let hash = key.hash()?;
        Ok(self.lock("get_mutation").mutations.get(&hash).cloned())
    }

    /// Cancel the mutation running under `key`. Its optimistic updates are
    /// rolled back when it observes the cancellation.
    pub fn cancel_mutation(&self, key: &QueryKey) -> Result<bool, QueryError> {
        let hash = key.hash()?;
        let cancelled = self.lock("cancel_mutation").cancel_mutation(&hash);
        if cancelled {
            debug!(mutation_key = %hash, "Mutation cancelled");
        }
        Ok(cancelled)
    }

    fn finish_mutation(
        &self,
        run: &MutationRun,
        result: &Result<QueryData, QueryError>,
    ) -> Vec<SyncKind> {
        let now = self.now();
        let mut broadcasts = Vec::new();
        let mut guard = self.lock("mutate.finish");
        let state = &mut *guard;
        if run.id <= state.cleared_through {
            debug!(mutation_key = %run.mutation_hash, "Mutation outlived a cache clear");
            return broadcasts;
        }
        let current = state
            .mutations
            .get(&run.mutation_hash)
            .is_some_and(|record| record.generation == run.id);

        match result {
            Ok(data) => {
                if !run.patches.is_empty() {
                    state.store.begin_batch();
                    for (target, update) in &run.patches {
                        let previous = state
                            .store
                            .get(&target.hash)
                            .and_then(|entry| entry.data.clone());
                        let next = update(previous.as_ref(), data);
                        state.store.remember_key(&target.hash, &target.key);
                        state.store.set_data(
                            &target.hash,
                            || target.key_string.clone(),
                            next,
                            |entry| {
                                entry.error = None;
                                entry.fetched_at = Some(now);
                                entry.accessed_at = Some(now);
                            },
                        );
                    }
                    state.store.request_flush();
                    state.store.end_batch();
                    state.evict_lru();
                }

                if !run.plan.is_empty() {
                    let plan = &run.plan;
                    let calls = plan.keys.len() + plan.prefixes.len() + usize::from(!plan.tags.is_empty());
                    state.metrics.bump(Counter::Invalidations, calls as u64);
                    let targets = plan.resolve(&state.store);
                    state.store.begin_batch();
                    for hash in &targets {
                        state.invalidate(hash);
                    }
                    state.store.end_batch();
                    debug!(
                        mutation_key = %run.mutation_hash,
                        %plan,
                        invalidated = targets.len(),
                        "Applied mutation invalidation cascade"
                    );

                    broadcasts.extend(plan.keys.iter().map(|key| SyncKind::Invalidate {
                        key: key.clone(),
                    }));
                    broadcasts.extend(plan.prefixes.iter().map(|prefix| {
                        SyncKind::InvalidateByPrefix {
                            prefix: prefix.clone(),
                        }
                    }));
                    if !plan.tags.is_empty() {
                        broadcasts.push(SyncKind::InvalidateTags {
                            tags: plan.tags.iter().cloned().collect(),
                        });
                    }
                }

                if current {
                    state.mutations.insert(
                        run.mutation_hash.clone(),
                        MutationRecord {
                            status: MutationStatus::Success,
                            data: Some(data.clone()),
                            error: None,
                            variables: Some(run.variables.clone()),
                            updated_at: now,
                            generation: run.id,
                        },
                    );
                }
            }
            Err(error) => {
                if !run.snapshots.is_empty() {
                    state.bump(Counter::OptimisticRolledBack);
                    state.store.begin_batch();
                    for snapshot in &run.snapshots {
                        if snapshot.existed {
                            state.store.restore_data(
                                &snapshot.hash,
                                || snapshot.key_string.clone(),
                                snapshot.previous.clone(),
                                now,
                            );
                        } else {
                            state.store.remove(&snapshot.hash);
                        }
                    }
                    state.store.request_flush();
                    state.store.end_batch();
                    debug!(
                        mutation_key = %run.mutation_hash,
                        keys = run.snapshots.len(),
                        "Rolled back optimistic updates"
                    );
                }

                if current {
                    if let Some(record) = state.mutations.get_mut(&run.mutation_hash) {
                        record.status = MutationStatus::Error;
                        record.error = Some(error.clone());
                        record.updated_at = now;
                    }
                }
                if error.is_cancelled() {
                    debug!(mutation_key = %run.mutation_hash, "Mutation aborted");
                } else {
                    warn!(mutation_key = %run.mutation_hash, error = %error, "Mutation failed");
                }
            }
        }

        if state
            .mutation_aborters
            .get(&run.mutation_hash)
            .is_some_and(|aborter| aborter.id == run.id)
        {
            state.mutation_aborters.remove(&run.mutation_hash);
        }
        self.settle(state);
        broadcasts
    }
}

async fn run_mutation(client: QueryClient, run: MutationRun) -> Result<QueryData, QueryError> {
    let result = run_with_retry(
        &run.retry,
        &run.token,
        |_| run.mutation_fn.mutate(run.variables.clone(), run.token.clone()),
        |attempt, attempts| client.record_retry(&run.mutation_hash, attempt, attempts),
    )
    .await;

    for kind in client.finish_mutation(&run, &result) {
        client.broadcast(kind);
    }

    match &result {
        Ok(data) => {
            if let Some(on_success) = &run.on_success {
                on_success(data, &run.variables);
            }
        }
        Err(error) => {
            if let Some(on_error) = &run.on_error {
                on_error(error, &run.variables);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::ManualClock;
    use crate::client::SetDataOptions;
    use crate::config::{ClientConfig, MutationDefaults};
    use crate::query_key;

    fn client_at(start_ms: u64) -> QueryClient {
        let mut config = ClientConfig::default();
        config.gc_interval_ms = 0;
        QueryClient::builder()
            .config(config)
            .clock(Arc::new(ManualClock::new(start_ms)))
            .build()
    }

    fn prepend(item: &'static str) -> impl Fn(Option<&QueryData>) -> QueryData + Send + Sync {
        move |previous| {
            let mut items = vec![QueryData::from(item)];
            if let Some(list) = previous.and_then(QueryData::as_array) {
                items.extend(list.iter().cloned());
            }
            QueryData::array(items)
        }
    }

    #[tokio::test]
    async fn failed_mutation_restores_snapshot_exactly() {
        let client = client_at(1_000);
        let key = query_key!["todos"];
        client
            .set_query_data(&key, QueryData::from_json(json!(["a", "b"])), SetDataOptions::default())
            .unwrap();
        let before = client.get_query_data(&key).unwrap().unwrap();

        let error = client
            .mutate(
                MutateOptions::new(|_, _| async { Err(QueryError::mutation("rejected")) })
                    .optimistic(OptimisticUpdate::new(key.clone(), prepend("x"))),
            )
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "mutation failed: rejected");

        let after = client.get_query_data(&key).unwrap().unwrap();
        assert!(after.ptr_eq(&before));
        let metrics = client.metrics();
        assert_eq!(metrics.optimistic_applied, 1);
        assert_eq!(metrics.optimistic_rolled_back, 1);

        let record = client
            .get_mutation(&QueryKey::from(MUTATION_KEY))
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MutationStatus::Error);
    }

    #[tokio::test]
    async fn rollback_of_missing_entry_removes_it() {
        let client = client_at(1_000);
        let key = query_key!["fresh"];
        let _ = client
            .mutate(
                MutateOptions::new(|_, _| async { Err(QueryError::mutation("nope")) })
                    .optimistic(OptimisticUpdate::new(key.clone(), prepend("x"))),
            )
            .await;
        assert!(client.get_query_data(&key).unwrap().is_none());
        assert!(client.get_query_state(&key).unwrap().is_none());
        assert!(client.snapshot().query_keys.is_empty());
    }

    #[tokio::test]
    async fn rollback_after_eviction_keeps_prefix_matching() {
        let mut config = ClientConfig::default();
        config.gc_interval_ms = 0;
        config.max_entries = 1;
        let client = QueryClient::builder()
            .config(config)
            .clock(Arc::new(ManualClock::new(1_000)))
            .build();
        let todo = query_key!["todos", 1];
        client
            .set_query_data(&todo, QueryData::from(1), SetDataOptions::default())
            .unwrap();

        let writer = client.clone();
        let _ = client
            .mutate(
                MutateOptions::new(move |_, _| {
                    let writer = writer.clone();
                    async move {
                        writer
                            .set_query_data(
                                &query_key!["other"],
                                QueryData::from(2),
                                SetDataOptions::default(),
                            )
                            .map_err(|error| QueryError::mutation(error.to_string()))?;
                        Err(QueryError::mutation("rejected"))
                    }
                })
                .optimistic(OptimisticUpdate::new(todo.clone(), |_| QueryData::from(9))),
            )
            .await;

        let restored = client.get_query_data(&todo).unwrap().unwrap();
        assert_eq!(restored.as_i64(), Some(1));
        assert_eq!(client.invalidate_by_prefix("todos"), 1);
    }

    #[tokio::test]
    async fn success_patches_cache_and_invalidates() {
        let client = client_at(1_000);
        let list = query_key!["todos", "list"];
        let detail = query_key!["todo", 1];
        let tagged = query_key!["summary"];
        client
            .set_query_data(&list, QueryData::from_json(json!([])), SetDataOptions::default())
            .unwrap();
        client
            .set_query_data(&tagged, QueryData::from(0), SetDataOptions::default().tags(["todos"]))
            .unwrap();

        let result = client
            .mutate(
                MutateOptions::new(|variables: QueryData, _| async move {
                    Ok(QueryData::from_json(json!({"id": 1, "title": variables.as_str()})))
                })
                .mutation_key(query_key!["todos", "create"])
                .variables("write tests")
                .update_cache(CachePatch::new(detail.clone(), |_, result| result.clone()))
                .invalidate_prefixes(["todos"])
                .invalidate_tags(["todos"]),
            )
            .await
            .unwrap();
        assert_eq!(result.get("id").and_then(QueryData::as_i64), Some(1));

        let patched = client.get_query_data(&detail).unwrap().unwrap();
        assert_eq!(patched.get("title").and_then(QueryData::as_str), Some("write tests"));

        let fetched_at = |key: &QueryKey| client.get_query_state(key).unwrap().unwrap().fetched_at;
        assert_eq!(fetched_at(&list), Some(0));
        assert_eq!(fetched_at(&tagged), Some(0));
        assert_eq!(fetched_at(&detail), Some(1_000));

        let record = client
            .get_mutation(&query_key!["todos", "create"])
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MutationStatus::Success);
        assert_eq!(record.variables.as_ref().and_then(QueryData::as_str), Some("write tests"));
        assert_eq!(client.metrics().invalidations, 2);
    }

    #[tokio::test]
    async fn optimistic_update_is_applied_once_across_retries() {
        let client = client_at(1_000);
        let key = query_key!["counter"];
        client
            .set_query_data(&key, QueryData::from_json(json!([])), SetDataOptions::default())
            .unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        client
            .mutate(
                MutateOptions::new(move |_, _| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err(QueryError::mutation("retry me"))
                        } else {
                            Ok(QueryData::Null)
                        }
                    }
                })
                .retry(RetryPolicy::new(2).with_delay(std::time::Duration::ZERO))
                .optimistic(OptimisticUpdate::new(key.clone(), prepend("x"))),
            )
            .await
            .unwrap();

        let data = client.get_query_data(&key).unwrap().unwrap();
        assert_eq!(data.as_array().map(<[QueryData]>::len), Some(1));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn superseded_mutation_does_not_overwrite_record() {
        let client = client_at(1_000);
        let key = query_key!["profile", "save"];
        let gate = Arc::new(tokio::sync::Notify::new());

        let waiting = gate.clone();
        let first = client.mutate(
            MutateOptions::new(move |_, _| {
                let waiting = waiting.clone();
                async move {
                    waiting.notified().await;
                    Ok(QueryData::from("first"))
                }
            })
            .mutation_key(key.clone())
            .abort_on_new_mutation(false),
        );
        let second = async {
            tokio::task::yield_now().await;
            let result = client
                .mutate(
                    MutateOptions::new(|_, _| async { Ok(QueryData::from("second")) })
                        .mutation_key(key.clone())
                        .abort_on_new_mutation(false),
                )
                .await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().as_str(), Some("first"));
        assert_eq!(second.unwrap().as_str(), Some("second"));

        let record = client.get_mutation(&key).unwrap().unwrap();
        assert_eq!(record.data.as_ref().and_then(QueryData::as_str), Some("second"));
    }

    #[tokio::test]
    async fn new_mutation_cancels_previous_by_default() {
        let client = client_at(1_000);
        let key = query_key!["upload"];

        let first = client.mutate(
            MutateOptions::new(|_, token: CancellationToken| async move {
                token.cancelled().await;
                Err(QueryError::Cancelled)
            })
            .mutation_key(key.clone()),
        );
        let second = async {
            tokio::task::yield_now().await;
            client
                .mutate(
                    MutateOptions::new(|_, _| async { Ok(QueryData::from(true)) })
                        .mutation_key(key.clone()),
                )
                .await
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap_err().is_cancelled());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn mutation_defaults_supply_invalidations() {
        let client = client_at(1_000);
        client.set_config(|config| {
            config.mutation_defaults.push(MutationDefaults {
                key: "posts".to_string(),
                options: MutationDefaultOptions {
                    invalidate_prefixes: Some(vec!["posts".to_string()]),
                    ..MutationDefaultOptions::default()
                },
            });
        });
        let list = query_key!["posts", "all"];
        client
            .set_query_data(&list, QueryData::from_json(json!([])), SetDataOptions::default())
            .unwrap();

        client
            .mutate(
                MutateOptions::new(|_, _| async { Ok(QueryData::Null) })
                    .mutation_key(query_key!["posts", "publish"]),
            )
            .await
            .unwrap();

        let state = client.get_query_state(&list).unwrap().unwrap();
        assert_eq!(state.fetched_at, Some(0));
    }
}
