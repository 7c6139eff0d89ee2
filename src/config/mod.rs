//! Configuration layer: the typed [`ClientConfig`] plus layered loading
//! (defaults file → local file → explicit file → environment).

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{QueryKey, RetrySettings};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "yokai";
const ENV_PREFIX: &str = "YOKAI";

pub const DEFAULT_MAX_ENTRIES: usize = 200;
pub const DEFAULT_FLUSH_DEBOUNCE_MS: u64 = 250;
pub const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_SELECT_MEMO_MAX_ENTRIES: usize = 500;
pub const DEFAULT_STORAGE_KEY: &str = "__query_cache__";
pub const DEFAULT_CHANNEL_NAME: &str = "__query_store_sync__";

/// Engine configuration. Every field has a default, so partial documents
/// deserialize.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Capacity before least-recently-touched entries are evicted.
    pub max_entries: usize,
    pub persistence: PersistenceConfig,
    /// Client-wide retry policy, used when neither the call nor the entry
    /// specifies one.
    pub retry: RetrySettings,
    pub stale_while_revalidate: bool,
    pub structural_sharing: bool,
    /// Period of the expiry sweep; `0` disables it.
    pub gc_interval_ms: u64,
    pub select_memo_max_entries: usize,
    /// Raise fetch errors even when stale data could be served instead.
    pub throw_on_error: bool,
    pub query_defaults: Vec<QueryDefaults>,
    pub mutation_defaults: Vec<MutationDefaults>,
    pub multi_tab_sync: MultiTabSyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            persistence: PersistenceConfig::default(),
            retry: RetrySettings::default(),
            stale_while_revalidate: false,
            structural_sharing: true,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            select_memo_max_entries: DEFAULT_SELECT_MEMO_MAX_ENTRIES,
            throw_on_error: false,
            query_defaults: Vec::new(),
            mutation_defaults: Vec::new(),
            multi_tab_sync: MultiTabSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    #[default]
    None,
    /// Lives as long as the process; backed by memory.
    Session,
    /// Survives restarts; backed by files under `path`.
    Durable,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub mode: PersistenceMode,
    pub storage_key: String,
    pub path: Option<PathBuf>,
    pub flush_debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            mode: PersistenceMode::None,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            path: None,
            flush_debounce_ms: DEFAULT_FLUSH_DEBOUNCE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MultiTabSyncConfig {
    pub enabled: bool,
    pub channel_name: String,
}

impl Default for MultiTabSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
        }
    }
}

/// Query options applied to every key whose display string starts with
/// `prefix`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryDefaults {
    pub prefix: String,
    #[serde(default)]
    pub options: QueryDefaultOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueryDefaultOptions {
    pub stale_time_ms: Option<u64>,
    pub cache_time_ms: Option<u64>,
    pub tags: Option<Vec<String>>,
    pub retry: Option<RetrySettings>,
    pub refetch_interval_ms: Option<u64>,
    pub abort_on_new_fetch: Option<bool>,
    pub background: Option<bool>,
}

impl QueryDefaultOptions {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merge(&mut self, other: &QueryDefaultOptions) {
        fn overlay<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        overlay(&mut self.stale_time_ms, &other.stale_time_ms);
        overlay(&mut self.cache_time_ms, &other.cache_time_ms);
        overlay(&mut self.tags, &other.tags);
        overlay(&mut self.retry, &other.retry);
        overlay(&mut self.refetch_interval_ms, &other.refetch_interval_ms);
        overlay(&mut self.abort_on_new_fetch, &other.abort_on_new_fetch);
        overlay(&mut self.background, &other.background);
    }
}

/// Mutation options applied to every mutation whose key display string
/// starts with `key`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MutationDefaults {
    pub key: String,
    #[serde(default)]
    pub options: MutationDefaultOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MutationDefaultOptions {
    pub retry: Option<RetrySettings>,
    pub abort_on_new_mutation: Option<bool>,
    pub invalidate_keys: Option<Vec<QueryKey>>,
    pub invalidate_prefixes: Option<Vec<String>>,
    pub invalidate_tags: Option<Vec<String>>,
}

impl MutationDefaultOptions {
    pub fn merge(&mut self, other: &MutationDefaultOptions) {
        if other.retry.is_some() {
            self.retry = other.retry;
        }
        if other.abort_on_new_mutation.is_some() {
            self.abort_on_new_mutation = other.abort_on_new_mutation;
        }
        if other.invalidate_keys.is_some() {
            self.invalidate_keys.clone_from(&other.invalidate_keys);
        }
        if other.invalidate_prefixes.is_some() {
            self.invalidate_prefixes.clone_from(&other.invalidate_prefixes);
        }
        if other.invalidate_tags.is_some() {
            self.invalidate_tags.clone_from(&other.invalidate_tags);
        }
    }
}

impl ClientConfig {
    /// Merge every matching query default in declaration order.
    pub fn query_defaults_for(&self, key_string: &str) -> QueryDefaultOptions {
        let mut merged = QueryDefaultOptions::default();
        for defaults in &self.query_defaults {
            if key_string.starts_with(&defaults.prefix) {
                merged.merge(&defaults.options);
            }
        }
        merged
    }

    /// Merge every matching mutation default in declaration order.
    pub fn mutation_defaults_for(&self, key_string: &str) -> MutationDefaultOptions {
        let mut merged = MutationDefaultOptions::default();
        for defaults in &self.mutation_defaults {
            if key_string.starts_with(&defaults.key) {
                merged.merge(&defaults.options);
            }
        }
        merged
    }

    /// Check invariants the engine relies on.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.max_entries == 0 {
            return Err(LoadError::invalid(
                "client.max_entries",
                "must be greater than zero",
            ));
        }
        if self.retry.attempts == 0 {
            return Err(LoadError::invalid(
                "client.retry.attempts",
                "must be at least one",
            ));
        }
        if self.persistence.storage_key.trim().is_empty() {
            return Err(LoadError::invalid(
                "client.persistence.storage_key",
                "must not be empty",
            ));
        }
        if self.persistence.mode == PersistenceMode::Durable && self.persistence.path.is_none() {
            return Err(LoadError::invalid(
                "client.persistence.path",
                "durable persistence needs a directory",
            ));
        }
        if self.multi_tab_sync.enabled && self.multi_tab_sync.channel_name.trim().is_empty() {
            return Err(LoadError::invalid(
                "client.multi_tab_sync.channel_name",
                "must not be empty when sync is enabled",
            ));
        }
        Ok(())
    }
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: ClientConfig,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings with precedence `config/default` → `yokai` → `path` →
/// `YOKAI__*` environment variables.
pub fn load(path: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    client: ClientConfig,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { client, logging } = raw;
        client.validate()?;
        let logging = build_logging_settings(logging)?;
        Ok(Self { client, logging })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level.as_ref() {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}
