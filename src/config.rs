//! Configuration for rag-memory

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

/// Ranking and formatting knobs for the retrieval pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalSettings {
    /// Maximum conversations returned by conversation search
    pub conversation_limit: usize,

    /// Minimum cosine similarity for a conversation match (0.0 - 1.0)
    pub conversation_min_similarity: f32,

    /// Maximum exchanges taken from each matched conversation
    pub exchanges_per_conversation: usize,

    /// Maximum exchanges across all conversations combined
    pub exchange_global_cap: usize,

    /// Minimum cosine similarity for an exchange match (0.0 - 1.0)
    pub exchange_min_similarity: f32,

    /// Token budget for the formatted context
    pub token_budget: usize,

    /// Share of the budget reserved for conversation summaries (0.0 - 1.0)
    pub conversation_budget_pct: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            conversation_limit: 5,
            conversation_min_similarity: 0.7,
            exchanges_per_conversation: 3,
            exchange_global_cap: 10,
            exchange_min_similarity: 0.65,
            token_budget: 2000,
            conversation_budget_pct: 0.4,
        }
    }
}

impl RetrievalSettings {
    /// Hash of every value that affects ranking or formatting.
    ///
    /// Part of the result cache key, so changing any of these makes old
    /// cache entries unreachable.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.conversation_limit.hash(&mut hasher);
        self.conversation_min_similarity.to_bits().hash(&mut hasher);
        self.exchanges_per_conversation.hash(&mut hasher);
        self.exchange_global_cap.hash(&mut hasher);
        self.exchange_min_similarity.to_bits().hash(&mut hasher);
        self.token_budget.hash(&mut hasher);
        self.conversation_budget_pct.to_bits().hash(&mut hasher);
        hasher.finish()
    }
}

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSettings {
    pub enabled: bool,

    /// Time to live for each entry
    #[serde(with = "duration_secs")]
    pub ttl: Duration,

    /// Maximum number of cached results (LRU beyond this)
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            capacity: 256,
        }
    }
}

/// Background embedding worker settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSettings {
    /// Work items embedded per client call
    pub batch_size: usize,

    /// Pause between batches
    pub rate_limit_ms: u64,

    /// Sleep when the backlog is empty
    pub idle_poll_ms: u64,

    /// Attempts per batch (and per write) before an item is recorded failed
    pub max_attempts: u32,

    /// First retry delay
    pub backoff_base_ms: u64,

    /// Ceiling for any single retry delay
    pub backoff_max_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 16,
            rate_limit_ms: 1000,
            idle_poll_ms: 5000,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Configuration for the memory engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name (for reference, actual model set in embedding.rs)
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Try to build the sqlite-vec index; when false every search is a linear scan
    pub native_index: bool,

    /// HTTP server port
    pub server_port: u16,

    pub retrieval: RetrievalSettings,
    pub cache: CacheSettings,
    pub worker: WorkerSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rag-memory");

        Self {
            data_dir,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384, // MiniLM-L6-v2 outputs 384-dim vectors
            native_index: true,
            server_port: 8421,
            retrieval: RetrievalSettings::default(),
            cache: CacheSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `RAG_*` environment variables, then validated
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(dir) = lookup("RAG_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        read_var(&lookup, "RAG_EMBEDDING_DIMENSIONS", &mut config.embedding_dimensions)?;
        read_var(&lookup, "RAG_NATIVE_INDEX", &mut config.native_index)?;
        read_var(&lookup, "RAG_SERVER_PORT", &mut config.server_port)?;

        let r = &mut config.retrieval;
        read_var(&lookup, "RAG_CONVERSATION_LIMIT", &mut r.conversation_limit)?;
        read_var(&lookup, "RAG_CONVERSATION_MIN_SIMILARITY", &mut r.conversation_min_similarity)?;
        read_var(&lookup, "RAG_EXCHANGES_PER_CONVERSATION", &mut r.exchanges_per_conversation)?;
        read_var(&lookup, "RAG_EXCHANGE_GLOBAL_CAP", &mut r.exchange_global_cap)?;
        read_var(&lookup, "RAG_EXCHANGE_MIN_SIMILARITY", &mut r.exchange_min_similarity)?;
        read_var(&lookup, "RAG_TOKEN_BUDGET", &mut r.token_budget)?;
        read_var(&lookup, "RAG_CONVERSATION_BUDGET_PCT", &mut r.conversation_budget_pct)?;

        let w = &mut config.worker;
        read_var(&lookup, "RAG_BATCH_SIZE", &mut w.batch_size)?;
        read_var(&lookup, "RAG_RATE_LIMIT_MS", &mut w.rate_limit_ms)?;

        read_var(&lookup, "RAG_CACHE_ENABLED", &mut config.cache.enabled)?;
        read_var(&lookup, "RAG_CACHE_CAPACITY", &mut config.cache.capacity)?;
        let mut ttl_secs = config.cache.ttl.as_secs();
        read_var(&lookup, "RAG_CACHE_TTL", &mut ttl_secs)?;
        config.cache.ttl = Duration::from_secs(ttl_secs);

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values instead of clamping them
    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        check_fraction("conversation_min_similarity", r.conversation_min_similarity)?;
        check_fraction("exchange_min_similarity", r.exchange_min_similarity)?;
        check_fraction("conversation_budget_pct", r.conversation_budget_pct)?;
        check_positive("conversation_limit", r.conversation_limit)?;
        check_positive("exchanges_per_conversation", r.exchanges_per_conversation)?;
        check_positive("exchange_global_cap", r.exchange_global_cap)?;
        check_positive("token_budget", r.token_budget)?;
        check_positive("embedding_dimensions", self.embedding_dimensions)?;

        let w = &self.worker;
        check_positive("batch_size", w.batch_size)?;
        check_positive("max_attempts", w.max_attempts as usize)?;
        if w.backoff_base_ms > w.backoff_max_ms {
            return Err(Error::config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                w.backoff_base_ms, w.backoff_max_ms
            )));
        }

        if self.cache.enabled {
            check_positive("cache_capacity", self.cache.capacity)?;
        }

        Ok(())
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("embeddings.db")
    }

    /// Journal of summaries the worker gave up on
    pub fn failed_jobs_path(&self) -> PathBuf {
        self.data_dir.join("failed_jobs.jsonl")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

fn read_var<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("{}={:?}: {}", key, raw, e)))?;
    }
    Ok(())
}

fn check_fraction(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::config(format!("{} must be within [0, 1], got {}", name, value)));
    }
    Ok(())
}

fn check_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::config(format!("{} must be at least 1", name)));
    }
    Ok(())
}

/// Typed read access to configuration.
///
/// Components hold a `dyn ConfigProvider` and ask for the settings they need
/// on every use, so runtime changes take effect without rebuilding them.
pub trait ConfigProvider: Send + Sync {
    fn retrieval(&self) -> RetrievalSettings;
    fn cache(&self) -> CacheSettings;
    fn worker(&self) -> WorkerSettings;
}

impl ConfigProvider for Config {
    fn retrieval(&self) -> RetrievalSettings {
        self.retrieval.clone()
    }

    fn cache(&self) -> CacheSettings {
        self.cache.clone()
    }

    fn worker(&self) -> WorkerSettings {
        self.worker.clone()
    }
}

/// Configuration that can be replaced while the engine runs
#[derive(Debug)]
pub struct SharedConfig {
    inner: RwLock<Config>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: RwLock::new(config),
        })
    }

    /// Current configuration snapshot
    pub fn snapshot(&self) -> Result<Config> {
        self.inner
            .read()
            .map(|c| c.clone())
            .map_err(|_| Error::config("configuration lock poisoned"))
    }

    /// Apply `f` to a copy and publish it only if it still validates
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| Error::config("configuration lock poisoned"))?;
        let mut next = guard.clone();
        f(&mut next);
        next.validate()?;
        *guard = next;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Config) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl ConfigProvider for SharedConfig {
    fn retrieval(&self) -> RetrievalSettings {
        self.read(|c| c.retrieval.clone())
    }

    fn cache(&self) -> CacheSettings {
        self.read(|c| c.cache.clone())
    }

    fn worker(&self) -> WorkerSettings {
        self.read(|c| c.worker.clone())
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("RAG_CONVERSATION_LIMIT", "7"),
            ("RAG_EXCHANGE_MIN_SIMILARITY", "0.5"),
            ("RAG_CACHE_ENABLED", "false"),
            ("RAG_CACHE_TTL", "60"),
            ("RAG_NATIVE_INDEX", "false"),
        ]))
        .unwrap();

        assert_eq!(config.retrieval.conversation_limit, 7);
        assert_eq!(config.retrieval.exchange_min_similarity, 0.5);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.ttl, Duration::from_secs(60));
        assert!(!config.native_index);
    }

    #[test]
    fn test_unparsable_value_fails_fast() {
        let err = Config::from_lookup(lookup(&[("RAG_TOKEN_BUDGET", "lots")])).unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("RAG_TOKEN_BUDGET")));
    }

    #[test]
    fn test_out_of_range_is_not_clamped() {
        let err = Config::from_lookup(lookup(&[("RAG_CONVERSATION_BUDGET_PCT", "1.5")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_lookup(lookup(&[("RAG_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_fingerprint_tracks_ranking_values() {
        let a = RetrievalSettings::default();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.exchange_global_cap += 1;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_shared_config_rejects_invalid_update() {
        let shared = SharedConfig::new(Config::default()).unwrap();
        assert!(shared.update(|c| c.retrieval.token_budget = 0).is_err());
        assert_eq!(shared.retrieval().token_budget, 2000);

        shared.update(|c| c.retrieval.token_budget = 500).unwrap();
        assert_eq!(shared.retrieval().token_budget, 500);
    }
}
