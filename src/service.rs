//! Operational facade tying the store, cache, retrieval chain and worker together

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheStats, RagCache};
use crate::config::{Config, ConfigProvider, RetrievalSettings, SharedConfig};
use crate::embedding::{CharEstimator, EmbeddingClient, TiktokenEstimator, TokenEstimator};
use crate::error::{Error, Result};
use crate::record::{ConversationId, EmbeddingKind, ExchangeId};
use crate::retrieval::{RetrievalRequest, RetrievalResult, Retriever};
use crate::storage::{EmbeddingStore, IndexMode};
use crate::worker::{EmbeddingWorker, FailedJob, FailedJobLog, WorkerHandle, WorkerStatus};

/// Stored embeddings per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EmbeddingCounts {
    pub conversation_summary: usize,
    pub exchange_summary: usize,
}

/// Everything `/status` reports
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub enabled: bool,
    pub index_mode: IndexMode,
    pub embeddings: EmbeddingCounts,
    pub pending: usize,
    pub failed_jobs: usize,
    pub worker: WorkerStatus,
    pub cache: CacheStats,
    pub settings: RetrievalSettings,
}

/// The memory engine as the REPL and the HTTP server see it
pub struct RagService {
    config: Arc<SharedConfig>,
    store: Arc<EmbeddingStore>,
    cache: Arc<RagCache>,
    retriever: Retriever,
    worker: WorkerHandle,
    failed: Arc<FailedJobLog>,
    enabled: AtomicBool,
}

impl RagService {
    /// Open the store under `config.data_dir` and start the worker.
    ///
    /// Budgets are counted with the cl100k tokenizer when it loads, otherwise
    /// with the character estimate.
    pub fn start(config: Config, client: Arc<dyn EmbeddingClient>) -> Result<Self> {
        let store = Arc::new(EmbeddingStore::open(&config)?);
        let estimator: Arc<dyn TokenEstimator> = match TiktokenEstimator::for_gpt() {
            Ok(tiktoken) => Arc::new(tiktoken),
            Err(e) => {
                warn!("{}, falling back to character estimate", e);
                Arc::new(CharEstimator)
            }
        };
        let failed = Arc::new(FailedJobLog::open(config.failed_jobs_path())?);
        Self::assemble(config, store, client, estimator, failed)
    }

    /// Build around an existing store; starts the worker on the current runtime.
    /// Failed jobs are kept in memory only.
    pub fn with_store(
        config: Config,
        store: Arc<EmbeddingStore>,
        client: Arc<dyn EmbeddingClient>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self> {
        Self::assemble(config, store, client, estimator, Arc::new(FailedJobLog::new()))
    }

    fn assemble(
        config: Config,
        store: Arc<EmbeddingStore>,
        client: Arc<dyn EmbeddingClient>,
        estimator: Arc<dyn TokenEstimator>,
        failed: Arc<FailedJobLog>,
    ) -> Result<Self> {
        if client.dimensions() != store.dimensions() {
            return Err(Error::config(format!(
                "Embedding client produces {} dimensions but the store holds {}",
                client.dimensions(),
                store.dimensions()
            )));
        }

        let cache = Arc::new(RagCache::from_settings(&config.cache)?);
        let config = Arc::new(SharedConfig::new(config)?);
        let provider: Arc<dyn ConfigProvider> = config.clone();

        let retriever = Retriever::new(store.clone(), client.clone(), cache.clone(), estimator, provider.clone());
        let worker = EmbeddingWorker::new(store.clone(), client, cache.clone(), provider, failed.clone()).spawn();

        info!("RAG service started ({:?} index)", store.index_mode());

        Ok(Self {
            config,
            store,
            cache,
            retriever,
            worker,
            failed,
            enabled: AtomicBool::new(true),
        })
    }

    /// Context for a prompt; empty while RAG is disabled
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalResult {
        if !self.is_enabled() {
            return RetrievalResult::empty();
        }
        self.retriever.retrieve(request).await
    }

    /// Run a query through the chain regardless of the enabled flag
    pub async fn test_retrieval(&self, query: &str) -> RetrievalResult {
        self.retriever.retrieve(&RetrievalRequest::new(query)).await
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        Ok(ServiceStatus {
            enabled: self.is_enabled(),
            index_mode: self.store.index_mode(),
            embeddings: EmbeddingCounts {
                conversation_summary: self.store.count(EmbeddingKind::ConversationSummary)?,
                exchange_summary: self.store.count(EmbeddingKind::ExchangeSummary)?,
            },
            pending: self.store.pending_count()?,
            failed_jobs: self.failed.len(),
            worker: self.worker.snapshot(),
            cache: self.cache.stats(),
            settings: self.config.retrieval(),
        })
    }

    /// Delete all embeddings of one kind; the worker rebuilds them from the summaries
    pub fn clear(&self, kind: EmbeddingKind) -> Result<usize> {
        let removed = self.store.clear(kind)?;
        self.cache.invalidate_all();
        info!("Cleared {} {} embeddings", removed, kind);
        Ok(removed)
    }

    /// Delete every embedding, empty the cache and forget worker counters and failures
    pub fn reset(&self) -> Result<usize> {
        let mut removed = 0;
        for kind in EmbeddingKind::ALL {
            removed += self.store.clear(kind)?;
        }
        self.cache.clear();
        self.worker.reset();
        self.failed.clear();
        info!("Reset: removed {} embeddings", removed);
        Ok(removed)
    }

    /// Delete a conversation with its exchanges and embeddings
    pub fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        if !self.store.delete_conversation(id)? {
            return Err(Error::not_found(format!("conversation {}", id)));
        }
        self.cache.invalidate(id);
        Ok(())
    }

    /// Delete an exchange and its embedding
    pub fn delete_exchange(&self, id: ExchangeId) -> Result<()> {
        if !self.store.delete_exchange(id)? {
            return Err(Error::not_found(format!("exchange {}", id)));
        }
        // Owning conversation is not known here
        self.cache.invalidate_all();
        Ok(())
    }

    /// Turn retrieval back on and resume the worker
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        self.worker.resume();
    }

    /// Turn retrieval off and pause the worker
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.worker.pause();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.worker.pause();
    }

    pub fn resume(&self) {
        self.worker.resume();
    }

    pub async fn wait_until_paused(&self, timeout: Duration) -> bool {
        self.worker.wait_until_paused(timeout).await
    }

    pub fn retry_failed(&self) -> usize {
        self.worker.retry_failed()
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.failed.jobs()
    }

    /// Change settings at runtime; cached results for the old settings stop
    /// matching and the cache takes on the new capacity
    pub fn configure<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        self.config.update(f)?;
        self.cache.resize(self.config.cache().capacity.max(1))
    }

    pub fn cache(&self) -> &Arc<RagCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let stopped = self.worker.shutdown(timeout).await;
        info!("RAG service stopped");
        stopped
    }
}
