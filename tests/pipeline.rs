//! Retrieval chain integration tests: ranking into the formatted context,
//! fallback reporting, cache behavior and failure handling.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::{at_similarity, axis, eventually, minute, test_config, ScriptedClient, DIMS};
use rag_memory::cache::RagCache;
use rag_memory::config::{Config, ConfigProvider, SharedConfig};
use rag_memory::embedding::{CharEstimator, TokenEstimator};
use rag_memory::error::EmbeddingClientError;
use rag_memory::record::EmbeddingKind;
use rag_memory::retrieval::{
    ContextFormatterProcessor, ConversationSearchProcessor, ExchangeSearchProcessor, Pipeline, Processor,
    QueryEmbeddingProcessor, RetrievalContext, RetrievalRequest, Retriever,
};
use rag_memory::service::RagService;
use rag_memory::storage::EmbeddingStore;

const QUERY: &str = "database performance";

/// Two conversations about databases, one about gardening, and their exchanges
fn seeded_store(native: bool) -> Arc<EmbeddingStore> {
    let store = EmbeddingStore::open_in_memory(DIMS, native).unwrap();

    let conversations = [
        (1, "Tuning postgres for database performance", 0.95),
        (2, "Indexing strategy review", 0.90),
        (3, "Gardening tips for spring", 0.10),
    ];
    for (id, summary, similarity) in conversations {
        store.save_conversation_summary(id, summary, minute(id as u32)).unwrap();
        store
            .upsert(EmbeddingKind::ConversationSummary, id, summary, &at_similarity(similarity))
            .unwrap();
    }

    let exchanges = [
        (11, 1, "Raised shared_buffers", 0.93),
        (12, 1, "Added a covering index", 0.80),
        (13, 1, "Vacuum schedule", 0.70),
        (21, 2, "Dropped unused indexes", 0.91),
        (22, 2, "Partial index on status", 0.75),
        // similar, but its conversation did not match
        (31, 3, "Soil ph for tomatoes", 0.99),
    ];
    for (id, conversation_id, summary, similarity) in exchanges {
        store
            .save_exchange_summary(id, conversation_id, summary, minute(10 + id as u32))
            .unwrap();
        store
            .upsert(EmbeddingKind::ExchangeSummary, id, summary, &at_similarity(similarity))
            .unwrap();
    }

    Arc::new(store)
}

fn query_client() -> Arc<ScriptedClient> {
    let client = ScriptedClient::new();
    client.map(QUERY, axis());
    client
}

fn scenario_config() -> Config {
    let mut config = test_config();
    config.retrieval.exchange_global_cap = 3;
    config
}

struct Fixture {
    retriever: Retriever,
    cache: Arc<RagCache>,
    client: Arc<ScriptedClient>,
    store: Arc<EmbeddingStore>,
    config: Arc<SharedConfig>,
}

fn fixture(store: Arc<EmbeddingStore>, config: Config) -> Fixture {
    let client = query_client();
    let cache = Arc::new(RagCache::new(16).unwrap());
    let config = Arc::new(SharedConfig::new(config).unwrap());
    let retriever = Retriever::new(
        store.clone(),
        client.clone(),
        cache.clone(),
        Arc::new(CharEstimator),
        config.clone(),
    );
    Fixture {
        retriever,
        cache,
        client,
        store,
        config,
    }
}

#[tokio::test]
async fn test_scenario_two_conversations_three_exchanges() {
    let f = fixture(seeded_store(true), scenario_config());
    let result = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;

    assert_eq!(result.metadata.error, None);
    assert_eq!(result.metadata.conversation_count, 2);
    assert_eq!(result.metadata.exchange_count, 3);
    assert!(!result.metadata.fallback_mode_used);
    assert!(!result.metadata.cache_hit);

    let ctx = &result.context;
    assert!(ctx.contains("Tuning postgres"));
    assert!(ctx.contains("Indexing strategy review"));
    assert!(!ctx.contains("Gardening"));
    assert!(!ctx.contains("Soil ph"));

    // similarity order: 11 (0.93), 21 (0.91), 12 (0.80)
    let positions: Vec<usize> = ["Raised shared_buffers", "Dropped unused indexes", "Added a covering index"]
        .iter()
        .map(|s| ctx.find(s).expect(s))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(!ctx.contains("Vacuum schedule"));
    assert!(!ctx.contains("Partial index"));

    assert!(result.metadata.total_tokens_estimate <= f.config.retrieval().token_budget);
    assert_eq!(
        result.metadata.total_tokens_estimate,
        CharEstimator.estimate(&result.context)
    );
}

#[tokio::test]
async fn test_scenario_fallback_when_index_unavailable() {
    let native = fixture(seeded_store(true), scenario_config());
    let scan = fixture(seeded_store(false), scenario_config());

    let a = native.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    let b = scan.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;

    assert!(!a.metadata.fallback_mode_used);
    assert!(b.metadata.fallback_mode_used);
    assert_eq!(a.context, b.context);
    assert_eq!(b.metadata.exchange_count, 3);
}

#[tokio::test]
async fn test_current_conversation_is_excluded() {
    let f = fixture(seeded_store(true), scenario_config());
    let result = f
        .retriever
        .retrieve(&RetrievalRequest::new(QUERY).excluding(1))
        .await;

    assert!(result.conversations.iter().all(|c| c.conversation_id != 1));
    assert!(!result.context.contains("Tuning postgres"));
    assert!(result.exchanges.iter().all(|x| x.conversation_id == 2));
}

#[tokio::test]
async fn test_global_exchange_search_when_no_conversation_matches() {
    let mut config = scenario_config();
    config.retrieval.conversation_min_similarity = 0.99;
    let f = fixture(seeded_store(true), config);

    let result = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert_eq!(result.metadata.conversation_count, 0);
    let ids: Vec<i64> = result.exchanges.iter().map(|x| x.exchange_id).collect();
    assert_eq!(ids, vec![31, 11, 21]);
    assert!(result.context.starts_with("## Relevant Exchanges\n"));
}

#[tokio::test]
async fn test_cache_hit_skips_client_and_store() {
    let f = fixture(seeded_store(true), scenario_config());
    let first = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert_eq!(f.client.calls(), 1);

    // if the second request touched the store it would find nothing
    f.store.clear(EmbeddingKind::ConversationSummary).unwrap();
    f.store.clear(EmbeddingKind::ExchangeSummary).unwrap();

    let second = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(second.metadata.cache_hit);
    assert_eq!(second.context, first.context);
    assert_eq!(second.metadata.exchange_count, 3);
    assert_eq!(f.client.calls(), 1);
    assert_ne!(second.metadata.request_id, first.metadata.request_id);
}

#[tokio::test]
async fn test_invalidation_drops_dependent_entries() {
    let f = fixture(seeded_store(true), scenario_config());
    f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert_eq!(f.cache.len(), 1);

    // conversation 3 did not contribute
    assert_eq!(f.cache.invalidate(3), 0);
    assert_eq!(f.cache.invalidate(2), 1);

    let again = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(!again.metadata.cache_hit);
}

/// Stage that lands a worker write, once, while a request is between searches
struct ConcurrentWrite {
    store: Arc<EmbeddingStore>,
    cache: Arc<RagCache>,
    done: AtomicBool,
}

#[async_trait]
impl Processor for ConcurrentWrite {
    fn name(&self) -> &'static str {
        "concurrent_write"
    }

    async fn process(&self, ctx: RetrievalContext) -> RetrievalContext {
        if !self.done.swap(true, Ordering::SeqCst) {
            let summary = "Query planner deep dive";
            self.store.save_conversation_summary(4, summary, minute(4)).unwrap();
            self.store
                .upsert(EmbeddingKind::ConversationSummary, 4, summary, &at_similarity(0.97))
                .unwrap();
            self.cache.invalidate_all();
        }
        ctx
    }
}

#[tokio::test]
async fn test_result_computed_across_an_invalidation_is_not_cached() {
    let f = fixture(seeded_store(true), scenario_config());
    let pipeline = Pipeline::new()
        .with(QueryEmbeddingProcessor::new(f.client.clone(), f.cache.clone(), f.config.clone()))
        .with(ConversationSearchProcessor::new(f.store.clone()))
        .with(ConcurrentWrite {
            store: f.store.clone(),
            cache: f.cache.clone(),
            done: AtomicBool::new(false),
        })
        .with(ExchangeSearchProcessor::new(f.store.clone()))
        .with(ContextFormatterProcessor::new(Arc::new(CharEstimator)));
    let racing = Retriever::with_pipeline(pipeline, f.cache.clone(), f.config.clone());

    let first = racing.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(first.conversations.iter().all(|c| c.conversation_id != 4));
    assert!(f.cache.is_empty());
    assert_eq!(f.cache.stats().stale_puts, 1);

    let second = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(!second.metadata.cache_hit);
    let ids: Vec<i64> = second.conversations.iter().map(|c| c.conversation_id).collect();
    assert_eq!(ids, vec![4, 1, 2]);
    assert!(second.context.contains("Query planner deep dive"));
}

#[tokio::test]
async fn test_settings_change_bypasses_cache() {
    let f = fixture(seeded_store(true), scenario_config());
    let first = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;

    f.config.update(|c| c.retrieval.exchange_global_cap = 1).unwrap();
    let second = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(!second.metadata.cache_hit);
    assert_eq!(second.metadata.exchange_count, 1);
    assert_ne!(first.context, second.context);
}

#[tokio::test]
async fn test_disabling_cache_changes_nothing_but_latency() {
    let cached = fixture(seeded_store(true), scenario_config());
    let mut config = scenario_config();
    config.cache.enabled = false;
    let uncached = fixture(seeded_store(true), config);

    for _ in 0..2 {
        let a = cached.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
        let b = uncached.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
        assert_eq!(a.context, b.context);
        assert_eq!(a.exchanges, b.exchanges);
        assert!(!b.metadata.cache_hit);
    }
    assert_eq!(uncached.client.calls(), 2);
    assert!(uncached.cache.is_empty());
}

#[tokio::test]
async fn test_budget_is_respected_and_monotone() {
    let mut previous = usize::MAX;
    for budget in [400, 120, 60, 30, 12, 1] {
        let mut config = scenario_config();
        config.retrieval.token_budget = budget;
        let f = fixture(seeded_store(true), config);

        let result = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
        assert!(result.metadata.total_tokens_estimate <= budget);
        let included = result.metadata.conversation_count + result.metadata.exchange_count;
        assert!(included <= previous);
        previous = included;
    }
    assert_eq!(previous, 0);
}

#[tokio::test]
async fn test_query_embedding_failure_yields_empty_result_with_error() {
    let f = fixture(seeded_store(true), scenario_config());
    f.client.fail_next(EmbeddingClientError::permanent("invalid api key"));

    let result = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(result.is_empty());
    assert!(result.conversations.is_empty());
    assert!(result.metadata.error.as_deref().unwrap().contains("invalid api key"));
    assert!(f.cache.is_empty());

    // the next turn works again
    let result = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(result.metadata.error.is_none());
    assert_eq!(result.metadata.conversation_count, 2);
}

#[tokio::test]
async fn test_empty_query_does_not_call_client() {
    let f = fixture(seeded_store(true), scenario_config());
    let result = f.retriever.retrieve(&RetrievalRequest::new("   ")).await;
    assert!(result.is_empty());
    assert!(result.metadata.error.is_some());
    assert_eq!(f.client.calls(), 0);
}

#[tokio::test]
async fn test_failed_search_degrades_to_partial_context() {
    // The store holds 3-dim vectors, so both searches reject the 4-dim query
    let store = Arc::new(EmbeddingStore::open_in_memory(3, true).unwrap());
    let f = fixture(store, scenario_config());

    let result = f.retriever.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(result.metadata.error.is_none());
    assert_eq!(result.metadata.degraded.len(), 2);
    assert!(result.metadata.degraded[0].starts_with("conversation_search"));
    assert!(result.is_empty());
    // partial results are not cached
    assert!(f.cache.is_empty());
}

#[tokio::test]
async fn test_deadline_cancels_slow_embedding() {
    let f = fixture(seeded_store(true), scenario_config());
    f.client.set_delay(Duration::from_secs(5));

    let request = RetrievalRequest::new(QUERY).with_deadline(Duration::from_millis(50));
    let started = std::time::Instant::now();
    let result = f.retriever.retrieve(&request).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.is_empty());
    assert!(result.metadata.error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn test_cancelled_request_returns_without_context() {
    let f = fixture(seeded_store(true), scenario_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = f
        .retriever
        .retrieve_with_cancel(&RetrievalRequest::new(QUERY), cancel)
        .await;
    assert!(result.is_empty());
    assert_eq!(f.client.calls(), 0);
}

#[tokio::test]
async fn test_service_disable_and_test_retrieval() {
    let store = seeded_store(true);
    let client = query_client();
    let service = RagService::with_store(scenario_config(), store, client, Arc::new(CharEstimator)).unwrap();

    service.disable();
    assert!(service.wait_until_paused(Duration::from_secs(2)).await);

    let result = service.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(result.is_empty());

    let tested = service.test_retrieval(QUERY).await;
    assert_eq!(tested.metadata.conversation_count, 2);

    service.enable();
    assert!(eventually(Duration::from_secs(2), || !service.worker().snapshot().parked).await);
    let result = service.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert_eq!(result.metadata.exchange_count, 3);

    let status = service.status().unwrap();
    assert!(status.enabled);
    assert_eq!(status.embeddings.conversation_summary, 3);
    assert_eq!(status.embeddings.exchange_summary, 6);

    assert!(service.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_service_delete_drops_cached_context() {
    let service =
        RagService::with_store(scenario_config(), seeded_store(true), query_client(), Arc::new(CharEstimator)).unwrap();

    let before = service.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(before.context.contains("Tuning postgres"));

    service.delete_conversation(1).unwrap();
    let after = service.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(!after.metadata.cache_hit);
    assert!(!after.context.contains("Tuning postgres"));
    assert!(!after.context.contains("Raised shared_buffers"));

    let err = service.delete_conversation(1).unwrap_err();
    assert!(matches!(err, rag_memory::Error::NotFound(_)));

    service.delete_exchange(21).unwrap();
    let after = service.retrieve(&RetrievalRequest::new(QUERY)).await;
    assert!(!after.context.contains("Dropped unused indexes"));

    assert!(service.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_service_rejects_mismatched_dimensions() {
    let store = Arc::new(EmbeddingStore::open_in_memory(DIMS + 1, false).unwrap());
    let err = RagService::with_store(test_config(), store, query_client(), Arc::new(CharEstimator));
    assert!(err.is_err());
}

#[tokio::test]
async fn test_service_configure_resizes_cache() {
    let client = query_client();
    client.map("index maintenance", at_similarity(0.9));
    let service = RagService::with_store(scenario_config(), seeded_store(true), client, Arc::new(CharEstimator)).unwrap();

    service.configure(|c| c.cache.capacity = 1).unwrap();
    assert_eq!(service.cache().capacity(), 1);

    service.retrieve(&RetrievalRequest::new(QUERY)).await;
    service.retrieve(&RetrievalRequest::new("index maintenance")).await;
    assert_eq!(service.cache().len(), 1);

    // rejected updates leave the cache alone
    assert!(service.configure(|c| c.cache.capacity = 0).is_err());
    assert_eq!(service.cache().capacity(), 1);

    assert!(service.shutdown(Duration::from_secs(2)).await);
}
