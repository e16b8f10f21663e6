//! The four retrieval stages

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::format::format_context;
use super::{Processor, RetrievalContext, RetrievalMetadata};
use crate::cache::{CacheKey, RagCache};
use crate::config::ConfigProvider;
use crate::embedding::{EmbeddingClient, TokenEstimator};
use crate::storage::EmbeddingStore;

/// Embeds the query text exactly once, or answers the whole request from the cache
pub struct QueryEmbeddingProcessor {
    client: Arc<dyn EmbeddingClient>,
    cache: Arc<RagCache>,
    config: Arc<dyn ConfigProvider>,
}

impl QueryEmbeddingProcessor {
    pub fn new(client: Arc<dyn EmbeddingClient>, cache: Arc<RagCache>, config: Arc<dyn ConfigProvider>) -> Self {
        Self { client, cache, config }
    }

    async fn embed(&self, ctx: &RetrievalContext) -> Result<Vec<f32>, String> {
        let texts = vec![ctx.query.clone()];
        let batch = tokio::select! {
            res = self.client.embed(&texts) => res.map_err(|e| e.to_string())?,
            _ = ctx.cancel.cancelled() => return Err("cancelled while embedding query".to_string()),
        };

        let vector = batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| "embedding client returned no vector".to_string())?;
        if vector.len() != self.client.dimensions() {
            return Err(format!(
                "embedding client returned {} dimensions, expected {}",
                vector.len(),
                self.client.dimensions()
            ));
        }
        Ok(vector)
    }
}

#[async_trait]
impl Processor for QueryEmbeddingProcessor {
    fn name(&self) -> &'static str {
        "query_embedding"
    }

    async fn process(&self, mut ctx: RetrievalContext) -> RetrievalContext {
        if ctx.query.trim().is_empty() {
            return ctx.fail("query is empty");
        }

        let cache = self.config.cache();
        let memoized = if cache.enabled {
            self.cache.query_embedding(&ctx.query)
        } else {
            None
        };

        let embedding = match memoized {
            Some(v) => v,
            None => match self.embed(&ctx).await {
                Ok(v) => {
                    if cache.enabled {
                        self.cache.put_query_embedding(&ctx.query, v.clone(), cache.ttl);
                    }
                    v
                }
                Err(e) => {
                    warn!("Query embedding failed, continuing without memory: {}", e);
                    return ctx.fail(format!("query embedding failed: {}", e));
                }
            },
        };

        if cache.enabled {
            let key = CacheKey::new(&embedding, ctx.settings.fingerprint(), ctx.current_conversation);
            ctx.cache_generation = self.cache.generation();
            if let Some(hit) = self.cache.get(key) {
                debug!("Retrieval cache hit");
                ctx.formatted_context = hit.context;
                ctx.conversation_matches = hit.conversations;
                ctx.exchange_matches = hit.exchanges;
                ctx.metadata = RetrievalMetadata {
                    request_id: ctx.metadata.request_id,
                    cache_hit: true,
                    ..hit.metadata
                };
                ctx.halted = true;
            }
            ctx.cache_key = Some(key);
        }

        ctx.query_embedding = Some(embedding);
        ctx
    }
}

/// Finds the conversations whose summaries are closest to the query
pub struct ConversationSearchProcessor {
    store: Arc<EmbeddingStore>,
}

impl ConversationSearchProcessor {
    pub fn new(store: Arc<EmbeddingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Processor for ConversationSearchProcessor {
    fn name(&self) -> &'static str {
        "conversation_search"
    }

    async fn process(&self, mut ctx: RetrievalContext) -> RetrievalContext {
        let Some(query) = ctx.query_embedding.as_deref() else {
            return ctx;
        };

        let settings = &ctx.settings;
        match self.store.search_conversations(
            query,
            settings.conversation_limit,
            settings.conversation_min_similarity,
            ctx.current_conversation,
        ) {
            Ok(outcome) => {
                ctx.metadata.fallback_mode_used |= outcome.fallback;
                ctx.conversation_matches = outcome.matches;
            }
            Err(e) => {
                warn!("Conversation search failed: {}", e);
                ctx.degrade(self.name(), e);
            }
        }
        ctx
    }
}

/// Finds exchanges inside the matched conversations, or across all of them
/// when no conversation matched
pub struct ExchangeSearchProcessor {
    store: Arc<EmbeddingStore>,
}

impl ExchangeSearchProcessor {
    pub fn new(store: Arc<EmbeddingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Processor for ExchangeSearchProcessor {
    fn name(&self) -> &'static str {
        "exchange_search"
    }

    async fn process(&self, mut ctx: RetrievalContext) -> RetrievalContext {
        let Some(query) = ctx.query_embedding.as_deref() else {
            return ctx;
        };

        let conversation_ids: Vec<i64> = ctx.conversation_matches.iter().map(|c| c.conversation_id).collect();
        let scope = (!conversation_ids.is_empty()).then_some(conversation_ids.as_slice());

        let settings = &ctx.settings;
        let searched = self.store.search_exchanges(
            query,
            scope,
            settings.exchanges_per_conversation,
            settings.exchange_global_cap,
            settings.exchange_min_similarity,
        );

        match searched {
            Ok(outcome) => {
                ctx.metadata.fallback_mode_used |= outcome.fallback;
                ctx.exchange_matches = outcome.matches;
            }
            Err(e) => {
                warn!("Exchange search failed: {}", e);
                ctx.degrade(self.name(), e);
            }
        }
        ctx
    }
}

/// Renders the matches into the token-budgeted context string
pub struct ContextFormatterProcessor {
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextFormatterProcessor {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }
}

#[async_trait]
impl Processor for ContextFormatterProcessor {
    fn name(&self) -> &'static str {
        "context_formatter"
    }

    async fn process(&self, mut ctx: RetrievalContext) -> RetrievalContext {
        if ctx.cancel.is_cancelled() {
            return ctx.fail("cancelled before formatting");
        }

        let formatted = format_context(
            &ctx.conversation_matches,
            &ctx.exchange_matches,
            &ctx.settings,
            self.estimator.as_ref(),
        );

        ctx.metadata.conversation_count = formatted.conversations;
        ctx.metadata.exchange_count = formatted.exchanges;
        ctx.metadata.total_tokens_estimate = formatted.tokens;
        ctx.metadata.duration_ms = ctx.elapsed().as_millis() as u64;
        ctx.formatted_context = formatted.text;
        ctx
    }
}
