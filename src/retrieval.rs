//! Context retrieval for RAG-style memory injection
//!
//! A request flows through a chain of [`Processor`]s that each take the
//! [`RetrievalContext`] by value and hand it on:
//!
//! 1. [`QueryEmbeddingProcessor`] embeds the query (or answers from the cache)
//! 2. [`ConversationSearchProcessor`] finds related conversation summaries
//! 3. [`ExchangeSearchProcessor`] finds exchange summaries within them
//! 4. [`ContextFormatterProcessor`] packs both into a token-budgeted string
//!
//! Stages run one after another on the caller's task. A failing search stage
//! contributes nothing and is noted in the metadata; only a failed query
//! embedding ends the request early, with an empty context and an error.

mod format;
mod processors;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::cache::{CacheKey, RagCache};
use crate::config::{ConfigProvider, RetrievalSettings};
use crate::embedding::{EmbeddingClient, TokenEstimator};
use crate::record::{ConversationId, ConversationMatch, ExchangeMatch};
use crate::storage::EmbeddingStore;

pub use format::{format_context, FormattedContext};
pub use processors::{
    ContextFormatterProcessor, ConversationSearchProcessor, ExchangeSearchProcessor, QueryEmbeddingProcessor,
};

/// A retrieval request from the REPL
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,

    /// The conversation being continued; never returned as its own context
    #[serde(default)]
    pub current_conversation: Option<ConversationId>,

    /// Give up (with whatever metadata exists) after this long
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn excluding(mut self, conversation_id: ConversationId) -> Self {
        self.current_conversation = Some(conversation_id);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }
}

/// What happened while serving a request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalMetadata {
    pub request_id: Uuid,

    /// Wall-clock time for the whole chain
    pub duration_ms: u64,

    /// Conversation summaries included in the formatted context
    pub conversation_count: usize,

    /// Exchange summaries included in the formatted context
    pub exchange_count: usize,

    pub total_tokens_estimate: usize,
    pub cache_hit: bool,

    /// A search ran as a linear scan instead of on the native index
    pub fallback_mode_used: bool,

    /// Set when no context could be produced at all
    pub error: Option<String>,

    /// Stages that failed and contributed nothing, as "stage: reason"
    pub degraded: Vec<String>,
}

/// Pipeline accumulator, owned by one request
#[derive(Debug, Clone)]
pub struct RetrievalContext {
    pub query: String,
    pub current_conversation: Option<ConversationId>,

    /// Settings snapshot taken when the request started
    pub settings: RetrievalSettings,

    pub query_embedding: Option<Vec<f32>>,
    pub conversation_matches: Vec<ConversationMatch>,
    pub exchange_matches: Vec<ExchangeMatch>,
    pub formatted_context: String,
    pub metadata: RetrievalMetadata,

    /// Key under which the result will be cached, once the query is embedded
    pub cache_key: Option<CacheKey>,

    /// Cache generation seen before the store was read
    pub cache_generation: u64,

    /// Set by a stage that finished the request; later stages are skipped
    pub halted: bool,

    pub cancel: CancellationToken,
    started: Instant,
}

impl RetrievalContext {
    pub fn new(request: &RetrievalRequest, settings: RetrievalSettings) -> Self {
        Self {
            query: request.query.clone(),
            current_conversation: request.current_conversation,
            settings,
            query_embedding: None,
            conversation_matches: Vec::new(),
            exchange_matches: Vec::new(),
            formatted_context: String::new(),
            metadata: RetrievalMetadata {
                request_id: Uuid::new_v4(),
                ..Default::default()
            },
            cache_key: None,
            cache_generation: 0,
            halted: false,
            cancel: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    /// End the request with an empty context and an error
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.conversation_matches.clear();
        self.exchange_matches.clear();
        self.formatted_context.clear();
        self.metadata.conversation_count = 0;
        self.metadata.exchange_count = 0;
        self.metadata.total_tokens_estimate = 0;
        self.metadata.error = Some(error.into());
        self.halted = true;
        self
    }

    /// Record a stage that contributed nothing
    pub fn degrade(&mut self, stage: &str, reason: impl std::fmt::Display) {
        self.metadata.degraded.push(format!("{}: {}", stage, reason));
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Conversations the result was built from
    fn dependencies(&self) -> HashSet<ConversationId> {
        self.conversation_matches
            .iter()
            .map(|c| c.conversation_id)
            .chain(self.exchange_matches.iter().map(|x| x.conversation_id))
            .collect()
    }

    fn into_result(self) -> RetrievalResult {
        RetrievalResult {
            context: self.formatted_context,
            conversations: self.conversation_matches,
            exchanges: self.exchange_matches,
            metadata: self.metadata,
        }
    }
}

/// The answer handed back to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub context: String,
    pub conversations: Vec<ConversationMatch>,
    pub exchanges: Vec<ExchangeMatch>,
    pub metadata: RetrievalMetadata,
}

impl RetrievalResult {
    /// Empty context, e.g. while RAG is disabled
    pub fn empty() -> Self {
        Self {
            context: String::new(),
            conversations: Vec::new(),
            exchanges: Vec::new(),
            metadata: RetrievalMetadata {
                request_id: Uuid::new_v4(),
                ..Default::default()
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
    }
}

/// One stage of the retrieval chain.
///
/// Stages hold only shared, read-mostly collaborators; everything that
/// belongs to the request travels in the context.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: RetrievalContext) -> RetrievalContext;
}

/// Ordered chain of processors
#[derive(Default)]
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, processor: impl Processor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    pub fn stages(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub async fn run(&self, mut ctx: RetrievalContext) -> RetrievalContext {
        for processor in &self.processors {
            if ctx.halted {
                break;
            }
            if ctx.cancel.is_cancelled() {
                return ctx.fail(format!("cancelled before {}", processor.name()));
            }
            ctx = processor.process(ctx).await;
        }
        ctx
    }
}

/// Runs the retrieval chain and maintains the result cache around it
pub struct Retriever {
    pipeline: Pipeline,
    cache: Arc<RagCache>,
    config: Arc<dyn ConfigProvider>,
}

impl Retriever {
    /// The standard four-stage chain
    pub fn new(
        store: Arc<EmbeddingStore>,
        client: Arc<dyn EmbeddingClient>,
        cache: Arc<RagCache>,
        estimator: Arc<dyn TokenEstimator>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        let pipeline = Pipeline::new()
            .with(QueryEmbeddingProcessor::new(client, cache.clone(), config.clone()))
            .with(ConversationSearchProcessor::new(store.clone()))
            .with(ExchangeSearchProcessor::new(store))
            .with(ContextFormatterProcessor::new(estimator));

        Self::with_pipeline(pipeline, cache, config)
    }

    pub fn with_pipeline(pipeline: Pipeline, cache: Arc<RagCache>, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            pipeline,
            cache,
            config,
        }
    }

    /// Retrieve context for a query. Never fails; problems are reported in the metadata.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalResult {
        self.retrieve_with_cancel(request, CancellationToken::new()).await
    }

    /// Same as [`Retriever::retrieve`], abandoned once `cancel` fires
    pub async fn retrieve_with_cancel(&self, request: &RetrievalRequest, cancel: CancellationToken) -> RetrievalResult {
        let mut ctx = RetrievalContext::new(request, self.config.retrieval());
        ctx.cancel = cancel;
        let span = info_span!("retrieve", request_id = %ctx.metadata.request_id);

        let timer = request.deadline_ms.map(|ms| {
            let token = ctx.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                token.cancel();
            })
        });

        let mut ctx = self.pipeline.run(ctx).instrument(span).await;

        if let Some(timer) = timer {
            timer.abort();
        }

        ctx.metadata.duration_ms = ctx.elapsed().as_millis() as u64;

        // Partial results are not cached
        let complete = !ctx.metadata.cache_hit && ctx.metadata.error.is_none() && ctx.metadata.degraded.is_empty();
        let cache_settings = self.config.cache();
        if complete && cache_settings.enabled {
            if let Some(key) = ctx.cache_key {
                let depends_on = ctx.dependencies();
                let generation = ctx.cache_generation;
                let result = ctx.into_result();
                self.cache
                    .put(key, result.clone(), depends_on, cache_settings.ttl, generation);
                return result;
            }
        }

        debug!(
            cache_hit = ctx.metadata.cache_hit,
            conversations = ctx.metadata.conversation_count,
            exchanges = ctx.metadata.exchange_count,
            "retrieval finished"
        );
        ctx.into_result()
    }

    pub fn stages(&self) -> Vec<&'static str> {
        self.pipeline.stages()
    }
}
