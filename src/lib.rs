//! # RAG Memory
//!
//! Conversational memory for a coding-agent REPL: summaries of past
//! conversations and exchanges are embedded, stored, and retrieved to augment
//! new prompts.
//!
//! ## Architecture
//!
//! - **EmbeddingStore** - SQLite rows plus a sqlite-vec index, with a linear
//!   scan fallback that ranks identically
//! - **RagCache** - LRU + TTL cache of retrieval results, invalidated on writes
//! - **Retriever** - query embedding, conversation search, exchange search and
//!   token-budgeted formatting, run as a chain of processors
//! - **EmbeddingWorker** - background task that embeds pending summaries with
//!   batching, rate limiting and backoff; can be paused and resumed
//! - **RagService** - the operational surface over all of the above
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rag_memory::{Config, LocalEmbeddingClient, RagService, RetrievalRequest};
//!
//! let config = Config::from_env()?;
//! let client = Arc::new(LocalEmbeddingClient::new(&config)?);
//! let service = RagService::start(config, client)?;
//!
//! // Context for the next prompt, excluding the conversation being continued
//! let result = service
//!     .retrieve(&RetrievalRequest::new("database performance").excluding(current_id))
//!     .await;
//! println!("{}", result.context);
//! ```

pub mod backoff;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod record;
pub mod retrieval;
pub mod service;
pub mod storage;
pub mod worker;

pub use cache::RagCache;
pub use config::{Config, ConfigProvider, SharedConfig};
pub use embedding::{
    CharEstimator, EmbeddingBatch, EmbeddingClient, LocalEmbeddingClient, TiktokenEstimator, TokenEstimator,
};
pub use error::{EmbeddingClientError, Error, Result};
pub use record::{ConversationMatch, EmbeddingKind, EmbeddingRecord, ExchangeMatch, WorkItem};
pub use retrieval::{RetrievalRequest, RetrievalResult, Retriever};
pub use service::RagService;
pub use storage::EmbeddingStore;
pub use worker::{EmbeddingWorker, WorkerHandle, WorkerState, WorkerStatus};
