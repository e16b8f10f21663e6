//! Embedding client interface, a local fastembed client, and token estimators

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::config::Config;
use crate::error::{EmbeddingClientError, Error, Result};

/// Vectors for a batch of texts, in input order, plus what they cost
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub tokens_used: u64,
    pub cost: f64,
}

/// Turns text into vectors.
///
/// Implementations bound their own latency (request timeouts etc.) and
/// classify failures as transient or permanent.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> std::result::Result<EmbeddingBatch, EmbeddingClientError>;

    /// Output dimensionality
    fn dimensions(&self) -> usize;
}

/// Output width of all-MiniLM-L6-v2
pub const LOCAL_MODEL_DIMENSIONS: usize = 384;

/// Local embedding client, no API keys
pub struct LocalEmbeddingClient {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
    estimator: CharEstimator,
}

impl LocalEmbeddingClient {
    /// Load the local model; the configured dimensions must match its output
    pub fn new(config: &Config) -> Result<Self> {
        check_model_dimensions(config.embedding_dimensions)?;

        // Use all-MiniLM-L6-v2 by default (384 dimensions, fast, good quality)
        // Model downloads automatically on first use to ~/.cache/fastembed
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true),
        )
        .map_err(|e| Error::config(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions: LOCAL_MODEL_DIMENSIONS,
            estimator: CharEstimator,
        })
    }
}

fn check_model_dimensions(configured: usize) -> Result<()> {
    if configured != LOCAL_MODEL_DIMENSIONS {
        return Err(Error::config(format!(
            "embedding_dimensions is {} but the local model produces {}-dimensional vectors",
            configured, LOCAL_MODEL_DIMENSIONS
        )));
    }
    Ok(())
}

#[async_trait]
impl EmbeddingClient for LocalEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> std::result::Result<EmbeddingBatch, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch::default());
        }

        let tokens_used = texts.iter().map(|t| self.estimator.estimate(t) as u64).sum();
        let model = self.model.clone();
        let texts = texts.to_vec();

        // Inference is CPU-bound, keep it off the async workers
        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| EmbeddingClientError::transient("embedding model lock poisoned"))?;
            guard
                .embed(texts, None)
                .map_err(|e| EmbeddingClientError::permanent(format!("Embedding failed: {}", e)))
        })
        .await
        .map_err(|e| EmbeddingClientError::transient(format!("Embedding task join error: {}", e)))??;

        Ok(EmbeddingBatch {
            vectors,
            tokens_used,
            cost: 0.0,
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Estimates how many model tokens a piece of text occupies
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Default estimator: one token per four characters, rounded up.
///
/// Rounding up keeps the estimate sub-additive, so the estimate of a
/// concatenation never exceeds the sum of the parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Token counter using tiktoken
pub struct TiktokenEstimator {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenEstimator {
    /// Create a new token counter for a specific model
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self { bpe })
    }

    /// cl100k_base, close enough for Claude and GPT-4 class models
    pub fn for_gpt() -> Result<Self> {
        Self::new("gpt-4")
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_client_rejects_other_dimensions() {
        assert!(check_model_dimensions(LOCAL_MODEL_DIMENSIONS).is_ok());
        assert!(matches!(check_model_dimensions(768), Err(Error::Config(_))));

        // fails before any model download is attempted
        let mut config = Config::with_data_dir(std::env::temp_dir().join("rag-memory-dims"));
        config.embedding_dimensions = 768;
        assert!(matches!(LocalEmbeddingClient::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_char_estimator_rounds_up() {
        let est = CharEstimator;
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("abc"), 1);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
        // counts characters, not bytes
        assert_eq!(est.estimate("日本語です"), 2);
    }

    #[test]
    fn test_char_estimator_is_subadditive() {
        let est = CharEstimator;
        let parts = ["## Heading\n", "- a short line\n", "x", "another piece of text\n"];
        let whole: String = parts.concat();
        let sum: usize = parts.iter().map(|p| est.estimate(p)).sum();
        assert!(est.estimate(&whole) <= sum);
    }

    #[test]
    fn test_tiktoken_counts_bpe_tokens() {
        let est = TiktokenEstimator::for_gpt().unwrap();
        assert_eq!(est.estimate("hello world"), 2);
        assert_eq!(est.estimate(""), 0);
    }
}
