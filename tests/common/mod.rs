//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use rag_memory::config::Config;
use rag_memory::embedding::{EmbeddingBatch, EmbeddingClient};
use rag_memory::error::EmbeddingClientError;

pub const DIMS: usize = 4;

/// Unit vector whose cosine similarity to [`axis`] is `similarity`
pub fn at_similarity(similarity: f32) -> Vec<f32> {
    vec![similarity, (1.0 - similarity * similarity).max(0.0).sqrt(), 0.0, 0.0]
}

/// The reference query direction
pub fn axis() -> Vec<f32> {
    vec![1.0, 0.0, 0.0, 0.0]
}

/// A vector unrelated to [`axis`]
pub fn orthogonal() -> Vec<f32> {
    vec![0.0, 0.0, 1.0, 0.0]
}

/// Fixed timestamps so runs are reproducible
pub fn minute(m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::minutes(m as i64)
}

/// Embedding client driven by a script.
///
/// Texts containing a registered keyword get that keyword's vector; anything
/// else gets [`orthogonal`]. Queued failures are returned, one per call,
/// before any success.
pub struct ScriptedClient {
    keywords: Mutex<Vec<(String, Vec<f32>)>>,
    failures: Mutex<VecDeque<EmbeddingClientError>>,
    always_fail: Mutex<Option<EmbeddingClientError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    texts_embedded: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keywords: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        })
    }

    pub fn map(&self, keyword: &str, vector: Vec<f32>) {
        self.keywords.lock().unwrap().push((keyword.to_lowercase(), vector));
    }

    pub fn fail_next(&self, error: EmbeddingClientError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn fail_always(&self, error: Option<EmbeddingClientError>) {
        *self.always_fail.lock().unwrap() = error;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let text = text.to_lowercase();
        self.keywords
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| text.contains(k.as_str()))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(orthogonal)
    }
}

#[async_trait]
impl EmbeddingClient for ScriptedClient {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch, EmbeddingClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.always_fail.lock().unwrap().clone() {
            return Err(err);
        }

        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(EmbeddingBatch {
            vectors: texts.iter().map(|t| self.vector_for(t)).collect(),
            tokens_used: texts.iter().map(|t| t.len() as u64 / 4).sum(),
            cost: 0.0001 * texts.len() as f64,
        })
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// Config with fast worker timings for tests
pub fn test_config() -> Config {
    let mut config = Config::with_data_dir(std::env::temp_dir().join("rag-memory-tests"));
    config.embedding_dimensions = DIMS;
    config.worker.rate_limit_ms = 10;
    config.worker.idle_poll_ms = 20;
    config.worker.backoff_base_ms = 10;
    config.worker.backoff_max_ms = 40;
    config.worker.max_attempts = 3;
    config
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
