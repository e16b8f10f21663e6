//! In-process cache for retrieval results and query embeddings
//!
//! Results are keyed by a hash of the quantized query embedding, the
//! ranking/formatting settings fingerprint and the excluded conversation.
//! Each entry remembers which conversations it was built from so a write for
//! one conversation only drops the entries that could have changed.
//!
//! Every invalidation bumps a generation counter. A retrieval captures the
//! generation before it reads the store and `put` refuses its result if an
//! invalidation happened in between.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::error::{Error, Result};
use crate::record::ConversationId;
use crate::retrieval::RetrievalResult;

/// Embedding components are rounded to this many steps per unit before hashing
const QUANTIZATION: f32 = 10_000.0;

/// Cache key helper: hash a string to u64
fn hash_text(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Identity of a cached retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// Build a key from the query embedding and everything else the result depends on
    pub fn new(embedding: &[f32], fingerprint: u64, exclude: Option<ConversationId>) -> Self {
        let mut hasher = DefaultHasher::new();
        for x in embedding {
            ((x * QUANTIZATION).round() as i32).hash(&mut hasher);
        }
        fingerprint.hash(&mut hasher);
        exclude.hash(&mut hasher);
        Self(hasher.finish())
    }
}

struct Timed<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Timed<T> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct CachedResult {
    result: RetrievalResult,
    depends_on: HashSet<ConversationId>,
}

struct Inner {
    results: LruCache<CacheKey, Timed<CachedResult>>,
    embeddings: LruCache<u64, Timed<Vec<f32>>>,
    generation: u64,
}

/// Counters for the status endpoint
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub stale_puts: u64,
}

/// Bounded LRU + TTL cache.
///
/// One mutex guards both maps; it is never held across I/O. A poisoned lock
/// reads as a miss and drops writes.
pub struct RagCache {
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    stale_puts: AtomicU64,
}

impl RagCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity =
            NonZeroUsize::new(capacity).ok_or_else(|| Error::config("cache capacity must be at least 1"))?;

        Ok(Self {
            inner: Mutex::new(Inner {
                results: LruCache::new(capacity),
                embeddings: LruCache::new(capacity),
                generation: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            stale_puts: AtomicU64::new(0),
        })
    }

    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        Self::new(settings.capacity.max(1))
    }

    /// Change the capacity of both maps, evicting least recently used entries
    pub fn resize(&self, capacity: usize) -> Result<()> {
        let capacity =
            NonZeroUsize::new(capacity).ok_or_else(|| Error::config("cache capacity must be at least 1"))?;
        if let Some(mut inner) = self.lock() {
            if inner.results.cap() != capacity {
                debug!("Resizing retrieval cache to {}", capacity);
                inner.results.resize(capacity);
                inner.embeddings.resize(capacity);
            }
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.lock().map_or(0, |inner| inner.results.cap().get())
    }

    /// Current invalidation generation; pass it back to [`RagCache::put`]
    pub fn generation(&self) -> u64 {
        self.lock().map_or(0, |inner| inner.generation)
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!("{}", Error::cache(format!("lock poisoned, treating as miss: {}", e)));
                None
            }
        }
    }

    /// Cached result for `key`, if present and not expired
    pub fn get(&self, key: CacheKey) -> Option<RetrievalResult> {
        let now = Instant::now();
        let found = self.lock().and_then(|mut inner| {
            let live = inner.results.get(&key).map(|e| e.is_live(now))?;
            if live {
                inner.results.get(&key).map(|e| e.value.result.clone())
            } else {
                inner.results.pop(&key);
                None
            }
        });

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store a result built from the given conversations.
    ///
    /// `generation` is the value of [`RagCache::generation`] taken before the
    /// result was computed; the result is dropped if anything was invalidated
    /// since. Returns whether the entry was stored.
    pub fn put(
        &self,
        key: CacheKey,
        result: RetrievalResult,
        depends_on: HashSet<ConversationId>,
        ttl: Duration,
        generation: u64,
    ) -> bool {
        let Some(mut inner) = self.lock() else {
            return false;
        };
        if inner.generation != generation {
            self.stale_puts.fetch_add(1, Ordering::Relaxed);
            debug!("Not caching a result computed before an invalidation");
            return false;
        }
        inner.results.put(
            key,
            Timed {
                value: CachedResult { result, depends_on },
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    /// Look up a query by its text: memoized embedding first, then the result
    pub fn lookup(&self, query: &str, fingerprint: u64, exclude: Option<ConversationId>) -> Option<RetrievalResult> {
        let embedding = self.query_embedding(query)?;
        self.get(CacheKey::new(&embedding, fingerprint, exclude))
    }

    /// Memoized embedding of a query text
    pub fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        let now = Instant::now();
        let key = hash_text(query);
        self.lock().and_then(|mut inner| {
            let live = inner.embeddings.get(&key).map(|e| e.is_live(now))?;
            if live {
                inner.embeddings.get(&key).map(|e| e.value.clone())
            } else {
                inner.embeddings.pop(&key);
                None
            }
        })
    }

    pub fn put_query_embedding(&self, query: &str, embedding: Vec<f32>, ttl: Duration) {
        if let Some(mut inner) = self.lock() {
            inner.embeddings.put(
                hash_text(query),
                Timed {
                    value: embedding,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    /// Drop every result that was built from `conversation_id`
    pub fn invalidate(&self, conversation_id: ConversationId) -> usize {
        let Some(mut inner) = self.lock() else {
            return 0;
        };
        inner.generation += 1;

        let stale: Vec<CacheKey> = inner
            .results
            .iter()
            .filter(|(_, e)| e.value.depends_on.contains(&conversation_id))
            .map(|(k, _)| *k)
            .collect();
        for key in &stale {
            inner.results.pop(key);
        }

        if !stale.is_empty() {
            self.invalidations.fetch_add(stale.len() as u64, Ordering::Relaxed);
            debug!("Invalidated {} cached results for conversation {}", stale.len(), conversation_id);
        }
        stale.len()
    }

    /// Drop every cached result; memoized query embeddings survive
    pub fn invalidate_all(&self) -> usize {
        let Some(mut inner) = self.lock() else {
            return 0;
        };
        inner.generation += 1;
        let n = inner.results.len();
        inner.results.clear();
        self.invalidations.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Drop everything, including memoized embeddings
    pub fn clear(&self) {
        if let Some(mut inner) = self.lock() {
            inner.generation += 1;
            inner.results.clear();
            inner.embeddings.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |inner| inner.results.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            stale_puts: self.stale_puts.load(Ordering::Relaxed),
        }
    }
}
