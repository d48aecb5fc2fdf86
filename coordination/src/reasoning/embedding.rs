//! Embedding helpers: cosine similarity and a bounded LRU cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{Embedder, GenerationError};

/// Default number of cached embeddings.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for empty vectors, mismatched lengths, or a zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

struct CacheEntry {
    vector: Vec<f32>,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Embedder wrapper that remembers vectors by exact text.
///
/// The convergence window re-embeds the same recent statements every turn;
/// the cache turns those into lookups.
pub struct CachedEmbedder<E: Embedder + ?Sized> {
    inner: Arc<E>,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl<E: Embedder + ?Sized> CachedEmbedder<E> {
    pub fn new(inner: Arc<E>) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(inner: Arc<E>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// (hits, misses) so far.
    pub fn stats(&self) -> (u64, u64) {
        match self.state.lock() {
            Ok(state) => (state.hits, state.misses),
            Err(_) => (0, 0),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, text: &str) -> Option<Vec<f32>> {
        let mut state = self.state.lock().ok()?;
        state.tick += 1;
        let tick = state.tick;
        match state.entries.get_mut(text) {
            Some(entry) => {
                entry.last_used = tick;
                let vector = entry.vector.clone();
                state.hits += 1;
                Some(vector)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    fn insert(&self, text: &str, vector: &[f32]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.tick += 1;
        let tick = state.tick;
        if !state.entries.contains_key(text) && state.entries.len() >= self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                state.entries.remove(&key);
                debug!(capacity = self.capacity, "Evicted least recently used embedding");
            }
        }
        state.entries.insert(
            text.to_string(),
            CacheEntry {
                vector: vector.to_vec(),
                last_used: tick,
            },
        );
    }
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for CachedEmbedder<E> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        if let Some(vector) = self.lookup(text) {
            return Ok(vector);
        }
        let vector = self.inner.embed(text).await?;
        self.insert(text, &vector);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_cache_hits_skip_inner() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cache = CachedEmbedder::new(inner.clone());

        let a = cache.embed("hello").await.unwrap();
        let b = cache.embed("hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), (1, 1));
    }

    #[tokio::test]
    async fn test_cache_evicts_least_recently_used() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cache = CachedEmbedder::with_capacity(inner.clone(), 2);

        cache.embed("a").await.unwrap();
        cache.embed("bb").await.unwrap();
        cache.embed("a").await.unwrap(); // touch "a"
        cache.embed("ccc").await.unwrap(); // evicts "bb"
        assert_eq!(cache.len(), 2);

        let before = inner.calls.load(Ordering::SeqCst);
        cache.embed("a").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), before);
        cache.embed("bb").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), before + 1);
    }
}
