//! Embedding provider seam and the helpers built around it.
//!
//! The engine never computes embeddings itself. A host injects an
//! [`EmbeddingProvider`]; without one every corpus runs lexical-only.

use crate::error::ProviderError;
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Turns text into a fixed-size vector.
///
/// Implementations are typically network clients. Every vector returned by
/// one provider instance must have the same dimensionality.
pub trait EmbeddingProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>>;
}

/// Rejects vectors no similarity can be computed from.
pub fn validate_vector(vector: &[f32], expected_dims: Option<usize>) -> Result<(), ProviderError> {
    if vector.is_empty() {
        return Err(ProviderError::InvalidResponse("empty vector".into()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(ProviderError::InvalidResponse("vector contains non-finite values".into()));
    }
    match expected_dims {
        Some(dims) if dims != vector.len() => Err(ProviderError::InvalidResponse(format!(
            "expected {} dimensions, got {}",
            dims,
            vector.len()
        ))),
        _ => Ok(()),
    }
}

/// Embeds `documents` with at most `concurrency` requests in flight.
///
/// Results are yielded in input order, one per document.
pub fn embed_documents(
    provider: Arc<dyn EmbeddingProvider>,
    documents: Vec<(String, String)>,
    concurrency: usize,
) -> impl Stream<Item = (String, Result<Vec<f32>, ProviderError>)> {
    stream::iter(documents)
        .map(move |(id, text)| {
            let provider = Arc::clone(&provider);
            async move {
                let result = provider.embed(&text).await;
                (id, result)
            }
        })
        .buffered(concurrency.max(1))
}

/// LRU of query text → query vector.
pub struct QueryEmbeddingCache {
    entries: Option<Mutex<LruCache<String, Arc<[f32]>>>>,
}

impl std::fmt::Debug for QueryEmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEmbeddingCache")
            .field("cached", &self.len())
            .finish()
    }
}

impl QueryEmbeddingCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| {
            entries.lock().unwrap_or_else(|e| e.into_inner()).len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached vector for `query`, embedding it on a miss.
    /// Failures are not cached.
    pub async fn get_or_embed(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
    ) -> Result<Arc<[f32]>, ProviderError> {
        if let Some(entries) = &self.entries {
            let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(vector) = entries.get(query) {
                tracing::trace!("Query embedding cache hit");
                return Ok(Arc::clone(vector));
            }
        }

        let vector = provider.embed(query).await?;
        validate_vector(&vector, None)?;
        let vector: Arc<[f32]> = Arc::from(vector);

        if let Some(entries) = &self.entries {
            entries
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(query.to_string(), Arc::clone(&vector));
        }
        Ok(vector)
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{check, let_assert};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Embeds text as `[len, vowels]`, counting calls.
    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if text == "fail" {
                    return Err(ProviderError::Request("boom".into()));
                }
                let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count();
                Ok(vec![text.len() as f32, vowels as f32])
            })
        }
    }

    /// Finishes requests in reverse order of submission.
    struct SlowFirstProvider;

    impl EmbeddingProvider for SlowFirstProvider {
        fn name(&self) -> &str {
            "slow-first"
        }

        fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
            Box::pin(async move {
                let delay = 40u64.saturating_sub(text.len() as u64 * 10);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(vec![text.len() as f32])
            })
        }
    }

    #[test]
    fn test_validate_vector() {
        check!(validate_vector(&[1.0, 2.0], None).is_ok());
        check!(validate_vector(&[1.0, 2.0], Some(2)).is_ok());
        check!(validate_vector(&[], None).is_err());
        check!(validate_vector(&[f32::NAN], None).is_err());
        check!(validate_vector(&[1.0, 2.0], Some(3)).is_err());
    }

    #[tokio::test]
    async fn test_embed_documents_preserves_order() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(SlowFirstProvider);
        let docs = vec![
            ("a".to_string(), "x".to_string()),
            ("b".to_string(), "xx".to_string()),
            ("c".to_string(), "xxx".to_string()),
        ];

        let results: Vec<_> = embed_documents(provider, docs, 3).collect().await;
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        check!(ids == vec!["a", "b", "c"]);
        let_assert!(Ok(vector) = &results[2].1);
        check!(vector == &vec![3.0]);
    }

    #[tokio::test]
    async fn test_embed_documents_reports_failures_per_document() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(CountingProvider::default());
        let docs = vec![
            ("ok".to_string(), "fine".to_string()),
            ("bad".to_string(), "fail".to_string()),
        ];

        let results: Vec<_> = embed_documents(provider, docs, 2).collect().await;
        check!(results[0].1.is_ok());
        let_assert!(Err(ProviderError::Request(_)) = &results[1].1);
    }

    #[tokio::test]
    async fn test_query_cache_embeds_once() {
        let provider = CountingProvider::default();
        let cache = QueryEmbeddingCache::new(4);

        let first = cache.get_or_embed(&provider, "search").await.unwrap();
        let second = cache.get_or_embed(&provider, "search").await.unwrap();

        check!(first == second);
        check!(provider.calls.load(Ordering::SeqCst) == 1);
        check!(cache.len() == 1);
    }

    #[tokio::test]
    async fn test_query_cache_evicts_least_recent() {
        let provider = CountingProvider::default();
        let cache = QueryEmbeddingCache::new(1);

        cache.get_or_embed(&provider, "one").await.unwrap();
        cache.get_or_embed(&provider, "two").await.unwrap();
        cache.get_or_embed(&provider, "one").await.unwrap();

        check!(provider.calls.load(Ordering::SeqCst) == 3);
    }

    #[tokio::test]
    async fn test_query_cache_disabled_and_failures_not_cached() {
        let provider = CountingProvider::default();
        let cache = QueryEmbeddingCache::new(0);

        cache.get_or_embed(&provider, "q").await.unwrap();
        cache.get_or_embed(&provider, "q").await.unwrap();
        check!(provider.calls.load(Ordering::SeqCst) == 2);
        check!(cache.is_empty());

        let cache = QueryEmbeddingCache::new(4);
        check!(cache.get_or_embed(&provider, "fail").await.is_err());
        check!(cache.is_empty());
    }
}
