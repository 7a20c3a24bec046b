//! The semantic side of retrieval: embedding providers, the
//! [`SemanticBackend`] capability chosen at construction time, and the
//! embedding cache.
//!
//! This crate never computes embeddings. An [`EmbeddingProvider`] turns text
//! into vectors; [`EmbeddingIndex`] wraps one with a budget, a dimension
//! check and a TTL cache keyed by text hash. [`NoSemantic`] stands in when no
//! provider is configured and always reports that no embedding is available.

use std::{future::Future, sync::Arc, time::Duration};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;

// ─── Provider ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
  #[error("provider unavailable: {0}")]
  Unavailable(String),
}

/// An external embedding model reached through `embed(text, timeout)`.
pub trait EmbeddingProvider: Send + Sync + 'static {
  /// Identifier stored alongside every vector this provider produces.
  fn model(&self) -> &str;

  /// Length of every vector this provider returns.
  fn dims(&self) -> usize;

  /// Embed `text`, giving up after `timeout`. Implementations should honour
  /// the timeout themselves; [`EmbeddingIndex`] enforces it regardless.
  fn embed<'a>(
    &'a self,
    text: &'a str,
    timeout: Duration,
  ) -> impl Future<Output = Result<Vec<f32>, ProviderError>> + Send + 'a;
}

// ─── Backend capability ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemanticError {
  #[error("no embedding: {0}")]
  NoEmbedding(String),

  /// The caller stopped waiting. Nothing was cached.
  #[error("embedding cancelled")]
  Cancelled,
}

impl From<SemanticError> for crate::Error {
  fn from(e: SemanticError) -> Self { crate::Error::EmbeddingUnavailable(e.to_string()) }
}

/// Semantic search capability, present or absent.
pub trait SemanticBackend: Send + Sync + 'static {
  /// `None` when the backend cannot embed at all.
  fn model(&self) -> Option<&str>;

  fn dims(&self) -> Option<usize>;

  /// Embed `text` unless `cancel` fires first.
  fn embed<'a>(
    &'a self,
    text: &'a str,
    cancel: &'a CancellationToken,
  ) -> impl Future<Output = Result<Vec<f32>, SemanticError>> + Send + 'a;
}

/// The backend used when no embedding provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSemantic;

impl SemanticBackend for NoSemantic {
  fn model(&self) -> Option<&str> { None }

  fn dims(&self) -> Option<usize> { None }

  async fn embed<'a>(
    &'a self,
    _text: &'a str,
    _cancel: &'a CancellationToken,
  ) -> Result<Vec<f32>, SemanticError> {
    Err(SemanticError::NoEmbedding("no embedding provider configured".into()))
  }
}

// ─── Embedding index ─────────────────────────────────────────────────────────

/// A provider with a per-call budget and a TTL cache in front of it.
pub struct EmbeddingIndex<P> {
  provider: Arc<P>,
  budget:   Duration,
  cache:    TtlCache<String, Arc<Vec<f32>>>,
}

impl<P: EmbeddingProvider> EmbeddingIndex<P> {
  pub fn new(provider: P, budget: Duration, cache: TtlCache<String, Arc<Vec<f32>>>) -> Self {
    Self { provider: Arc::new(provider), budget, cache }
  }

  pub fn provider(&self) -> &P { &self.provider }

  /// Hash of model and text, used as the cache key.
  fn cache_key(&self, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.provider.model().as_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
  }

  async fn fetch(&self, text: &str) -> Result<Vec<f32>, SemanticError> {
    let vector = match tokio::time::timeout(self.budget, self.provider.embed(text, self.budget)).await
    {
      Ok(Ok(vector)) => vector,
      Ok(Err(ProviderError::Unavailable(reason))) => return Err(SemanticError::NoEmbedding(reason)),
      Err(_) => {
        return Err(SemanticError::NoEmbedding(format!(
          "provider exceeded its {:?} budget",
          self.budget
        )));
      }
    };

    let dims = self.provider.dims();
    if vector.len() != dims {
      return Err(SemanticError::NoEmbedding(format!(
        "provider returned {} dims, expected {dims}",
        vector.len()
      )));
    }
    Ok(vector)
  }
}

impl<P: EmbeddingProvider> SemanticBackend for EmbeddingIndex<P> {
  fn model(&self) -> Option<&str> { Some(self.provider.model()) }

  fn dims(&self) -> Option<usize> { Some(self.provider.dims()) }

  async fn embed<'a>(
    &'a self,
    text: &'a str,
    cancel: &'a CancellationToken,
  ) -> Result<Vec<f32>, SemanticError> {
    let key = self.cache_key(text);
    if let Some(vector) = self.cache.get(&key) {
      tracing::debug!(model = self.provider.model(), "embedding cache hit");
      return Ok(vector.as_ref().clone());
    }

    let vector = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(SemanticError::Cancelled),
      result = self.fetch(text) => result?,
    };

    // A caller that gave up while we were finishing writes nothing.
    if cancel.is_cancelled() {
      return Err(SemanticError::Cancelled);
    }
    self.cache.insert(key, Arc::new(vector.clone()));
    Ok(vector)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::timer::TimerRegistry;

  struct Counting {
    calls:  AtomicUsize,
    dims:   usize,
    delay:  Duration,
    result: Option<Vec<f32>>,
  }

  impl Counting {
    fn new(result: Option<Vec<f32>>, delay: Duration) -> Self {
      Self { calls: AtomicUsize::new(0), dims: 2, delay, result }
    }
  }

  impl EmbeddingProvider for Counting {
    fn model(&self) -> &str { "counting" }

    fn dims(&self) -> usize { self.dims }

    async fn embed<'a>(&'a self, _text: &'a str, _timeout: Duration) -> Result<Vec<f32>, ProviderError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(self.delay).await;
      self.result.clone().ok_or_else(|| ProviderError::Unavailable("down".into()))
    }
  }

  fn index(provider: Counting, budget: Duration) -> EmbeddingIndex<Counting> {
    let cache = TtlCache::new(TimerRegistry::new(), Duration::from_secs(60), 16);
    EmbeddingIndex::new(provider, budget, cache)
  }

  #[tokio::test]
  async fn no_semantic_is_always_unavailable() {
    let token = CancellationToken::new();
    assert!(matches!(NoSemantic.embed("x", &token).await, Err(SemanticError::NoEmbedding(_))));
    assert_eq!(NoSemantic.model(), None);
  }

  #[tokio::test]
  async fn repeated_text_hits_cache() {
    let idx = index(Counting::new(Some(vec![1.0, 0.0]), Duration::ZERO), Duration::from_secs(1));
    let token = CancellationToken::new();

    assert_eq!(idx.embed("hello", &token).await.unwrap(), vec![1.0, 0.0]);
    assert_eq!(idx.embed("hello", &token).await.unwrap(), vec![1.0, 0.0]);
    assert_eq!(idx.provider().calls.load(Ordering::SeqCst), 1);

    idx.embed("other", &token).await.unwrap();
    assert_eq!(idx.provider().calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn unavailable_and_slow_providers_report_no_embedding() {
    let idx = index(Counting::new(None, Duration::ZERO), Duration::from_secs(1));
    let token = CancellationToken::new();
    assert!(matches!(idx.embed("x", &token).await, Err(SemanticError::NoEmbedding(_))));

    let idx = index(Counting::new(Some(vec![1.0, 0.0]), Duration::from_secs(5)), Duration::from_millis(20));
    assert!(matches!(idx.embed("x", &token).await, Err(SemanticError::NoEmbedding(_))));
  }

  #[tokio::test]
  async fn wrong_dimensionality_is_rejected() {
    let idx = index(Counting::new(Some(vec![1.0, 0.0, 0.0]), Duration::ZERO), Duration::from_secs(1));
    let token = CancellationToken::new();
    assert!(matches!(idx.embed("x", &token).await, Err(SemanticError::NoEmbedding(_))));
  }

  #[tokio::test]
  async fn cancellation_wins_and_caches_nothing() {
    let idx = index(Counting::new(Some(vec![1.0, 0.0]), Duration::from_secs(5)), Duration::from_secs(10));
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      cancel.cancel();
    });

    assert_eq!(idx.embed("x", &token).await, Err(SemanticError::Cancelled));
    assert_eq!(idx.cache.len(), 0);
  }
}
