//! The query path: cache, semantic race, lexical fallback, ranking.
//!
//! ```text
//! Started ─▶ cache hit? ──────────────────────────────────────▶ Returned
//!    │
//!    └─▶ SemanticAttempted ─┬─▶ SemanticSucceeded (≥1 result) ─▶ Ranked ─▶ Returned
//!                           └─▶ SemanticEmptyOrFailed ─▶ FallbackAttempted ─▶ Returned
//! ```
//!
//! The semantic branch races a timer. Whichever side loses is dropped and its
//! cancellation token fired, so an abandoned embedding call cannot write to
//! the embedding cache or hold anything open.
//!
//! Semantic search only sees patterns that already have an embedding. When it
//! answers, lexical hits it could not have seen are appended, so a freshly
//! stored pattern is findable before its embedding lands.
//!
//! A query only caches what it read if no write to its scope committed in the
//! meantime.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  sync::Arc,
  time::Duration,
};

use chrono::Utc;
use mnemo_core::{
  pattern::Pattern,
  store::{LexicalQuery, PatternStore},
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
  Error, Result,
  cache::TtlCache,
  ranking::{self, ScoringParams},
  semantic::SemanticBackend,
};

// ─── Types ───────────────────────────────────────────────────────────────────

/// A free-text query, optionally scoped to one namespace.
#[derive(Debug, Clone)]
pub struct Query {
  pub text:      String,
  pub namespace: Option<String>,
  /// Falls back to `query.default_limit`.
  pub limit:     Option<usize>,
}

impl Query {
  pub fn new(text: impl Into<String>) -> Self {
    Self { text: text.into(), namespace: None, limit: None }
  }

  pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = Some(namespace.into());
    self
  }

  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchedVia {
  Semantic,
  Lexical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
  pub id:          Uuid,
  pub namespace:   String,
  pub key:         String,
  pub value:       String,
  pub confidence:  f64,
  pub usage_count: u64,
  /// MMR score for semantic matches, confidence for lexical ones.
  pub score:       f64,
  pub matched_via: MatchedVia,
}

impl QueryResult {
  fn new(pattern: Pattern, score: f64, matched_via: MatchedVia) -> Self {
    Self {
      id: pattern.pattern_id,
      namespace: pattern.namespace,
      key: pattern.key,
      value: pattern.value,
      confidence: pattern.confidence.get(),
      usage_count: pattern.usage_count,
      score,
      matched_via,
    }
  }
}

/// Why the lexical path answered instead of the semantic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackReason {
  /// No backend, or the provider could not embed the query.
  Unavailable,
  Timeout,
  /// Semantic search ran but matched nothing.
  Empty,
  /// Semantic search failed for another reason (e.g. storage).
  Error,
}

impl fmt::Display for FallbackReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Unavailable => "unavailable",
      Self::Timeout => "timeout",
      Self::Empty => "empty",
      Self::Error => "error",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
  pub results:  Vec<QueryResult>,
  /// `None` when semantic search produced the results.
  pub fallback: Option<FallbackReason>,
  /// Served from the query cache.
  pub cached:   bool,
}

impl QueryOutcome {
  pub fn used_fallback(&self) -> bool { self.fallback.is_some() }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  namespace: Option<String>,
  text:      String,
  limit:     usize,
}

#[derive(Debug)]
pub struct CachedQuery {
  results:  Vec<QueryResult>,
  fallback: Option<FallbackReason>,
}

pub type QueryCache = TtlCache<QueryKey, Arc<CachedQuery>>;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
  pub timeout:            Duration,
  pub default_limit:      usize,
  pub scoring:            ScoringParams,
  pub touch_on_retrieval: bool,
}

/// What semantic search returned, and every pattern it considered.
struct SemanticHits {
  results: Vec<QueryResult>,
  indexed: HashSet<Uuid>,
}

/// Invalidation counters. Every invalidation of a namespace bumps its counter
/// and the global one; unscoped queries compare against the global counter.
#[derive(Debug, Default)]
struct Epochs {
  all:          u64,
  by_namespace: HashMap<String, u64>,
}

impl Epochs {
  fn current(&self, namespace: Option<&str>) -> u64 {
    match namespace {
      Some(ns) => self.by_namespace.get(ns).copied().unwrap_or(0),
      None => self.all,
    }
  }
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

pub struct QueryCoordinator<S, B> {
  store:    Arc<S>,
  backend:  Arc<B>,
  cache:    QueryCache,
  /// Held across every cache insert and invalidation.
  epochs:   Mutex<Epochs>,
  settings: CoordinatorSettings,
  /// Parent of every per-query token; cancelled on shutdown.
  shutdown: CancellationToken,
}

impl<S, B> QueryCoordinator<S, B>
where
  S: PatternStore,
  B: SemanticBackend,
{
  pub fn new(
    store: Arc<S>,
    backend: Arc<B>,
    cache: QueryCache,
    settings: CoordinatorSettings,
    shutdown: CancellationToken,
  ) -> Self {
    Self { store, backend, cache, epochs: Mutex::new(Epochs::default()), settings, shutdown }
  }

  pub async fn query(&self, query: &Query) -> Result<QueryOutcome> {
    let limit = query.limit.unwrap_or(self.settings.default_limit);
    if limit == 0 {
      return Ok(QueryOutcome { results: Vec::new(), fallback: None, cached: false });
    }
    let namespace = query.namespace.as_deref();
    let key = QueryKey { namespace: query.namespace.clone(), text: query.text.clone(), limit };

    if let Some(hit) = self.cache.get(&key) {
      tracing::debug!(namespace, text = %query.text, "query cache hit");
      let mut results = hit.results.clone();
      self.record_usage(&mut results).await?;
      return Ok(QueryOutcome { results, fallback: hit.fallback, cached: true });
    }

    let epoch = self.epochs.lock().current(namespace);
    let fallback = match self.race_semantic(&query.text, namespace, limit).await {
      Ok(hits) if !hits.results.is_empty() => {
        let results = self.with_unindexed(hits, &query.text, namespace, limit).await?;
        return self.finish(key, epoch, results, None).await;
      }
      Ok(_) => FallbackReason::Empty,
      Err(Error::SemanticTimeout(_)) => FallbackReason::Timeout,
      Err(Error::EmbeddingUnavailable(_)) => FallbackReason::Unavailable,
      Err(Error::ShutDown) => return Err(Error::ShutDown),
      Err(e) => {
        tracing::warn!(namespace, error = %e, "semantic search failed");
        FallbackReason::Error
      }
    };

    if fallback == FallbackReason::Timeout || self.backend.model().is_some() {
      tracing::warn!(namespace, reason = %fallback, "falling back to lexical search");
    } else {
      tracing::debug!(namespace, reason = %fallback, "falling back to lexical search");
    }

    let lexical = LexicalQuery {
      text: query.text.clone(),
      namespace: query.namespace.clone(),
      limit,
    };
    let results = self
      .store
      .search_lexical(&lexical)
      .await
      .map_err(Error::storage)?
      .into_iter()
      .map(|p| {
        let score = p.confidence.get();
        QueryResult::new(p, score, MatchedVia::Lexical)
      })
      .collect();

    self.finish(key, epoch, results, Some(fallback)).await
  }

  /// Drop cached results that could include `namespace`: its own queries and
  /// every unscoped one.
  pub fn invalidate_namespace(&self, namespace: &str) -> usize {
    let mut epochs = self.epochs.lock();
    epochs.all += 1;
    *epochs.by_namespace.entry(namespace.to_owned()).or_default() += 1;
    self
      .cache
      .invalidate_where(|k| k.namespace.as_deref().is_none_or(|n| n == namespace))
  }

  pub fn clear_cache(&self) { self.cache.clear(); }

  /// Cache the results if nothing invalidated their scope since `epoch`, then
  /// count the uses.
  async fn finish(
    &self,
    key: QueryKey,
    epoch: u64,
    mut results: Vec<QueryResult>,
    fallback: Option<FallbackReason>,
  ) -> Result<QueryOutcome> {
    {
      let epochs = self.epochs.lock();
      if epochs.current(key.namespace.as_deref()) == epoch {
        self
          .cache
          .insert(key, Arc::new(CachedQuery { results: results.clone(), fallback }));
      } else {
        tracing::debug!(namespace = ?key.namespace, "write landed mid-query; results not cached");
      }
    }
    self.record_usage(&mut results).await?;
    Ok(QueryOutcome { results, fallback, cached: false })
  }

  /// Append lexical hits that semantic search did not consider, typically
  /// patterns whose embedding is still being generated. They are tagged
  /// [`MatchedVia::Lexical`] and keep their place within `limit`.
  async fn with_unindexed(
    &self,
    hits: SemanticHits,
    text: &str,
    namespace: Option<&str>,
    limit: usize,
  ) -> Result<Vec<QueryResult>> {
    let SemanticHits { mut results, indexed } = hits;
    let lexical = LexicalQuery {
      text: text.to_owned(),
      namespace: namespace.map(str::to_owned),
      limit: limit.max(self.settings.scoring.pool),
    };
    let pending: Vec<QueryResult> = self
      .store
      .search_lexical(&lexical)
      .await
      .map_err(Error::storage)?
      .into_iter()
      .filter(|p| !indexed.contains(&p.pattern_id))
      .take(limit)
      .map(|p| {
        let score = p.confidence.get();
        QueryResult::new(p, score, MatchedVia::Lexical)
      })
      .collect();

    if !pending.is_empty() {
      tracing::debug!(namespace, count = pending.len(), "adding lexical hits not yet embedded");
      results.truncate(limit - pending.len());
      results.extend(pending);
    }
    Ok(results)
  }

  /// Touch every returned pattern and reflect the new counts.
  async fn record_usage(&self, results: &mut [QueryResult]) -> Result<()> {
    if !self.settings.touch_on_retrieval {
      return Ok(());
    }
    for result in results.iter_mut() {
      if let Some(p) = self.store.touch(result.id).await.map_err(Error::storage)? {
        result.usage_count = p.usage_count;
      }
    }
    Ok(())
  }

  /// Semantic search against a hard deadline. The loser is dropped and its
  /// token cancelled.
  async fn race_semantic(
    &self,
    text: &str,
    namespace: Option<&str>,
    limit: usize,
  ) -> Result<SemanticHits> {
    let cancel = self.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();
    let timeout = self.settings.timeout;

    tokio::select! {
      result = self.semantic_search(text, namespace, limit, &cancel) => result,
      _ = tokio::time::sleep(timeout) => {
        cancel.cancel();
        Err(Error::SemanticTimeout(timeout))
      }
      _ = self.shutdown.cancelled() => Err(Error::ShutDown),
    }
  }

  async fn semantic_search(
    &self,
    text: &str,
    namespace: Option<&str>,
    limit: usize,
    cancel: &CancellationToken,
  ) -> Result<SemanticHits> {
    let Some(model) = self.backend.model() else {
      return Err(Error::EmbeddingUnavailable("no semantic backend".into()));
    };
    let vector = self.backend.embed(text, cancel).await?;
    let candidates = self
      .store
      .embedded_patterns(namespace, model)
      .await
      .map_err(Error::storage)?;

    let indexed = candidates.iter().map(|c| c.pattern.pattern_id).collect();

    let scored = ranking::score_candidates(&vector, candidates, &self.settings.scoring, Utc::now());
    let diversity = self.settings.scoring.weights.diversity;
    let results = ranking::mmr_select(scored, limit, diversity)
      .into_iter()
      .map(|(p, score)| QueryResult::new(p, score, MatchedVia::Semantic))
      .collect();
    Ok(SemanticHits { results, indexed })
  }
}
