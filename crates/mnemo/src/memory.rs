//! [`PatternMemory`], the facade exposing the pattern-memory operations.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use mnemo_core::{
  embedding::Embedding,
  pattern::{Confidence, NewPattern, Pattern},
  skill::Skill,
  store::{PatternStore, Stats},
  trajectory::{NewTrajectory, Trajectory},
};
use uuid::Uuid;

use crate::{
  Error, Result,
  cache::TtlCache,
  config::MemoryConfig,
  consolidation::{ConsolidateRequest, ConsolidationOptions, ConsolidationReport, Consolidator},
  coordinator::{CoordinatorSettings, Query, QueryCoordinator, QueryOutcome},
  lifecycle::{Lifecycle, ShutdownReport},
  ranking::ScoringParams,
  semantic::{EmbeddingIndex, EmbeddingProvider, NoSemantic, SemanticBackend, SemanticError},
};

/// A namespaced pattern memory over a [`PatternStore`], with optional
/// semantic search through `B`.
///
/// Cloning is cheap; clones share one store, cache and lifecycle.
pub struct PatternMemory<S, B = NoSemantic> {
  inner: Arc<Inner<S, B>>,
}

impl<S, B> Clone for PatternMemory<S, B> {
  fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

struct Inner<S, B> {
  store:            Arc<S>,
  backend:          Arc<B>,
  coordinator:      QueryCoordinator<S, B>,
  consolidator:     Consolidator<S>,
  lifecycle:        Lifecycle,
  config:           MemoryConfig,
  periodic_started: AtomicBool,
}

// ─── Construction ────────────────────────────────────────────────────────────

impl<S: PatternStore> PatternMemory<S, NoSemantic> {
  /// Lexical-only memory: every query is answered by the fallback path.
  pub fn new(store: S, config: MemoryConfig) -> Self {
    let lifecycle = Lifecycle::new(config.lifecycle.grace());
    Self::assemble(store, NoSemantic, config, lifecycle)
  }
}

impl<S: PatternStore, P: EmbeddingProvider> PatternMemory<S, EmbeddingIndex<P>> {
  /// Memory with semantic search through `provider`, cached and budgeted
  /// per the config.
  pub fn with_provider(store: S, provider: P, config: MemoryConfig) -> Self {
    let lifecycle = Lifecycle::new(config.lifecycle.grace());
    let cache = TtlCache::new(
      lifecycle.timers().clone(),
      config.cache.embedding_ttl(),
      config.cache.max_entries,
    );
    let index = EmbeddingIndex::new(provider, config.embedding.timeout(), cache);
    Self::assemble(store, index, config, lifecycle)
  }
}

impl<S: PatternStore, B: SemanticBackend> PatternMemory<S, B> {
  pub fn with_backend(store: S, backend: B, config: MemoryConfig) -> Self {
    let lifecycle = Lifecycle::new(config.lifecycle.grace());
    Self::assemble(store, backend, config, lifecycle)
  }

  fn assemble(store: S, backend: B, config: MemoryConfig, lifecycle: Lifecycle) -> Self {
    let store = Arc::new(store);
    let backend = Arc::new(backend);

    let query_cache =
      TtlCache::new(lifecycle.timers().clone(), config.cache.query_ttl(), config.cache.max_entries);
    let settings = CoordinatorSettings {
      timeout:            config.query.timeout(),
      default_limit:      config.query.default_limit,
      scoring:            ScoringParams {
        weights:        config.query.weights,
        min_similarity: config.query.min_similarity,
        half_life:      chrono::Duration::milliseconds(
          (config.query.recency_half_life_hours * 3_600_000.0) as i64,
        ),
        pool:           config.query.candidate_pool,
      },
      touch_on_retrieval: config.query.touch_on_retrieval,
    };
    let coordinator = QueryCoordinator::new(
      Arc::clone(&store),
      Arc::clone(&backend),
      query_cache,
      settings,
      lifecycle.token(),
    );
    let consolidator = Consolidator::new(Arc::clone(&store), backend.model().map(str::to_owned));

    let memory = Self {
      inner: Arc::new(Inner {
        store,
        backend,
        coordinator,
        consolidator,
        lifecycle,
        config,
        periodic_started: AtomicBool::new(false),
      }),
    };

    if memory.inner.config.consolidation.enabled
      && tokio::runtime::Handle::try_current().is_ok()
      && let Err(e) = memory.spawn_consolidation()
    {
      tracing::warn!(error = %e, "periodic consolidation not started");
    }
    memory
  }

  pub fn config(&self) -> &MemoryConfig { &self.inner.config }

  pub fn pattern_store(&self) -> &S { &self.inner.store }

  /// Cache timers that have neither fired nor been cancelled.
  pub fn pending_timers(&self) -> usize { self.inner.lifecycle.timers().outstanding() }
}

// ─── Operations ──────────────────────────────────────────────────────────────

impl<S: PatternStore, B: SemanticBackend> PatternMemory<S, B> {
  /// Durably store a pattern and return its id. Confidence defaults to 0.5.
  ///
  /// When a semantic backend is present the embedding is generated in the
  /// background; the pattern is lexically searchable immediately.
  pub async fn store(
    &self,
    namespace: impl Into<String>,
    key: impl Into<String>,
    value: impl Into<String>,
    confidence: Option<f64>,
  ) -> Result<Uuid> {
    self.inner.lifecycle.ensure_running()?;
    let confidence = confidence.unwrap_or_else(|| Confidence::default().get());
    let input = NewPattern::new(namespace, key, value, confidence)?;

    let pattern = self.inner.store.insert_pattern(input).await.map_err(Error::storage)?;
    self.inner.coordinator.invalidate_namespace(&pattern.namespace);
    tracing::debug!(namespace = %pattern.namespace, id = %pattern.pattern_id, "pattern stored");

    let id = pattern.pattern_id;
    self.populate_embedding(pattern);
    Ok(id)
  }

  pub async fn get(&self, id: Uuid) -> Result<Option<Pattern>> {
    self.inner.lifecycle.ensure_running()?;
    self.inner.store.get_pattern(id).await.map_err(Error::storage)
  }

  /// Record one use of a pattern.
  pub async fn touch(&self, id: Uuid) -> Result<Pattern> {
    self.inner.lifecycle.ensure_running()?;
    self
      .inner
      .store
      .touch(id)
      .await
      .map_err(Error::storage)?
      .ok_or(Error::NotFound(id))
  }

  /// Delete a pattern, its embedding, and its skill memberships.
  pub async fn delete(&self, id: Uuid) -> Result<()> {
    self.inner.lifecycle.ensure_running()?;
    let pattern = self.get(id).await?.ok_or(Error::NotFound(id))?;
    if !self.inner.store.delete_pattern(id).await.map_err(Error::storage)? {
      return Err(Error::NotFound(id));
    }
    self.inner.coordinator.invalidate_namespace(&pattern.namespace);
    Ok(())
  }

  pub async fn query(&self, query: &Query) -> Result<QueryOutcome> {
    self.inner.lifecycle.ensure_running()?;
    self.inner.coordinator.query(query).await
  }

  /// Patterns in canonical order.
  pub async fn list(&self, namespace: Option<&str>, limit: Option<usize>) -> Result<Vec<Pattern>> {
    self.inner.lifecycle.ensure_running()?;
    self
      .inner
      .store
      .list_patterns(namespace, limit)
      .await
      .map_err(Error::storage)
  }

  pub async fn stats(&self, namespace: Option<&str>) -> Result<Stats> {
    self.inner.lifecycle.ensure_running()?;
    self.inner.store.stats(namespace).await.map_err(Error::storage)
  }

  /// Record whether a pattern worked for `task`. Counts as a use.
  pub async fn record_outcome(
    &self,
    id: Uuid,
    task: impl Into<String>,
    success: bool,
  ) -> Result<Trajectory> {
    self.inner.lifecycle.ensure_running()?;
    let input = NewTrajectory { pattern_id: id, task: task.into(), success };
    let trajectory = self
      .inner
      .store
      .record_trajectory(input)
      .await
      .map_err(Error::storage)?
      .ok_or(Error::NotFound(id))?;
    self.inner.coordinator.invalidate_namespace(&trajectory.namespace);
    Ok(trajectory)
  }

  /// Consolidate every namespace.
  pub async fn consolidate(&self, request: ConsolidateRequest) -> Result<ConsolidationReport> {
    self.inner.lifecycle.ensure_running()?;
    let opts = request.resolve(self.inner.options())?;
    self.inner.consolidate_all(&opts).await
  }

  pub async fn consolidate_namespace(
    &self,
    namespace: &str,
    request: ConsolidateRequest,
  ) -> Result<ConsolidationReport> {
    self.inner.lifecycle.ensure_running()?;
    let opts = request.resolve(self.inner.options())?;
    self.inner.consolidate_one(namespace, &opts).await
  }

  pub async fn list_skills(&self, namespace: Option<&str>) -> Result<Vec<Skill>> {
    self.inner.lifecycle.ensure_running()?;
    self.inner.store.list_skills(namespace).await.map_err(Error::storage)
  }

  pub async fn namespaces(&self) -> Result<Vec<String>> {
    self.inner.lifecycle.ensure_running()?;
    self.inner.store.namespaces().await.map_err(Error::storage)
  }

  /// Wait for background embedding writes to land.
  pub async fn flush(&self) -> Result<()> {
    self.inner.lifecycle.ensure_running()?;
    self.inner.lifecycle.flush().await;
    Ok(())
  }

  /// Cancel timers and workers, settle writes, and close the store, all
  /// within the configured grace period.
  pub async fn shutdown(&self) -> Result<ShutdownReport> {
    let report = self.inner.lifecycle.shutdown(self.inner.store.as_ref()).await?;
    self.inner.coordinator.clear_cache();
    Ok(report)
  }

  /// Start the periodic consolidation task. Returns `false` if it is already
  /// running.
  pub fn spawn_consolidation(&self) -> Result<bool> {
    self.inner.lifecycle.ensure_running()?;
    let period = self.inner.config.consolidation.interval();
    if period.is_zero() {
      return Err(Error::InvalidConfig("consolidation.interval_secs must be > 0".into()));
    }
    if self.inner.periodic_started.swap(true, Ordering::AcqRel) {
      return Ok(false);
    }

    let inner = Arc::clone(&self.inner);
    let token = self.inner.lifecycle.token();
    let spawned = self.inner.lifecycle.spawn_worker(async move {
      tracing::info!(?period, "periodic consolidation started");
      let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = tick.tick() => {
            let opts = inner.options();
            match inner.consolidate_all(&opts).await {
              Ok(report) => tracing::debug!(?report, "periodic consolidation cycle"),
              Err(e) => tracing::warn!(error = %e, "periodic consolidation failed"),
            }
          }
        }
      }
      tracing::info!("periodic consolidation stopped");
    });
    Ok(spawned)
  }

  /// Embed `pattern` in the background and attach the vector.
  fn populate_embedding(&self, pattern: Pattern) {
    let Some(model) = self.inner.backend.model().map(str::to_owned) else {
      return;
    };
    let store = Arc::clone(&self.inner.store);
    let backend = Arc::clone(&self.inner.backend);
    let cancel = self.inner.lifecycle.write_token();

    self.inner.lifecycle.spawn_write(async move {
      let text = pattern.embedding_text();
      let vector = match backend.embed(&text, &cancel).await {
        Ok(vector) => vector,
        Err(SemanticError::Cancelled) => return,
        Err(e) => {
          tracing::warn!(id = %pattern.pattern_id, error = %e, "embedding population failed");
          return;
        }
      };
      let dims = vector.len();
      let embedding = match Embedding::new(pattern.pattern_id, model, dims, vector) {
        Ok(embedding) => embedding,
        Err(e) => {
          tracing::warn!(id = %pattern.pattern_id, error = %e, "embedding rejected");
          return;
        }
      };
      match store.put_embedding(embedding).await {
        Ok(true) => tracing::debug!(id = %pattern.pattern_id, "embedding stored"),
        Ok(false) => tracing::debug!(id = %pattern.pattern_id, "pattern gone before embedding"),
        Err(e) => tracing::warn!(id = %pattern.pattern_id, error = %e, "embedding write failed"),
      }
    });
  }
}

impl<S: PatternStore, B: SemanticBackend> Inner<S, B> {
  fn options(&self) -> ConsolidationOptions { ConsolidationOptions::from(&self.config.consolidation) }

  async fn consolidate_one(
    &self,
    namespace: &str,
    opts: &ConsolidationOptions,
  ) -> Result<ConsolidationReport> {
    let report = self.consolidator.run(namespace, opts).await?;
    if !report.is_empty() {
      self.coordinator.invalidate_namespace(namespace);
    }
    Ok(report)
  }

  async fn consolidate_all(&self, opts: &ConsolidationOptions) -> Result<ConsolidationReport> {
    let mut total = ConsolidationReport::default();
    for namespace in self.store.namespaces().await.map_err(Error::storage)? {
      total.absorb(self.consolidate_one(&namespace, opts).await?);
    }
    Ok(total)
  }
}

impl<S, B> Drop for Inner<S, B> {
  fn drop(&mut self) {
    // Nothing may keep the runtime busy once the last handle is gone.
    self.lifecycle.timers().cancel_all();
  }
}
