//! The `PatternStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g. `mnemo-store-sqlite`).
//! The engine depends on this abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  embedding::{EmbeddedPattern, Embedding},
  pattern::{Confidence, NewPattern, Pattern},
  skill::{Skill, SkillDraft, UpsertOutcome},
  trajectory::{NewTrajectory, Trajectory},
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// Parameters for [`PatternStore::search_lexical`].
#[derive(Debug, Clone)]
pub struct LexicalQuery {
  /// Matched as a case-insensitive substring of `key` or `value`. No
  /// wildcards, stemming or fuzziness.
  pub text:      String,
  pub namespace: Option<String>,
  pub limit:     usize,
}

impl LexicalQuery {
  pub const DEFAULT_LIMIT: usize = 10;

  pub fn new(text: impl Into<String>) -> Self {
    Self { text: text.into(), namespace: None, limit: Self::DEFAULT_LIMIT }
  }

  pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = Some(namespace.into());
    self
  }

  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = limit;
    self
  }
}

/// Aggregate counts returned by [`PatternStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
  pub count:           u64,
  /// Zero when `count` is zero.
  pub avg_confidence:  f64,
  pub embedding_count: u64,
  pub skill_count:     u64,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a durable pattern store backend.
///
/// Writes are acknowledged only after they are committed. Every method
/// returns a `Send` future so the store can be shared across tokio tasks.
pub trait PatternStore: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Patterns ──────────────────────────────────────────────────────────

  /// Persist a new pattern. Id and timestamps are assigned by the store.
  fn insert_pattern(
    &self,
    input: NewPattern,
  ) -> impl Future<Output = Result<Pattern, Self::Error>> + Send + '_;

  /// Retrieve a pattern by id. Returns `None` if not found.
  fn get_pattern(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Pattern>, Self::Error>> + Send + '_;

  /// Atomically increment `usage_count` and bump `updated_at`.
  ///
  /// Concurrent calls on the same id never lose an increment. Returns `None`
  /// if the pattern does not exist.
  fn touch(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Pattern>, Self::Error>> + Send + '_;

  /// Patterns in canonical order, optionally restricted to one namespace.
  fn list_patterns<'a>(
    &'a self,
    namespace: Option<&'a str>,
    limit: Option<usize>,
  ) -> impl Future<Output = Result<Vec<Pattern>, Self::Error>> + Send + 'a;

  /// Exact case-insensitive substring search in canonical order.
  fn search_lexical<'a>(
    &'a self,
    query: &'a LexicalQuery,
  ) -> impl Future<Output = Result<Vec<Pattern>, Self::Error>> + Send + 'a;

  /// Remove a pattern and its embedding, and drop it from every skill.
  /// Skills left without sources are deleted. Returns `false` if the
  /// pattern did not exist.
  fn delete_pattern(&self, id: Uuid) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Returns `None` if the pattern does not exist.
  fn set_confidence(
    &self,
    id: Uuid,
    confidence: Confidence,
  ) -> impl Future<Output = Result<Option<Pattern>, Self::Error>> + Send + '_;

  // ── Embeddings ────────────────────────────────────────────────────────

  /// Attach (or replace) the embedding for `embedding.pattern_id`. Returns
  /// `false` if the pattern no longer exists.
  ///
  /// Fails if another row produced by the same model has different `dims`.
  fn put_embedding(
    &self,
    embedding: Embedding,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn get_embedding(
    &self,
    pattern_id: Uuid,
  ) -> impl Future<Output = Result<Option<Embedding>, Self::Error>> + Send + '_;

  /// All patterns that have an embedding produced by `model`.
  fn embedded_patterns<'a>(
    &'a self,
    namespace: Option<&'a str>,
    model: &'a str,
  ) -> impl Future<Output = Result<Vec<EmbeddedPattern>, Self::Error>> + Send + 'a;

  // ── Trajectories ──────────────────────────────────────────────────────

  /// Append an outcome row and touch the pattern in one transaction.
  /// Returns `None` if the pattern does not exist.
  fn record_trajectory(
    &self,
    input: NewTrajectory,
  ) -> impl Future<Output = Result<Option<Trajectory>, Self::Error>> + Send + '_;

  fn trajectories_since<'a>(
    &'a self,
    namespace: &'a str,
    since: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Trajectory>, Self::Error>> + Send + 'a;

  // ── Skills ────────────────────────────────────────────────────────────

  /// Insert or update the skill identified by `(draft.namespace, draft.name)`.
  fn upsert_skill(
    &self,
    draft: SkillDraft,
  ) -> impl Future<Output = Result<(Skill, UpsertOutcome), Self::Error>> + Send + '_;

  fn list_skills<'a>(
    &'a self,
    namespace: Option<&'a str>,
  ) -> impl Future<Output = Result<Vec<Skill>, Self::Error>> + Send + 'a;

  // ── Housekeeping ──────────────────────────────────────────────────────

  /// Every namespace that holds at least one pattern, sorted.
  fn namespaces(&self) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + '_;

  fn stats<'a>(
    &'a self,
    namespace: Option<&'a str>,
  ) -> impl Future<Output = Result<Stats, Self::Error>> + Send + 'a;

  /// Release the underlying handle. Later calls fail.
  fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
