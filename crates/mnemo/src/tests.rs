//! End-to-end tests for `PatternMemory` over an in-memory SQLite store.

use std::{
  collections::BTreeSet,
  time::{Duration, Instant},
};

use mnemo_core::store::{LexicalQuery, PatternStore};
use mnemo_store_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
  ConsolidateRequest, EmbeddingProvider, Error, FallbackReason, MatchedVia, MemoryConfig,
  PatternMemory, ProviderError, Query, semantic::EmbeddingIndex,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn config() -> MemoryConfig {
  let mut cfg = MemoryConfig::default();
  cfg.query.timeout_ms = 500;
  cfg
}

async fn sqlite() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

async fn lexical_memory() -> PatternMemory<SqliteStore> {
  init_tracing();
  PatternMemory::new(sqlite().await, config())
}

async fn semantic_memory<P: EmbeddingProvider>(
  provider: P,
  cfg: MemoryConfig,
) -> PatternMemory<SqliteStore, EmbeddingIndex<P>> {
  init_tracing();
  PatternMemory::with_provider(sqlite().await, provider, cfg)
}

const VOCAB: [&str; 8] =
  ["deploy", "rollback", "pathfinding", "planner", "cache", "timeout", "database", "search"];

/// One axis per vocabulary word; everything else is ignored.
struct Vocabulary;

impl EmbeddingProvider for Vocabulary {
  fn model(&self) -> &str { "vocab-8" }

  fn dims(&self) -> usize { VOCAB.len() }

  async fn embed<'a>(&'a self, text: &'a str, _timeout: Duration) -> Result<Vec<f32>, ProviderError> {
    let mut v = vec![0.0; VOCAB.len()];
    for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
      if let Some(i) = VOCAB.iter().position(|w| *w == word) {
        v[i] += 1.0;
      }
    }
    Ok(v)
  }
}

/// Never answers within any reasonable budget.
struct Stalled;

impl EmbeddingProvider for Stalled {
  fn model(&self) -> &str { "stalled" }

  fn dims(&self) -> usize { 4 }

  async fn embed<'a>(&'a self, _text: &'a str, _timeout: Duration) -> Result<Vec<f32>, ProviderError> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok(vec![1.0; 4])
  }
}

/// [`Vocabulary`], except texts mentioning "backlog" never finish embedding.
struct Backlogged;

impl EmbeddingProvider for Backlogged {
  fn model(&self) -> &str { "vocab-8" }

  fn dims(&self) -> usize { VOCAB.len() }

  async fn embed<'a>(&'a self, text: &'a str, timeout: Duration) -> Result<Vec<f32>, ProviderError> {
    if text.contains("backlog") {
      tokio::time::sleep(Duration::from_secs(30)).await;
    }
    Vocabulary.embed(text, timeout).await
  }
}

struct Broken;

impl EmbeddingProvider for Broken {
  fn model(&self) -> &str { "broken" }

  fn dims(&self) -> usize { 4 }

  async fn embed<'a>(&'a self, _text: &'a str, _timeout: Duration) -> Result<Vec<f32>, ProviderError> {
    Err(ProviderError::Unavailable("connection refused".into()))
  }
}

fn ids(outcome: &crate::QueryOutcome) -> Vec<Uuid> { outcome.results.iter().map(|r| r.id).collect() }

// ─── Store / get / touch / delete ────────────────────────────────────────────

#[tokio::test]
async fn lexical_query_finds_stored_pattern_without_provider() {
  let m = lexical_memory().await;
  let id = m
    .store(
      "test",
      "goap_planner",
      "A* pathfinding algorithm for optimal action sequences",
      Some(0.8),
    )
    .await
    .unwrap();

  let outcome = m
    .query(&Query::new("pathfinding").in_namespace("test"))
    .await
    .unwrap();

  assert_eq!(outcome.results.len(), 1);
  let hit = &outcome.results[0];
  assert_eq!(hit.id, id);
  assert_eq!(hit.key, "goap_planner");
  assert_eq!(hit.matched_via, MatchedVia::Lexical);
  assert_eq!(hit.confidence, 0.8);
  assert_eq!(hit.usage_count, 1);
  assert_eq!(outcome.fallback, Some(FallbackReason::Unavailable));
  assert!(!outcome.cached);
}

#[tokio::test]
async fn out_of_range_confidence_is_rejected_before_writing() {
  let m = lexical_memory().await;

  let err = m.store("ns1", "k", "v", Some(1.5)).await.unwrap_err();
  assert!(matches!(err, Error::InvalidConfidence(v) if v == 1.5));
  assert!(matches!(m.store("ns1", "k", "v", Some(-0.1)).await, Err(Error::InvalidConfidence(_))));
  assert!(matches!(m.store("ns1", "k", "v", Some(f64::NAN)).await, Err(Error::InvalidConfidence(_))));

  assert!(m.list(Some("ns1"), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn default_confidence_is_one_half() {
  let m = lexical_memory().await;
  let id = m.store("ns", "k", "v", None).await.unwrap();
  assert_eq!(m.get(id).await.unwrap().unwrap().confidence.get(), 0.5);
}

#[tokio::test]
async fn concurrent_touches_are_not_lost() {
  let m = lexical_memory().await;
  let id = m.store("ns", "k", "v", Some(0.5)).await.unwrap();

  let (a, b) = tokio::join!(m.touch(id), m.touch(id));
  a.unwrap();
  b.unwrap();

  assert_eq!(m.get(id).await.unwrap().unwrap().usage_count, 2);
}

#[tokio::test]
async fn missing_ids_are_not_found() {
  let m = lexical_memory().await;
  let missing = Uuid::new_v4();

  assert!(m.get(missing).await.unwrap().is_none());
  assert!(matches!(m.touch(missing).await, Err(Error::NotFound(id)) if id == missing));
  assert!(matches!(m.delete(missing).await, Err(Error::NotFound(_))));
  assert!(matches!(m.record_outcome(missing, "task", true).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn delete_removes_pattern_and_cached_results() {
  let m = lexical_memory().await;
  let id = m.store("ns", "deploy", "blue green", Some(0.7)).await.unwrap();

  let q = Query::new("deploy").in_namespace("ns");
  assert_eq!(m.query(&q).await.unwrap().results.len(), 1);

  m.delete(id).await.unwrap();
  assert!(m.get(id).await.unwrap().is_none());

  let after = m.query(&q).await.unwrap();
  assert!(after.results.is_empty());
  assert!(!after.cached);
}

// ─── Query path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn list_uses_canonical_order() {
  let m = lexical_memory().await;
  let low = m.store("ns", "low", "v", Some(0.2)).await.unwrap();
  let high = m.store("ns", "high", "v", Some(0.9)).await.unwrap();
  let mid = m.store("ns", "mid", "v", Some(0.5)).await.unwrap();
  let mid_used = m.store("ns", "mid-used", "v", Some(0.5)).await.unwrap();
  m.touch(mid_used).await.unwrap();
  m.store("other", "elsewhere", "v", Some(1.0)).await.unwrap();

  let listed: Vec<Uuid> = m
    .list(Some("ns"), None)
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.pattern_id)
    .collect();
  assert_eq!(listed, vec![high, mid_used, mid, low]);

  assert_eq!(m.list(Some("ns"), Some(2)).await.unwrap().len(), 2);
  assert_eq!(m.list(None, None).await.unwrap().len(), 5);
}

#[tokio::test]
async fn namespaces_are_isolated() {
  let m = lexical_memory().await;
  m.store("a", "k", "shared text", Some(0.5)).await.unwrap();
  m.store("b", "k", "shared text", Some(0.5)).await.unwrap();

  let scoped = m.query(&Query::new("shared").in_namespace("a")).await.unwrap();
  assert_eq!(scoped.results.len(), 1);
  assert_eq!(scoped.results[0].namespace, "a");

  let unscoped = m.query(&Query::new("shared")).await.unwrap();
  assert_eq!(unscoped.results.len(), 2);

  assert_eq!(m.namespaces().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn repeated_query_is_served_from_cache_and_still_counts_usage() {
  let m = lexical_memory().await;
  let id = m.store("ns", "k", "cached value", Some(0.5)).await.unwrap();
  let q = Query::new("cached").in_namespace("ns");

  let first = m.query(&q).await.unwrap();
  let second = m.query(&q).await.unwrap();

  assert!(!first.cached);
  assert!(second.cached);
  assert_eq!(ids(&first), ids(&second));
  assert_eq!(second.fallback, first.fallback);
  assert_eq!(m.get(id).await.unwrap().unwrap().usage_count, 2);
}

#[tokio::test]
async fn store_then_query_sees_new_pattern_despite_cache() {
  let m = lexical_memory().await;
  m.store("ns", "first", "needle one", Some(0.5)).await.unwrap();
  let q = Query::new("needle").in_namespace("ns");
  assert_eq!(m.query(&q).await.unwrap().results.len(), 1);

  let new = m.store("ns", "second", "needle two", Some(0.9)).await.unwrap();
  let outcome = m.query(&q).await.unwrap();
  assert!(!outcome.cached);
  assert_eq!(outcome.results.len(), 2);
  assert_eq!(outcome.results[0].id, new);
}

#[tokio::test]
async fn limit_caps_results_and_zero_returns_nothing() {
  let m = lexical_memory().await;
  for i in 0..15 {
    m.store("ns", format!("k{i}"), "common", Some(0.5)).await.unwrap();
  }

  let default = m.query(&Query::new("common").in_namespace("ns")).await.unwrap();
  assert_eq!(default.results.len(), 10);

  let three = m.query(&Query::new("common").in_namespace("ns").with_limit(3)).await.unwrap();
  assert_eq!(three.results.len(), 3);

  let none = m.query(&Query::new("common").with_limit(0)).await.unwrap();
  assert!(none.results.is_empty());
}

#[tokio::test]
async fn semantic_timeout_falls_back_to_exact_lexical_results() {
  let mut cfg = config();
  cfg.query.timeout_ms = 100;
  let m = semantic_memory(Stalled, cfg).await;

  m.store("ns1", "q-first", "alpha", Some(0.9)).await.unwrap();
  m.store("ns1", "second", "contains Q too", Some(0.4)).await.unwrap();
  m.store("ns1", "third", "nothing here", Some(1.0)).await.unwrap();
  m.store("ns2", "q-elsewhere", "beta", Some(1.0)).await.unwrap();

  let expected: Vec<Uuid> = m
    .pattern_store()
    .search_lexical(&LexicalQuery::new("q").in_namespace("ns1"))
    .await
    .unwrap()
    .into_iter()
    .map(|p| p.pattern_id)
    .collect();
  assert_eq!(expected.len(), 2);

  let start = Instant::now();
  let outcome = m.query(&Query::new("q").in_namespace("ns1")).await.unwrap();
  assert!(start.elapsed() < Duration::from_secs(2));

  assert_eq!(outcome.fallback, Some(FallbackReason::Timeout));
  assert_eq!(ids(&outcome), expected);
  assert!(outcome.results.iter().all(|r| r.matched_via == MatchedVia::Lexical));
}

#[tokio::test]
async fn failing_provider_falls_back_to_lexical() {
  let m = semantic_memory(Broken, config()).await;
  m.store("ns", "planner", "pathfinding", Some(0.6)).await.unwrap();
  m.flush().await.unwrap();

  let outcome = m.query(&Query::new("pathfinding").in_namespace("ns")).await.unwrap();
  assert_eq!(outcome.fallback, Some(FallbackReason::Unavailable));
  assert_eq!(outcome.results.len(), 1);
  assert_eq!(outcome.results[0].matched_via, MatchedVia::Lexical);
  assert_eq!(m.stats(Some("ns")).await.unwrap().embedding_count, 0);
}

#[tokio::test]
async fn semantic_search_answers_once_embeddings_exist() {
  let m = semantic_memory(Vocabulary, config()).await;
  let planner = m
    .store("ns", "planner", "pathfinding for agents", Some(0.6))
    .await
    .unwrap();
  m.store("ns", "cache", "eviction notes", Some(0.9)).await.unwrap();
  m.flush().await.unwrap();

  let stats = m.stats(Some("ns")).await.unwrap();
  assert_eq!(stats.embedding_count, 2);
  assert!(m.get(planner).await.unwrap().unwrap().embedding_ref.is_some());

  let outcome = m.query(&Query::new("pathfinding").in_namespace("ns")).await.unwrap();
  assert_eq!(outcome.fallback, None);
  assert_eq!(outcome.results[0].id, planner);
  assert!(outcome.results.iter().all(|r| r.matched_via == MatchedVia::Semantic));
  assert!(outcome.results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn query_outside_the_model_vocabulary_falls_back() {
  let m = semantic_memory(Vocabulary, config()).await;
  let goap = m
    .store("ns", "goap_planner", "pathfinding for agents", Some(0.6))
    .await
    .unwrap();
  m.store("ns", "other", "cache eviction", Some(0.9)).await.unwrap();
  m.flush().await.unwrap();

  let outcome = m.query(&Query::new("goap").in_namespace("ns")).await.unwrap();
  assert_eq!(outcome.fallback, Some(FallbackReason::Empty));
  assert_eq!(ids(&outcome), vec![goap]);
  assert_eq!(outcome.results[0].matched_via, MatchedVia::Lexical);
}

#[tokio::test]
async fn stored_pattern_is_found_before_its_embedding_lands() {
  let m = semantic_memory(Backlogged, config()).await;
  let other = m.store("ns", "other", "planner notes", Some(0.5)).await.unwrap();
  m.flush().await.unwrap();

  let new = m
    .store("ns", "goap_planner", "backlog of actions", Some(0.8))
    .await
    .unwrap();
  let outcome = m.query(&Query::new("goap_planner").in_namespace("ns")).await.unwrap();

  assert_eq!(outcome.fallback, None);
  let via: Vec<_> = outcome.results.iter().map(|r| (r.id, r.matched_via)).collect();
  assert_eq!(via, vec![(other, MatchedVia::Semantic), (new, MatchedVia::Lexical)]);
}

#[tokio::test]
async fn empty_semantic_result_falls_back() {
  let mut cfg = config();
  cfg.query.min_similarity = 0.9;
  let m = semantic_memory(Vocabulary, cfg).await;
  m.store("ns", "planner", "pathfinding with rollback", Some(0.6))
    .await
    .unwrap();
  m.flush().await.unwrap();

  let outcome = m.query(&Query::new("rollback").in_namespace("ns")).await.unwrap();
  assert_eq!(outcome.fallback, Some(FallbackReason::Empty));
  assert_eq!(outcome.results.len(), 1);
  assert_eq!(outcome.results[0].matched_via, MatchedVia::Lexical);
}

// ─── Consolidation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn consolidation_promotes_frequently_used_group() {
  let m = lexical_memory().await;

  let mut group = BTreeSet::new();
  for (key, confidence) in [("blue_green", 0.8), ("canary", 0.85), ("rolling_update", 0.9)] {
    let id = m.store("ops", key, "deploy the service", Some(confidence)).await.unwrap();
    for _ in 0..3 {
      m.touch(id).await.unwrap();
    }
    group.insert(id);
  }
  m.store("ops", "unused", "one", Some(0.5)).await.unwrap();
  m.store("ops", "also_unused", "two", Some(0.5)).await.unwrap();

  let first = m.consolidate(ConsolidateRequest::default()).await.unwrap();
  assert_eq!(first.skills_created, 1);
  assert_eq!(first.patterns_pruned, 0);

  let skills = m.list_skills(Some("ops")).await.unwrap();
  assert_eq!(skills.len(), 1);
  // named after the most confident member
  assert_eq!(skills[0].name, "rolling_update");
  assert_eq!(skills[0].source_pattern_ids, group);
  assert!((0.0..=1.0).contains(&skills[0].avg_reward));
  assert_eq!(skills[0].usage_count, 9);

  let second = m.consolidate(ConsolidateRequest::default()).await.unwrap();
  assert_eq!(second.skills_created, 0);
  assert_eq!(second.skills_updated, 0);
  assert_eq!(second.patterns_pruned, 0);

  assert_eq!(m.stats(Some("ops")).await.unwrap().skill_count, 1);
}

#[tokio::test]
async fn consolidation_clusters_by_embedding_and_revises_confidence() {
  let m = semantic_memory(Vocabulary, config()).await;

  let mut group = BTreeSet::new();
  for key in ["alpha", "beta", "gamma"] {
    let id = m.store("ops", key, "deploy the service", Some(0.8)).await.unwrap();
    group.insert(id);
  }
  m.flush().await.unwrap();
  for &id in &group {
    for task in ["t1", "t2", "t3"] {
      m.record_outcome(id, task, true).await.unwrap();
    }
  }

  let first = m.consolidate(ConsolidateRequest::default()).await.unwrap();
  assert_eq!(first.skills_created, 1);
  assert_eq!(first.confidence_revised, 3);
  for &id in &group {
    assert_eq!(m.get(id).await.unwrap().unwrap().confidence.get(), 1.0);
  }
  let skills = m.list_skills(Some("ops")).await.unwrap();
  assert_eq!(skills[0].source_pattern_ids, group);

  let second = m.consolidate(ConsolidateRequest::default()).await.unwrap();
  assert_eq!(second, crate::ConsolidationReport::default());
}

#[tokio::test]
async fn unsuccessful_group_creates_no_skill() {
  let m = lexical_memory().await;
  let id = m.store("ops", "flaky", "sometimes works", Some(0.9)).await.unwrap();
  for success in [false, false, true] {
    m.record_outcome(id, "task", success).await.unwrap();
  }

  let report = m.consolidate(ConsolidateRequest::default()).await.unwrap();
  assert_eq!(report.skills_created, 0);
  assert_eq!(report.confidence_revised, 1);

  let revised = m.get(id).await.unwrap().unwrap().confidence.get();
  assert!((revised - 1.0 / 3.0).abs() < 1e-9);
  assert!(m.list_skills(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn consolidation_request_overrides_thresholds() {
  let m = lexical_memory().await;
  let id = m.store("ops", "rare", "used once", Some(0.9)).await.unwrap();
  m.touch(id).await.unwrap();

  let strict = m.consolidate(ConsolidateRequest::default()).await.unwrap();
  assert_eq!(strict.skills_created, 0);

  let relaxed = ConsolidateRequest { min_uses: Some(1), ..Default::default() };
  assert_eq!(m.consolidate(relaxed).await.unwrap().skills_created, 1);

  let invalid = ConsolidateRequest { min_success_rate: Some(2.0), ..Default::default() };
  assert!(matches!(m.consolidate(invalid).await, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn periodic_consolidation_runs_on_its_interval() {
  init_tracing();
  let mut cfg = config();
  cfg.consolidation.enabled = true;
  cfg.consolidation.interval_secs = 1;
  let m = PatternMemory::new(sqlite().await, cfg);

  let id = m.store("ops", "deploy", "blue green", Some(0.9)).await.unwrap();
  for _ in 0..3 {
    m.touch(id).await.unwrap();
  }
  assert!(!m.spawn_consolidation().unwrap());

  tokio::time::sleep(Duration::from_millis(1500)).await;
  assert_eq!(m.list_skills(Some("ops")).await.unwrap().len(), 1);

  let report = m.shutdown().await.unwrap();
  assert!(report.elapsed < Duration::from_millis(500));
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_is_bounded_with_many_pending_timers() {
  let m = lexical_memory().await;
  m.store("ns", "k", "v", Some(0.5)).await.unwrap();
  for i in 0..500 {
    m.query(&Query::new(format!("miss-{i}")).in_namespace("ns")).await.unwrap();
  }
  assert_eq!(m.pending_timers(), 500);

  let report = m.shutdown().await.unwrap();
  assert_eq!(report.timers_cancelled, 500);
  assert_eq!(report.tasks_abandoned, 0);
  assert!(report.elapsed <= Duration::from_millis(300));
  assert_eq!(m.pending_timers(), 0);

  assert!(matches!(m.store("ns", "k", "v", None).await, Err(Error::ShutDown)));
  assert!(matches!(m.query(&Query::new("k")).await, Err(Error::ShutDown)));
  assert!(matches!(m.shutdown().await, Err(Error::ShutDown)));
}

#[tokio::test]
async fn shutdown_abandons_slow_embedding_writes_within_grace() {
  let mut cfg = config();
  cfg.embedding.timeout_ms = 10_000;
  let m = semantic_memory(Stalled, cfg).await;
  m.store("ns", "k", "v", Some(0.5)).await.unwrap();

  let start = Instant::now();
  let report = m.shutdown().await.unwrap();
  assert_eq!(report.tasks_abandoned, 1);
  assert!(start.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn record_outcome_counts_as_use() {
  let m = lexical_memory().await;
  let id = m.store("ns", "k", "v", Some(0.5)).await.unwrap();

  let t = m.record_outcome(id, "ship release", true).await.unwrap();
  assert_eq!(t.pattern_id, id);
  assert_eq!(t.namespace, "ns");
  assert!(t.success);
  assert_eq!(m.get(id).await.unwrap().unwrap().usage_count, 1);
}

#[test]
fn query_result_serialises_with_external_field_names() {
  let result = crate::QueryResult {
    id:          Uuid::nil(),
    namespace:   "ns".into(),
    key:         "k".into(),
    value:       "v".into(),
    confidence:  0.5,
    usage_count: 2,
    score:       0.5,
    matched_via: MatchedVia::Lexical,
  };
  let json = serde_json::to_value(&result).unwrap();
  assert_eq!(json["matchedVia"], "lexical");
  assert_eq!(json["usageCount"], 2);
}
