//! Runtime configuration, deserialised from an optional TOML file and
//! `MNEMO_*` environment variables.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Nested keys use `__` in the environment: `MNEMO_QUERY__TIMEOUT_MS=500`.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;

use crate::{Error, Result, ranking::RankingWeights};

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
  /// SQLite file; a leading `~/` is expanded.
  pub store_path:    PathBuf,
  pub query:         QueryConfig,
  pub cache:         CacheConfig,
  pub embedding:     EmbeddingConfig,
  pub consolidation: ConsolidationConfig,
  pub lifecycle:     LifecycleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// Hard deadline for the semantic branch.
  pub timeout_ms:              u64,
  pub default_limit:           usize,
  /// Candidates kept (by relevance) before MMR re-ranking.
  pub candidate_pool:          usize,
  /// Raw cosine floor in `(0, 1]`; candidates below it are not semantic
  /// matches.
  pub min_similarity:          f64,
  pub recency_half_life_hours: f64,
  /// Count every returned pattern as used.
  pub touch_on_retrieval:      bool,
  pub weights:                 RankingWeights,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub query_ttl_secs:     u64,
  pub embedding_ttl_secs: u64,
  /// Per cache.
  pub max_entries:        usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  /// Budget handed to the provider on every call.
  pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
  pub min_uses:               u64,
  pub min_success_rate:       f64,
  pub lookback_days:          i64,
  pub prune_confidence_floor: f64,
  pub cluster_similarity:     f64,
  pub interval_secs:          u64,
  /// Run the periodic task. Explicit consolidation works either way.
  pub enabled:                bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  pub shutdown_grace_ms: u64,
}

// ─── Defaults ────────────────────────────────────────────────────────────────

impl Default for MemoryConfig {
  fn default() -> Self {
    Self {
      store_path:    PathBuf::from("mnemo.db"),
      query:         QueryConfig::default(),
      cache:         CacheConfig::default(),
      embedding:     EmbeddingConfig::default(),
      consolidation: ConsolidationConfig::default(),
      lifecycle:     LifecycleConfig::default(),
    }
  }
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      timeout_ms:              3000,
      default_limit:           10,
      candidate_pool:          50,
      min_similarity:          0.1,
      recency_half_life_hours: 168.0,
      touch_on_retrieval:      true,
      weights:                 RankingWeights::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { query_ttl_secs: 60, embedding_ttl_secs: 3600, max_entries: 1024 }
  }
}

impl Default for EmbeddingConfig {
  fn default() -> Self { Self { timeout_ms: 2000 } }
}

impl Default for ConsolidationConfig {
  fn default() -> Self {
    Self {
      min_uses:               3,
      min_success_rate:       0.7,
      lookback_days:          7,
      prune_confidence_floor: 0.3,
      cluster_similarity:     0.85,
      interval_secs:          3600,
      enabled:                false,
    }
  }
}

impl Default for LifecycleConfig {
  fn default() -> Self { Self { shutdown_grace_ms: 200 } }
}

// ─── Accessors ───────────────────────────────────────────────────────────────

impl QueryConfig {
  pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

impl CacheConfig {
  pub fn query_ttl(&self) -> Duration { Duration::from_secs(self.query_ttl_secs) }

  pub fn embedding_ttl(&self) -> Duration { Duration::from_secs(self.embedding_ttl_secs) }
}

impl EmbeddingConfig {
  pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

impl ConsolidationConfig {
  pub fn interval(&self) -> Duration { Duration::from_secs(self.interval_secs) }
}

impl LifecycleConfig {
  pub fn grace(&self) -> Duration { Duration::from_millis(self.shutdown_grace_ms) }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl MemoryConfig {
  /// Load from `path` (if given and present) layered under `MNEMO_*`
  /// environment variables, then validate.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
      builder = builder.add_source(config::File::from(path).required(false));
    }
    let settings = builder
      .add_source(
        config::Environment::with_prefix("MNEMO")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()?;

    let cfg: MemoryConfig = settings.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> Result<()> {
    let w = &self.query.weights;
    for (name, value) in [
      ("similarity", w.similarity),
      ("recency", w.recency),
      ("reliability", w.reliability),
      ("diversity", w.diversity),
    ] {
      if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidConfig(format!("weight {name} must be finite and >= 0")));
      }
    }
    if self.query.timeout_ms == 0 {
      return Err(Error::InvalidConfig("query.timeout_ms must be > 0".into()));
    }
    if self.embedding.timeout_ms == 0 {
      return Err(Error::InvalidConfig("embedding.timeout_ms must be > 0".into()));
    }
    if !(self.query.min_similarity > 0.0 && self.query.min_similarity <= 1.0) {
      return Err(Error::InvalidConfig("query.min_similarity must be in (0, 1]".into()));
    }
    if self.query.default_limit == 0 {
      return Err(Error::InvalidConfig("query.default_limit must be > 0".into()));
    }
    if !(self.query.recency_half_life_hours > 0.0) {
      return Err(Error::InvalidConfig("query.recency_half_life_hours must be > 0".into()));
    }
    if !(0.0..=1.0).contains(&self.consolidation.min_success_rate) {
      return Err(Error::InvalidConfig(
        "consolidation.min_success_rate must be in [0, 1]".into(),
      ));
    }
    if self.consolidation.lookback_days <= 0 {
      return Err(Error::InvalidConfig("consolidation.lookback_days must be > 0".into()));
    }
    if self.consolidation.enabled && self.consolidation.interval_secs == 0 {
      return Err(Error::InvalidConfig("consolidation.interval_secs must be > 0".into()));
    }
    if self.cache.max_entries == 0 {
      return Err(Error::InvalidConfig("cache.max_entries must be > 0".into()));
    }
    Ok(())
  }

  /// `store_path` with a leading `~` expanded to the user's home directory.
  pub fn resolved_store_path(&self) -> PathBuf { expand_tilde(&self.store_path) }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use std::io::Write as _;

  use super::*;

  #[test]
  fn defaults_match_documented_values() {
    let cfg = MemoryConfig::default();
    assert_eq!(cfg.query.timeout(), Duration::from_secs(3));
    assert_eq!(cfg.query.default_limit, 10);
    assert_eq!(cfg.query.weights.similarity, 0.7);
    assert_eq!(cfg.query.weights.recency, 0.2);
    assert_eq!(cfg.query.weights.reliability, 0.1);
    assert_eq!(cfg.query.weights.diversity, 0.3);
    assert_eq!(cfg.cache.query_ttl(), Duration::from_secs(60));
    assert_eq!(cfg.consolidation.min_uses, 3);
    assert_eq!(cfg.consolidation.min_success_rate, 0.7);
    assert_eq!(cfg.lifecycle.grace(), Duration::from_millis(200));
    cfg.validate().unwrap();
  }

  #[test]
  fn load_layers_file_over_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mnemo.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(
      f,
      "store_path = \"/tmp/patterns.db\"\n\
       [query]\n\
       timeout_ms = 250\n\
       [query.weights]\n\
       similarity = 0.5\n\
       [consolidation]\n\
       min_uses = 5"
    )
    .unwrap();

    let cfg = MemoryConfig::load(Some(&path)).unwrap();
    assert_eq!(cfg.store_path, PathBuf::from("/tmp/patterns.db"));
    assert_eq!(cfg.query.timeout_ms, 250);
    assert_eq!(cfg.query.weights.similarity, 0.5);
    assert_eq!(cfg.query.weights.recency, 0.2);
    assert_eq!(cfg.consolidation.min_uses, 5);
    assert_eq!(cfg.cache.max_entries, 1024);
  }

  #[test]
  fn load_without_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = MemoryConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
    assert_eq!(cfg.query.timeout_ms, 3000);
  }

  #[test]
  fn validate_rejects_bad_values() {
    let mut cfg = MemoryConfig::default();
    cfg.query.weights.recency = -0.1;
    assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

    let mut cfg = MemoryConfig::default();
    cfg.consolidation.min_success_rate = 1.5;
    assert!(cfg.validate().is_err());

    let mut cfg = MemoryConfig::default();
    cfg.query.timeout_ms = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = MemoryConfig::default();
    cfg.query.min_similarity = 0.0;
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn load_reads_nested_keys_from_environment() {
    // no other test reads this key
    unsafe { std::env::set_var("MNEMO_CONSOLIDATION__LOOKBACK_DAYS", "21") };
    let cfg = MemoryConfig::load(None);
    unsafe { std::env::remove_var("MNEMO_CONSOLIDATION__LOOKBACK_DAYS") };

    assert_eq!(cfg.unwrap().consolidation.lookback_days, 21);
  }

  #[test]
  fn tilde_is_expanded() {
    let cfg = MemoryConfig { store_path: PathBuf::from("/abs/db"), ..Default::default() };
    assert_eq!(cfg.resolved_store_path(), PathBuf::from("/abs/db"));
  }
}
