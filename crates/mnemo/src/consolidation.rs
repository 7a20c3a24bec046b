//! Consolidation: promote repeatedly successful patterns into skills and
//! prune patterns nobody uses.
//!
//! One pass over a namespace does, in order:
//!
//! 1. Revise the confidence of every pattern with at least `min_uses`
//!    recorded outcomes in the window to its observed success rate.
//! 2. Group the patterns used at least `min_uses` times in the window. Two
//!    patterns share a group when their normalised keys match, when their
//!    embeddings reach `cluster_similarity` in cosine terms, or when neither
//!    has an embedding. Without embeddings there is no similarity signal, so
//!    all such patterns in the namespace form one group.
//! 3. Upsert a skill for each group whose success rate reaches
//!    `min_success_rate`.
//! 4. Delete patterns below the confidence floor that were never used, are
//!    older than the window, and back no skill.
//!
//! Every step converges, so a second pass over unchanged data writes nothing.

use std::{
  collections::{BTreeSet, HashMap, HashSet},
  sync::Arc,
};

use chrono::{DateTime, Utc};
use mnemo_core::{
  pattern::{Confidence, Pattern},
  skill::{SkillDraft, UpsertOutcome},
  store::PatternStore,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{Error, Result, config::ConsolidationConfig, ranking::cosine_similarity};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsolidationOptions {
  pub min_uses:               u64,
  pub min_success_rate:       f64,
  pub lookback:               chrono::Duration,
  pub prune_confidence_floor: f64,
  pub cluster_similarity:     f64,
}

impl From<&ConsolidationConfig> for ConsolidationOptions {
  fn from(cfg: &ConsolidationConfig) -> Self {
    Self {
      min_uses:               cfg.min_uses,
      min_success_rate:       cfg.min_success_rate,
      lookback:               chrono::Duration::days(cfg.lookback_days),
      prune_confidence_floor: cfg.prune_confidence_floor,
      cluster_similarity:     cfg.cluster_similarity,
    }
  }
}

/// Per-call overrides for `consolidate`. Unset fields use the configured
/// values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidateRequest {
  pub min_uses:         Option<u64>,
  pub min_success_rate: Option<f64>,
  pub lookback_days:    Option<i64>,
}

impl ConsolidateRequest {
  pub fn resolve(self, base: ConsolidationOptions) -> Result<ConsolidationOptions> {
    let mut opts = base;
    if let Some(min_uses) = self.min_uses {
      opts.min_uses = min_uses;
    }
    if let Some(rate) = self.min_success_rate {
      if !(0.0..=1.0).contains(&rate) {
        return Err(Error::InvalidConfig(format!("min_success_rate {rate} is outside [0, 1]")));
      }
      opts.min_success_rate = rate;
    }
    if let Some(days) = self.lookback_days {
      if days <= 0 {
        return Err(Error::InvalidConfig(format!("lookback_days must be > 0, got {days}")));
      }
      opts.lookback = chrono::Duration::days(days);
    }
    Ok(opts)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
  pub skills_created:     u64,
  pub skills_updated:     u64,
  pub patterns_pruned:    u64,
  pub confidence_revised: u64,
}

impl ConsolidationReport {
  pub fn is_empty(&self) -> bool { *self == Self::default() }

  pub fn absorb(&mut self, other: Self) {
    self.skills_created += other.skills_created;
    self.skills_updated += other.skills_updated;
    self.patterns_pruned += other.patterns_pruned;
    self.confidence_revised += other.confidence_revised;
  }
}

#[derive(Debug, Clone, Copy, Default)]
struct Outcomes {
  successes: u64,
  total:     u64,
}

impl Outcomes {
  fn rate(self) -> Option<f64> {
    (self.total > 0).then(|| self.successes as f64 / self.total as f64)
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct Consolidator<S> {
  store: Arc<S>,
  /// Embedding model used for clustering; `None` groups by key only.
  model: Option<String>,
}

impl<S: PatternStore> Consolidator<S> {
  pub fn new(store: Arc<S>, model: Option<String>) -> Self { Self { store, model } }

  /// Consolidate one namespace.
  pub async fn run(&self, namespace: &str, opts: &ConsolidationOptions) -> Result<ConsolidationReport> {
    let mut report = ConsolidationReport::default();
    let cutoff = Utc::now() - opts.lookback;

    let outcomes = self.outcomes_since(namespace, cutoff).await?;
    let mut patterns = self
      .store
      .list_patterns(Some(namespace), None)
      .await
      .map_err(Error::storage)?;

    // 1. confidence revision
    for pattern in patterns.iter_mut() {
      let Some(o) = outcomes.get(&pattern.pattern_id) else { continue };
      let Some(rate) = o.rate() else { continue };
      if o.total < opts.min_uses || (rate - pattern.confidence.get()).abs() <= EPSILON {
        continue;
      }
      if let Some(updated) = self
        .store
        .set_confidence(pattern.pattern_id, Confidence::saturating(rate))
        .await
        .map_err(Error::storage)?
      {
        *pattern = updated;
        report.confidence_revised += 1;
      }
    }
    patterns.sort_by(Pattern::canonical_cmp);

    // 2-3. skills
    let uses = |p: &Pattern| -> u64 {
      let recorded = outcomes.get(&p.pattern_id).map_or(0, |o| o.total);
      let counted = if p.updated_at >= cutoff { p.usage_count } else { 0 };
      recorded.max(counted)
    };
    let qualifying: Vec<&Pattern> = patterns.iter().filter(|p| uses(*p) >= opts.min_uses).collect();
    let vectors = self.vectors(namespace).await?;

    for group in cluster(&qualifying, &vectors, opts.cluster_similarity) {
      let members: Vec<&Pattern> = group.iter().map(|&i| qualifying[i]).collect();
      let group_outcomes = members.iter().fold(Outcomes::default(), |acc, p| {
        let o = outcomes.get(&p.pattern_id).copied().unwrap_or_default();
        Outcomes { successes: acc.successes + o.successes, total: acc.total + o.total }
      });

      let total_uses: u64 = members.iter().map(|p| uses(*p)).sum();
      let avg_reward = weighted_confidence(&members, &uses);
      let success_rate = group_outcomes.rate().unwrap_or(avg_reward);
      if success_rate + EPSILON < opts.min_success_rate {
        tracing::debug!(
          namespace,
          size = members.len(),
          success_rate,
          "group below success threshold"
        );
        continue;
      }

      // members are in canonical order, so the first is the top-ranked
      let draft = SkillDraft {
        namespace:          namespace.to_owned(),
        name:               normalize_key(&members[0].key),
        source_pattern_ids: members.iter().map(|p| p.pattern_id).collect::<BTreeSet<Uuid>>(),
        avg_reward,
        usage_count:        total_uses,
      };
      let (skill, outcome) = self.store.upsert_skill(draft).await.map_err(Error::storage)?;
      match outcome {
        UpsertOutcome::Created => {
          tracing::debug!(namespace, skill = %skill.name, "skill created");
          report.skills_created += 1;
        }
        UpsertOutcome::Updated => report.skills_updated += 1,
        UpsertOutcome::Unchanged => {}
      }
    }

    // 4. pruning
    let referenced: HashSet<Uuid> = self
      .store
      .list_skills(Some(namespace))
      .await
      .map_err(Error::storage)?
      .into_iter()
      .flat_map(|s| s.source_pattern_ids)
      .collect();

    for pattern in &patterns {
      let prunable = pattern.confidence.get() < opts.prune_confidence_floor
        && pattern.usage_count == 0
        && pattern.created_at < cutoff
        && !referenced.contains(&pattern.pattern_id);
      if prunable && self.store.delete_pattern(pattern.pattern_id).await.map_err(Error::storage)? {
        report.patterns_pruned += 1;
      }
    }

    if !report.is_empty() {
      tracing::info!(
        namespace,
        skills_created = report.skills_created,
        skills_updated = report.skills_updated,
        patterns_pruned = report.patterns_pruned,
        confidence_revised = report.confidence_revised,
        "consolidation pass complete"
      );
    }
    Ok(report)
  }

  async fn outcomes_since(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<HashMap<Uuid, Outcomes>> {
    let trajectories = self
      .store
      .trajectories_since(namespace, cutoff)
      .await
      .map_err(Error::storage)?;
    let mut outcomes: HashMap<Uuid, Outcomes> = HashMap::new();
    for t in trajectories {
      let o = outcomes.entry(t.pattern_id).or_default();
      o.total += 1;
      if t.success {
        o.successes += 1;
      }
    }
    Ok(outcomes)
  }

  async fn vectors(&self, namespace: &str) -> Result<HashMap<Uuid, Vec<f32>>> {
    let Some(model) = self.model.as_deref() else {
      return Ok(HashMap::new());
    };
    Ok(
      self
        .store
        .embedded_patterns(Some(namespace), model)
        .await
        .map_err(Error::storage)?
        .into_iter()
        .map(|e| (e.pattern.pattern_id, e.embedding.vector))
        .collect(),
    )
  }
}

// ─── Grouping ────────────────────────────────────────────────────────────────

/// Trimmed, lower-cased key.
pub fn normalize_key(key: &str) -> String { key.trim().to_lowercase() }

/// Usage-weighted mean confidence; the plain mean if nothing was used.
fn weighted_confidence(members: &[&Pattern], uses: &impl Fn(&Pattern) -> u64) -> f64 {
  if members.is_empty() {
    return 0.0;
  }
  let total: u64 = members.iter().map(|p| uses(*p)).sum();
  let mean = if total == 0 {
    members.iter().map(|p| p.confidence.get()).sum::<f64>() / members.len() as f64
  } else {
    members
      .iter()
      .map(|p| p.confidence.get() * uses(*p) as f64)
      .sum::<f64>()
      / total as f64
  };
  mean.clamp(0.0, 1.0)
}

/// Union-find over `patterns`: same normalised key, embedding cosine at or
/// above `threshold`, or no embedding on either side. Groups and their
/// members keep input order.
fn cluster(
  patterns: &[&Pattern],
  vectors: &HashMap<Uuid, Vec<f32>>,
  threshold: f64,
) -> Vec<Vec<usize>> {
  let n = patterns.len();
  let mut parent: Vec<usize> = (0..n).collect();
  let mut rank = vec![0_usize; n];
  let keys: Vec<String> = patterns.iter().map(|p| normalize_key(&p.key)).collect();

  for i in 0..n {
    for j in (i + 1)..n {
      let similar = keys[i] == keys[j]
        || match (vectors.get(&patterns[i].pattern_id), vectors.get(&patterns[j].pattern_id)) {
          (Some(a), Some(b)) => cosine_similarity(a, b) >= threshold,
          (None, None) => true,
          _ => false,
        };
      if similar {
        union(&mut parent, &mut rank, i, j);
      }
    }
  }

  let mut groups: Vec<Vec<usize>> = Vec::new();
  let mut slot: HashMap<usize, usize> = HashMap::new();
  for i in 0..n {
    let root = find(&mut parent, i);
    let idx = *slot.entry(root).or_insert_with(|| {
      groups.push(Vec::new());
      groups.len() - 1
    });
    groups[idx].push(i);
  }
  groups
}

fn find(parent: &mut [usize], i: usize) -> usize {
  if parent[i] != i {
    parent[i] = find(parent, parent[i]);
  }
  parent[i]
}

fn union(parent: &mut [usize], rank: &mut [usize], a: usize, b: usize) {
  let ra = find(parent, a);
  let rb = find(parent, b);
  if ra == rb {
    return;
  }
  match rank[ra].cmp(&rank[rb]) {
    std::cmp::Ordering::Less => parent[ra] = rb,
    std::cmp::Ordering::Greater => parent[rb] = ra,
    std::cmp::Ordering::Equal => {
      parent[rb] = ra;
      rank[ra] += 1;
    }
  }
}
