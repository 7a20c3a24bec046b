//! Relevance scoring and MMR re-ranking for semantic candidates.
//!
//! Each candidate gets a relevance score from three signals:
//!
//! ```text
//! relevance = α·similarity + β·recency + γ·reliability
//! ```
//!
//! where `similarity` is cosine similarity mapped from `[-1, 1]` to `[0, 1]`,
//! `recency` halves every `half_life` since the pattern was last used, and
//! `reliability` is its confidence. The top of the pool is then re-ranked
//! by maximal marginal relevance, adding `δ·(1 − maxSim)` where `maxSim` is
//! the candidate's highest normalised similarity to anything already picked.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use mnemo_core::{embedding::EmbeddedPattern, pattern::Pattern};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
  /// α
  pub similarity:  f64,
  /// β
  pub recency:     f64,
  /// γ
  pub reliability: f64,
  /// δ, applied during MMR selection.
  pub diversity:   f64,
}

impl Default for RankingWeights {
  fn default() -> Self {
    Self { similarity: 0.7, recency: 0.2, reliability: 0.1, diversity: 0.3 }
  }
}

/// Inputs to [`score_candidates`] that come from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
  pub weights:        RankingWeights,
  /// Raw cosine floor.
  pub min_similarity: f64,
  pub half_life:      chrono::Duration,
  /// Candidates kept for MMR, best relevance first.
  pub pool:           usize,
}

#[derive(Debug, Clone)]
pub struct Candidate {
  pub pattern:    Pattern,
  pub vector:     Vec<f32>,
  /// Raw cosine similarity to the query.
  pub similarity: f64,
  pub relevance:  f64,
}

// ─── Similarity ──────────────────────────────────────────────────────────────

/// Cosine similarity in `[-1, 1]`. Zero for empty, mismatched, or zero-norm
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
  if a.len() != b.len() || a.is_empty() {
    return 0.0;
  }
  let (mut dot, mut na, mut nb) = (0.0_f64, 0.0_f64, 0.0_f64);
  for (x, y) in a.iter().zip(b) {
    let (x, y) = (f64::from(*x), f64::from(*y));
    dot += x * y;
    na += x * x;
    nb += y * y;
  }
  if na == 0.0 || nb == 0.0 {
    return 0.0;
  }
  (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

pub fn normalized_similarity(cosine: f64) -> f64 { ((cosine + 1.0) / 2.0).clamp(0.0, 1.0) }

/// `0.5^(age / half_life)`. Timestamps in the future count as age zero.
pub fn recency(updated_at: DateTime<Utc>, now: DateTime<Utc>, half_life: chrono::Duration) -> f64 {
  let half_life_ms = half_life.num_milliseconds();
  if half_life_ms <= 0 {
    return 0.0;
  }
  let age_ms = (now - updated_at).num_milliseconds().max(0);
  0.5_f64.powf(age_ms as f64 / half_life_ms as f64)
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// Score every candidate against `query`, drop those under the similarity
/// floor, and keep the best `params.pool` by relevance.
///
/// A candidate that is orthogonal or opposed to the query (cosine ≤ 0) is
/// never a match, whatever the floor. That covers a zero-norm query vector,
/// which is what a provider produces for text it knows nothing about.
pub fn score_candidates(
  query: &[f32],
  candidates: Vec<EmbeddedPattern>,
  params: &ScoringParams,
  now: DateTime<Utc>,
) -> Vec<Candidate> {
  let w = params.weights;
  let mut scored: Vec<Candidate> = candidates
    .into_iter()
    .filter_map(|c| {
      let similarity = cosine_similarity(query, &c.embedding.vector);
      if similarity <= 0.0 || similarity < params.min_similarity {
        return None;
      }
      let relevance = w.similarity * normalized_similarity(similarity)
        + w.recency * recency(c.pattern.updated_at, now, params.half_life)
        + w.reliability * c.pattern.confidence.get();
      Some(Candidate { pattern: c.pattern, vector: c.embedding.vector, similarity, relevance })
    })
    .collect();

  scored.sort_by(|a, b| by_score(a.relevance, &a.pattern, b.relevance, &b.pattern));
  scored.truncate(params.pool);
  scored
}

/// Higher score first, then the canonical pattern order.
fn by_score(sa: f64, a: &Pattern, sb: f64, b: &Pattern) -> Ordering {
  sb.partial_cmp(&sa)
    .unwrap_or(Ordering::Equal)
    .then_with(|| a.canonical_cmp(b))
}

// ─── MMR ─────────────────────────────────────────────────────────────────────

/// Greedily pick up to `k` candidates maximising
/// `relevance + diversity·(1 − maxSimToSelected)`.
///
/// Returns each chosen pattern with the MMR score it had when selected.
/// Before anything is selected `maxSim` is zero, so the first pick is the
/// most relevant candidate.
pub fn mmr_select(candidates: Vec<Candidate>, k: usize, diversity: f64) -> Vec<(Pattern, f64)> {
  let k = k.min(candidates.len());
  if k == 0 {
    return Vec::new();
  }

  // max normalised similarity of each remaining candidate to the selection
  let mut max_sim = vec![0.0_f64; candidates.len()];
  let mut remaining: Vec<usize> = (0..candidates.len()).collect();
  let mut picked: Vec<(usize, f64)> = Vec::with_capacity(k);

  while picked.len() < k && !remaining.is_empty() {
    let mmr = |i: usize| candidates[i].relevance + diversity * (1.0 - max_sim[i]);
    let Some((pos, &best)) = remaining.iter().enumerate().min_by(|(_, a), (_, b)| {
      by_score(mmr(**a), &candidates[**a].pattern, mmr(**b), &candidates[**b].pattern)
    }) else {
      break;
    };
    let score = mmr(best);
    remaining.swap_remove(pos);

    for &i in &remaining {
      let sim = normalized_similarity(cosine_similarity(&candidates[i].vector, &candidates[best].vector));
      if sim > max_sim[i] {
        max_sim[i] = sim;
      }
    }
    picked.push((best, score));
  }

  let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
  picked
    .into_iter()
    .filter_map(|(i, score)| slots[i].take().map(|c| (c.pattern, score)))
    .collect()
}
