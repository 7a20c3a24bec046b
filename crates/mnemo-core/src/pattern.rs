//! Patterns: the unit of remembered knowledge.
//!
//! A pattern is a short `key` plus a free-text `value`, scoped to a
//! namespace. Its content is immutable after creation; only the usage
//! counter and the confidence are ever revised.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Confidence ──────────────────────────────────────────────────────────────

/// A belief score in `[0, 1]`. Construction rejects anything else, so a
/// `Confidence` in hand is always in range.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
  pub const MAX: Confidence = Confidence(1.0);
  pub const MIN: Confidence = Confidence(0.0);

  pub fn new(value: f64) -> Result<Self> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
      Ok(Self(value))
    } else {
      Err(Error::InvalidConfidence(value))
    }
  }

  /// Clamp an arbitrary score into range. NaN maps to zero.
  pub fn saturating(value: f64) -> Self {
    if value.is_nan() {
      Self::MIN
    } else {
      Self(value.clamp(0.0, 1.0))
    }
  }

  pub fn get(self) -> f64 { self.0 }
}

impl Default for Confidence {
  fn default() -> Self { Self(0.5) }
}

impl TryFrom<f64> for Confidence {
  type Error = Error;

  fn try_from(value: f64) -> Result<Self> { Self::new(value) }
}

impl From<Confidence> for f64 {
  fn from(c: Confidence) -> f64 { c.0 }
}

// ─── Pattern ─────────────────────────────────────────────────────────────────

/// A persisted pattern record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
  pub pattern_id:    Uuid,
  pub namespace:     String,
  /// Short label. Not unique within a namespace.
  pub key:           String,
  pub value:         String,
  pub confidence:    Confidence,
  /// Number of times the pattern was returned and used. Never decreases.
  pub usage_count:   u64,
  pub created_at:    DateTime<Utc>,
  /// Always `>= created_at`.
  pub updated_at:    DateTime<Utc>,
  /// The id of the pattern's embedding row, once one has been generated.
  pub embedding_ref: Option<Uuid>,
}

impl Pattern {
  /// The canonical ranking: `confidence DESC, usage_count DESC`, then newest
  /// first, then by id so the order is total.
  pub fn canonical_cmp(&self, other: &Self) -> Ordering {
    other
      .confidence
      .get()
      .total_cmp(&self.confidence.get())
      .then_with(|| other.usage_count.cmp(&self.usage_count))
      .then_with(|| other.created_at.cmp(&self.created_at))
      .then_with(|| self.pattern_id.cmp(&other.pattern_id))
  }

  /// Case-insensitive substring test over `key` and `value`.
  pub fn contains_text(&self, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    self.key.to_lowercase().contains(&needle)
      || self.value.to_lowercase().contains(&needle)
  }

  /// The text handed to an embedding provider for this pattern.
  pub fn embedding_text(&self) -> String {
    format!("{}: {}", self.key, self.value)
  }
}

/// Input for [`PatternStore::insert_pattern`](crate::store::PatternStore::insert_pattern).
/// Ids and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPattern {
  pub namespace:  String,
  pub key:        String,
  pub value:      String,
  pub confidence: Confidence,
}

impl NewPattern {
  /// Validates `confidence`; fails with [`Error::InvalidConfidence`].
  pub fn new(
    namespace: impl Into<String>,
    key: impl Into<String>,
    value: impl Into<String>,
    confidence: f64,
  ) -> Result<Self> {
    Ok(Self {
      namespace:  namespace.into(),
      key:        key.into(),
      value:      value.into(),
      confidence: Confidence::new(confidence)?,
    })
  }
}
