//! Skills: consolidated summaries over groups of successful patterns.
//!
//! Skills are derived data. They are written only by consolidation and can
//! be dropped and rebuilt from patterns without loss.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
  pub skill_id:           Uuid,
  pub namespace:          String,
  /// Identity within the namespace; consolidation upserts by `(namespace, name)`.
  pub name:               String,
  /// Never empty; a skill whose last source is deleted is deleted with it.
  pub source_pattern_ids: BTreeSet<Uuid>,
  /// Usage-weighted mean confidence of the sources.
  pub avg_reward:         f64,
  pub usage_count:        u64,
  pub created_at:         DateTime<Utc>,
  pub updated_at:         DateTime<Utc>,
}

/// The computed shape of a skill before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillDraft {
  pub namespace:          String,
  pub name:               String,
  pub source_pattern_ids: BTreeSet<Uuid>,
  pub avg_reward:         f64,
  pub usage_count:        u64,
}

impl SkillDraft {
  pub fn validate(&self) -> Result<()> {
    if self.source_pattern_ids.is_empty() {
      return Err(Error::EmptySkill);
    }
    if !(0.0..=1.0).contains(&self.avg_reward) {
      return Err(Error::InvalidConfidence(self.avg_reward));
    }
    Ok(())
  }

  /// Whether persisting this draft over `existing` would change anything.
  pub fn differs_from(&self, existing: &Skill) -> bool {
    self.source_pattern_ids != existing.source_pattern_ids
      || self.usage_count != existing.usage_count
      || (self.avg_reward - existing.avg_reward).abs() > 1e-9
  }
}

/// What [`PatternStore::upsert_skill`](crate::store::PatternStore::upsert_skill) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
  Created,
  Updated,
  Unchanged,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn draft(ids: &[Uuid]) -> SkillDraft {
    SkillDraft {
      namespace:          "ns".into(),
      name:               "retry".into(),
      source_pattern_ids: ids.iter().copied().collect(),
      avg_reward:         0.8,
      usage_count:        9,
    }
  }

  #[test]
  fn empty_sources_are_rejected() {
    assert!(matches!(draft(&[]).validate(), Err(Error::EmptySkill)));
  }

  #[test]
  fn differs_from_ignores_float_noise() {
    let id = Uuid::new_v4();
    let d = draft(&[id]);
    let now = Utc::now();
    let existing = Skill {
      skill_id:           Uuid::new_v4(),
      namespace:          d.namespace.clone(),
      name:               d.name.clone(),
      source_pattern_ids: d.source_pattern_ids.clone(),
      avg_reward:         0.8 + 1e-12,
      usage_count:        9,
      created_at:         now,
      updated_at:         now,
    };
    assert!(!d.differs_from(&existing));

    let mut grown = d.clone();
    grown.source_pattern_ids.insert(Uuid::new_v4());
    assert!(grown.differs_from(&existing));
  }
}
