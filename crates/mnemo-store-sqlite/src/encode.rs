//! Encoding and decoding helpers between Rust domain types and the plain
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings in UTC with
//! microsecond precision. UUIDs are stored as hyphenated lowercase strings.
//! Embedding vectors are stored as little-endian `f32` blobs.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use mnemo_core::{
  embedding::{Embedding, vector_from_bytes},
  pattern::{Confidence, Pattern},
  skill::Skill,
  trajectory::Trajectory,
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ────────────────────────────────────────────────────────────

/// The current time, truncated to the precision the store keeps, so values
/// handed back to callers compare equal to what a later read returns.
pub fn now() -> DateTime<Utc> { Utc::now().trunc_subsecs(6) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn decode_count(n: i64) -> Result<u64> {
  u64::try_from(n).map_err(|_| Error::Corrupt(format!("negative counter {n}")))
}

pub fn decode_confidence(c: f64) -> Result<Confidence> {
  Confidence::new(c).map_err(|_| Error::Corrupt(format!("confidence {c} out of range")))
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list matching [`RawPattern::from_row`]. Always selected from
/// `patterns p LEFT JOIN pattern_embeddings e`.
pub const PATTERN_COLUMNS: &str = "p.pattern_id, p.namespace, p.key, p.value, p.confidence,
   p.usage_count, p.created_at, p.updated_at, e.embedding_id";

pub const PATTERN_FROM: &str =
  "FROM patterns p LEFT JOIN pattern_embeddings e ON e.pattern_id = p.pattern_id";

pub const CANONICAL_ORDER: &str =
  "ORDER BY p.confidence DESC, p.usage_count DESC, p.created_at DESC, p.pattern_id ASC";

/// Raw values read directly from a `patterns` row joined with its embedding id.
pub struct RawPattern {
  pub pattern_id:   String,
  pub namespace:    String,
  pub key:          String,
  pub value:        String,
  pub confidence:   f64,
  pub usage_count:  i64,
  pub created_at:   String,
  pub updated_at:   String,
  pub embedding_id: Option<String>,
}

impl RawPattern {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      pattern_id:   row.get(0)?,
      namespace:    row.get(1)?,
      key:          row.get(2)?,
      value:        row.get(3)?,
      confidence:   row.get(4)?,
      usage_count:  row.get(5)?,
      created_at:   row.get(6)?,
      updated_at:   row.get(7)?,
      embedding_id: row.get(8)?,
    })
  }

  pub fn into_pattern(self) -> Result<Pattern> {
    Ok(Pattern {
      pattern_id:    decode_uuid(&self.pattern_id)?,
      namespace:     self.namespace,
      key:           self.key,
      value:         self.value,
      confidence:    decode_confidence(self.confidence)?,
      usage_count:   decode_count(self.usage_count)?,
      created_at:    decode_dt(&self.created_at)?,
      updated_at:    decode_dt(&self.updated_at)?,
      embedding_ref: self.embedding_id.as_deref().map(decode_uuid).transpose()?,
    })
  }
}

/// Raw values from a `pattern_embeddings` row.
pub struct RawEmbedding {
  pub embedding_id: String,
  pub pattern_id:   String,
  pub model:        String,
  pub dims:         i64,
  pub vector:       Vec<u8>,
  pub created_at:   String,
}

impl RawEmbedding {
  /// Reads the six embedding columns starting at `offset`.
  pub fn from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
    Ok(Self {
      embedding_id: row.get(offset)?,
      pattern_id:   row.get(offset + 1)?,
      model:        row.get(offset + 2)?,
      dims:         row.get(offset + 3)?,
      vector:       row.get(offset + 4)?,
      created_at:   row.get(offset + 5)?,
    })
  }

  pub fn into_embedding(self) -> Result<Embedding> {
    let embedding_id = decode_uuid(&self.embedding_id)?;
    let dims = usize::try_from(self.dims)
      .map_err(|_| Error::Corrupt(format!("embedding {embedding_id} has dims {}", self.dims)))?;
    let vector = vector_from_bytes(&self.vector)
      .filter(|v| v.len() == dims)
      .ok_or_else(|| Error::Corrupt(format!("embedding {embedding_id} vector does not match dims")))?;

    Ok(Embedding {
      embedding_id,
      pattern_id: decode_uuid(&self.pattern_id)?,
      model: self.model,
      dims,
      vector,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values from a `skills` row plus its `pattern_links` members.
pub struct RawSkill {
  pub skill_id:    String,
  pub namespace:   String,
  pub name:        String,
  pub avg_reward:  f64,
  pub usage_count: i64,
  pub created_at:  String,
  pub updated_at:  String,
  pub sources:     Vec<String>,
}

impl RawSkill {
  pub fn into_skill(self) -> Result<Skill> {
    let source_pattern_ids = self
      .sources
      .iter()
      .map(String::as_str)
      .map(decode_uuid)
      .collect::<Result<BTreeSet<_>>>()?;

    Ok(Skill {
      skill_id: decode_uuid(&self.skill_id)?,
      namespace: self.namespace,
      name: self.name,
      source_pattern_ids,
      avg_reward: self.avg_reward,
      usage_count: decode_count(self.usage_count)?,
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw values from a `task_trajectories` row.
pub struct RawTrajectory {
  pub trajectory_id: String,
  pub pattern_id:    String,
  pub namespace:     String,
  pub task:          String,
  pub success:       bool,
  pub recorded_at:   String,
}

impl RawTrajectory {
  pub fn into_trajectory(self) -> Result<Trajectory> {
    Ok(Trajectory {
      trajectory_id: decode_uuid(&self.trajectory_id)?,
      pattern_id:    decode_uuid(&self.pattern_id)?,
      namespace:     self.namespace,
      task:          self.task,
      success:       self.success,
      recorded_at:   decode_dt(&self.recorded_at)?,
    })
  }
}

/// Escape `%`, `_` and `\` so `text` matches literally inside a
/// `LIKE ... ESCAPE '\'` pattern.
pub fn like_pattern(text: &str) -> String {
  let mut out = String::with_capacity(text.len() + 2);
  out.push('%');
  for ch in text.chars() {
    if matches!(ch, '%' | '_' | '\\') {
      out.push('\\');
    }
    out.push(ch);
  }
  out.push('%');
  out
}
