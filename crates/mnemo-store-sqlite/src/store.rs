//! [`SqliteStore`], the SQLite implementation of [`PatternStore`].

use std::{collections::BTreeSet, path::Path};

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use mnemo_core::{
  embedding::{EmbeddedPattern, Embedding, vector_to_bytes},
  pattern::{Confidence, NewPattern, Pattern},
  skill::{Skill, SkillDraft, UpsertOutcome},
  store::{LexicalQuery, PatternStore, Stats},
  trajectory::{NewTrajectory, Trajectory},
};

use crate::{
  Error, Result,
  encode::{
    CANONICAL_ORDER, PATTERN_COLUMNS, PATTERN_FROM, RawEmbedding, RawPattern, RawSkill,
    RawTrajectory, decode_count, encode_dt, encode_uuid, like_pattern, now,
  },
  schema::SCHEMA,
};

/// Matches any text containing a character outside ASCII.
const NON_ASCII_GLOB: &str = "*[^\u{1}-\u{7f}]*";

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Mnemo pattern store backed by a single SQLite file.
///
/// Cloning is cheap: the inner connection is reference-counted, and every
/// clone talks to the same database thread.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Connection-thread helpers ───────────────────────────────────────────────

fn select_pattern(
  conn: &rusqlite::Connection,
  id: &str,
) -> rusqlite::Result<Option<RawPattern>> {
  conn
    .query_row(
      &format!("SELECT {PATTERN_COLUMNS} {PATTERN_FROM} WHERE p.pattern_id = ?1"),
      rusqlite::params![id],
      RawPattern::from_row,
    )
    .optional()
}

/// Load skills (with their members), optionally narrowed to a namespace
/// and/or a name.
fn select_skills(
  conn: &rusqlite::Connection,
  namespace: Option<&str>,
  name: Option<&str>,
) -> rusqlite::Result<Vec<RawSkill>> {
  let mut stmt = conn.prepare(
    "SELECT skill_id, namespace, name, avg_reward, usage_count, created_at, updated_at
     FROM skills
     WHERE (?1 IS NULL OR namespace = ?1)
       AND (?2 IS NULL OR name = ?2)
     ORDER BY namespace, name",
  )?;
  let mut skills = stmt
    .query_map(rusqlite::params![namespace, name], |row| {
      Ok(RawSkill {
        skill_id:    row.get(0)?,
        namespace:   row.get(1)?,
        name:        row.get(2)?,
        avg_reward:  row.get(3)?,
        usage_count: row.get(4)?,
        created_at:  row.get(5)?,
        updated_at:  row.get(6)?,
        sources:     Vec::new(),
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut links =
    conn.prepare("SELECT pattern_id FROM pattern_links WHERE skill_id = ?1 ORDER BY pattern_id")?;
  for skill in &mut skills {
    skill.sources = links
      .query_map(rusqlite::params![skill.skill_id], |r| r.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
  }
  Ok(skills)
}

fn replace_links(
  conn: &rusqlite::Connection,
  skill_id: &str,
  sources: &BTreeSet<Uuid>,
) -> rusqlite::Result<()> {
  conn.execute("DELETE FROM pattern_links WHERE skill_id = ?1", rusqlite::params![skill_id])?;
  let mut insert =
    conn.prepare("INSERT INTO pattern_links (skill_id, pattern_id) VALUES (?1, ?2)")?;
  for id in sources {
    insert.execute(rusqlite::params![skill_id, encode_uuid(*id)])?;
  }
  Ok(())
}

fn to_i64(n: impl TryInto<i64>) -> i64 { n.try_into().unwrap_or(i64::MAX) }

fn to_call_error(e: Error) -> tokio_rusqlite::Error { tokio_rusqlite::Error::Other(Box::new(e)) }

/// Result of the embedding write transaction.
enum PutEmbedding {
  Stored,
  MissingPattern,
  DimsConflict(i64),
}

// ─── PatternStore impl ───────────────────────────────────────────────────────

impl PatternStore for SqliteStore {
  type Error = Error;

  // ── Patterns ──────────────────────────────────────────────────────────────

  async fn insert_pattern(&self, input: NewPattern) -> Result<Pattern> {
    let created_at = now();
    let pattern = Pattern {
      pattern_id:    Uuid::new_v4(),
      namespace:     input.namespace,
      key:           input.key,
      value:         input.value,
      confidence:    input.confidence,
      usage_count:   0,
      created_at,
      updated_at:    created_at,
      embedding_ref: None,
    };

    let id_str     = encode_uuid(pattern.pattern_id);
    let namespace  = pattern.namespace.clone();
    let key        = pattern.key.clone();
    let value      = pattern.value.clone();
    let confidence = pattern.confidence.get();
    let at_str     = encode_dt(created_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO patterns (
             pattern_id, namespace, key, value, confidence, usage_count, created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
          rusqlite::params![id_str, namespace, key, value, confidence, at_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(pattern)
  }

  async fn get_pattern(&self, id: Uuid) -> Result<Option<Pattern>> {
    let id_str = encode_uuid(id);
    let raw = self
      .conn
      .call(move |conn| Ok(select_pattern(conn, &id_str)?))
      .await?;
    raw.map(RawPattern::into_pattern).transpose()
  }

  async fn touch(&self, id: Uuid) -> Result<Option<Pattern>> {
    let id_str = encode_uuid(id);
    let at_str = encode_dt(now());

    let raw = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        // Single-statement increment: the counter is read and written by the
        // database, never round-tripped through the caller.
        let changed = tx.execute(
          "UPDATE patterns
           SET usage_count = usage_count + 1,
               updated_at  = max(updated_at, ?2)
           WHERE pattern_id = ?1",
          rusqlite::params![id_str, at_str],
        )?;
        let raw = if changed == 0 { None } else { select_pattern(&tx, &id_str)? };
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.map(RawPattern::into_pattern).transpose()
  }

  async fn list_patterns<'a>(
    &'a self,
    namespace: Option<&'a str>,
    limit: Option<usize>,
  ) -> Result<Vec<Pattern>> {
    let namespace = namespace.map(str::to_owned);
    let limit_val = limit.map_or(-1, |l| to_i64(l));

    let raws: Vec<RawPattern> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {PATTERN_COLUMNS} {PATTERN_FROM}
           WHERE (?1 IS NULL OR p.namespace = ?1)
           {CANONICAL_ORDER}
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![namespace, limit_val], RawPattern::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawPattern::into_pattern).collect()
  }

  async fn search_lexical<'a>(&'a self, query: &'a LexicalQuery) -> Result<Vec<Pattern>> {
    if query.limit == 0 {
      return Ok(Vec::new());
    }

    let namespace = query.namespace.clone();
    let limit     = query.limit;
    let text      = query.text.clone();

    let raws: Vec<RawPattern> = self
      .conn
      .call(move |conn| {
        // Matching is decided by Unicode lower-casing below. LIKE only folds
        // ASCII case, so for ASCII needles it serves as a prefilter, and rows
        // holding any non-ASCII text always reach the Unicode check.
        let like = text.is_ascii().then(|| like_pattern(&text));
        let needle = text.to_lowercase();
        let mut stmt = conn.prepare(&format!(
          "SELECT {PATTERN_COLUMNS} {PATTERN_FROM}
           WHERE (?1 IS NULL OR p.namespace = ?1)
             AND (?2 IS NULL
                  OR p.key LIKE ?2 ESCAPE '\\' OR p.value LIKE ?2 ESCAPE '\\'
                  OR p.key GLOB ?3 OR p.value GLOB ?3)
           {CANONICAL_ORDER}"
        ))?;
        let mut out = Vec::new();
        let rows =
          stmt.query_map(rusqlite::params![namespace, like, NON_ASCII_GLOB], RawPattern::from_row)?;
        for row in rows {
          let raw = row?;
          if raw.key.to_lowercase().contains(&needle) || raw.value.to_lowercase().contains(&needle)
          {
            out.push(raw);
            if out.len() == limit {
              break;
            }
          }
        }
        Ok(out)
      })
      .await?;

    raws.into_iter().map(RawPattern::into_pattern).collect()
  }

  async fn delete_pattern(&self, id: Uuid) -> Result<bool> {
    let id_str = encode_uuid(id);

    let removed = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        // Embeddings, links and trajectories go with the pattern via ON DELETE CASCADE.
        let removed = tx.execute(
          "DELETE FROM patterns WHERE pattern_id = ?1",
          rusqlite::params![id_str],
        )?;
        if removed > 0 {
          tx.execute(
            "DELETE FROM skills
             WHERE NOT EXISTS (SELECT 1 FROM pattern_links l WHERE l.skill_id = skills.skill_id)",
            [],
          )?;
        }
        tx.commit()?;
        Ok(removed > 0)
      })
      .await?;

    Ok(removed)
  }

  async fn set_confidence(&self, id: Uuid, confidence: Confidence) -> Result<Option<Pattern>> {
    let id_str = encode_uuid(id);
    let at_str = encode_dt(now());
    let value  = confidence.get();

    let raw = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE patterns
           SET confidence = ?2,
               updated_at = max(updated_at, ?3)
           WHERE pattern_id = ?1",
          rusqlite::params![id_str, value, at_str],
        )?;
        let raw = if changed == 0 { None } else { select_pattern(&tx, &id_str)? };
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.map(RawPattern::into_pattern).transpose()
  }

  // ── Embeddings ────────────────────────────────────────────────────────────

  async fn put_embedding(&self, embedding: Embedding) -> Result<bool> {
    if embedding.vector.len() != embedding.dims {
      return Err(
        mnemo_core::Error::DimensionMismatch {
          expected: embedding.dims,
          actual:   embedding.vector.len(),
        }
        .into(),
      );
    }

    let emb_id_str = encode_uuid(embedding.embedding_id);
    let pid_str    = encode_uuid(embedding.pattern_id);
    let model      = embedding.model.clone();
    let dims       = to_i64(embedding.dims);
    let blob       = vector_to_bytes(&embedding.vector);
    let at_str     = encode_dt(embedding.created_at);

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let exists = tx
          .query_row(
            "SELECT 1 FROM patterns WHERE pattern_id = ?1",
            rusqlite::params![pid_str],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if !exists {
          return Ok(PutEmbedding::MissingPattern);
        }

        let model_dims: Option<i64> = tx
          .query_row(
            "SELECT dims FROM pattern_embeddings WHERE model = ?1 AND pattern_id != ?2 LIMIT 1",
            rusqlite::params![model, pid_str],
            |r| r.get(0),
          )
          .optional()?;
        if let Some(existing) = model_dims
          && existing != dims
        {
          return Ok(PutEmbedding::DimsConflict(existing));
        }

        tx.execute(
          "INSERT INTO pattern_embeddings (embedding_id, pattern_id, model, dims, vector, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT (pattern_id) DO UPDATE SET
             embedding_id = excluded.embedding_id,
             model        = excluded.model,
             dims         = excluded.dims,
             vector       = excluded.vector,
             created_at   = excluded.created_at",
          rusqlite::params![emb_id_str, pid_str, model, dims, blob, at_str],
        )?;
        tx.commit()?;
        Ok(PutEmbedding::Stored)
      })
      .await?;

    match outcome {
      PutEmbedding::Stored => Ok(true),
      PutEmbedding::MissingPattern => Ok(false),
      PutEmbedding::DimsConflict(expected) => Err(
        mnemo_core::Error::DimensionMismatch {
          expected: decode_count(expected)? as usize,
          actual:   embedding.dims,
        }
        .into(),
      ),
    }
  }

  async fn get_embedding(&self, pattern_id: Uuid) -> Result<Option<Embedding>> {
    let pid_str = encode_uuid(pattern_id);

    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT embedding_id, pattern_id, model, dims, vector, created_at
               FROM pattern_embeddings WHERE pattern_id = ?1",
              rusqlite::params![pid_str],
              |row| RawEmbedding::from_row(row, 0),
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawEmbedding::into_embedding).transpose()
  }

  async fn embedded_patterns<'a>(
    &'a self,
    namespace: Option<&'a str>,
    model: &'a str,
  ) -> Result<Vec<EmbeddedPattern>> {
    let namespace = namespace.map(str::to_owned);
    let model     = model.to_owned();

    let raws: Vec<(RawPattern, RawEmbedding)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {PATTERN_COLUMNS},
                  e.embedding_id, e.pattern_id, e.model, e.dims, e.vector, e.created_at
           FROM patterns p
           JOIN pattern_embeddings e ON e.pattern_id = p.pattern_id
           WHERE e.model = ?2
             AND (?1 IS NULL OR p.namespace = ?1)
           {CANONICAL_ORDER}"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![namespace, model], |row| {
            Ok((RawPattern::from_row(row)?, RawEmbedding::from_row(row, 9)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|(p, e)| {
        Ok(EmbeddedPattern { pattern: p.into_pattern()?, embedding: e.into_embedding()? })
      })
      .collect()
  }

  // ── Trajectories ──────────────────────────────────────────────────────────

  async fn record_trajectory(&self, input: NewTrajectory) -> Result<Option<Trajectory>> {
    let traj_id_str = encode_uuid(Uuid::new_v4());
    let pid_str     = encode_uuid(input.pattern_id);
    let at_str      = encode_dt(now());
    let task        = input.task;
    let success     = input.success;

    let raw = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let namespace: Option<String> = tx
          .query_row(
            "SELECT namespace FROM patterns WHERE pattern_id = ?1",
            rusqlite::params![pid_str],
            |r| r.get(0),
          )
          .optional()?;
        let Some(namespace) = namespace else {
          return Ok(None);
        };

        tx.execute(
          "INSERT INTO task_trajectories
             (trajectory_id, pattern_id, namespace, task, success, recorded_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          rusqlite::params![traj_id_str, pid_str, namespace, task, success, at_str],
        )?;
        tx.execute(
          "UPDATE patterns
           SET usage_count = usage_count + 1,
               updated_at  = max(updated_at, ?2)
           WHERE pattern_id = ?1",
          rusqlite::params![pid_str, at_str],
        )?;
        tx.commit()?;

        Ok(Some(RawTrajectory {
          trajectory_id: traj_id_str,
          pattern_id: pid_str,
          namespace,
          task,
          success,
          recorded_at: at_str,
        }))
      })
      .await?;

    raw.map(RawTrajectory::into_trajectory).transpose()
  }

  async fn trajectories_since<'a>(
    &'a self,
    namespace: &'a str,
    since: DateTime<Utc>,
  ) -> Result<Vec<Trajectory>> {
    let namespace = namespace.to_owned();
    let since_str = encode_dt(since);

    let raws: Vec<RawTrajectory> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT trajectory_id, pattern_id, namespace, task, success, recorded_at
           FROM task_trajectories
           WHERE namespace = ?1 AND recorded_at >= ?2
           ORDER BY recorded_at, trajectory_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![namespace, since_str], |row| {
            Ok(RawTrajectory {
              trajectory_id: row.get(0)?,
              pattern_id:    row.get(1)?,
              namespace:     row.get(2)?,
              task:          row.get(3)?,
              success:       row.get(4)?,
              recorded_at:   row.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawTrajectory::into_trajectory).collect()
  }

  // ── Skills ────────────────────────────────────────────────────────────────

  async fn upsert_skill(&self, draft: SkillDraft) -> Result<(Skill, UpsertOutcome)> {
    draft.validate()?;
    let at_str = encode_dt(now());

    let (raw, outcome) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let existing = select_skills(&tx, Some(draft.namespace.as_str()), Some(draft.name.as_str()))?
          .into_iter()
          .next();

        let outcome = match existing {
          None => {
            let skill_id = encode_uuid(Uuid::new_v4());
            tx.execute(
              "INSERT INTO skills
                 (skill_id, namespace, name, avg_reward, usage_count, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
              rusqlite::params![
                skill_id,
                draft.namespace,
                draft.name,
                draft.avg_reward,
                to_i64(draft.usage_count),
                at_str,
              ],
            )?;
            replace_links(&tx, &skill_id, &draft.source_pattern_ids)?;
            UpsertOutcome::Created
          }
          Some(raw) => {
            let skill_id = raw.skill_id.clone();
            let current = raw.into_skill().map_err(to_call_error)?;
            if draft.differs_from(&current) {
              tx.execute(
                "UPDATE skills
                 SET avg_reward = ?2, usage_count = ?3, updated_at = max(updated_at, ?4)
                 WHERE skill_id = ?1",
                rusqlite::params![
                  skill_id,
                  draft.avg_reward,
                  to_i64(draft.usage_count),
                  at_str,
                ],
              )?;
              replace_links(&tx, &skill_id, &draft.source_pattern_ids)?;
              UpsertOutcome::Updated
            } else {
              UpsertOutcome::Unchanged
            }
          }
        };

        let raw = select_skills(&tx, Some(draft.namespace.as_str()), Some(draft.name.as_str()))?
          .into_iter()
          .next()
          .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;
        Ok((raw, outcome))
      })
      .await?;

    Ok((raw.into_skill()?, outcome))
  }

  async fn list_skills<'a>(&'a self, namespace: Option<&'a str>) -> Result<Vec<Skill>> {
    let namespace = namespace.map(str::to_owned);

    let raws = self
      .conn
      .call(move |conn| Ok(select_skills(conn, namespace.as_deref(), None)?))
      .await?;

    raws.into_iter().map(RawSkill::into_skill).collect()
  }

  // ── Housekeeping ──────────────────────────────────────────────────────────

  async fn namespaces(&self) -> Result<Vec<String>> {
    let names = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare("SELECT DISTINCT namespace FROM patterns ORDER BY namespace")?;
        let rows = stmt
          .query_map([], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(names)
  }

  async fn stats<'a>(&'a self, namespace: Option<&'a str>) -> Result<Stats> {
    let namespace = namespace.map(str::to_owned);

    let (count, avg_confidence, embedding_count, skill_count) = self
      .conn
      .call(move |conn| {
        let (count, avg): (i64, f64) = conn.query_row(
          "SELECT COUNT(*), COALESCE(AVG(confidence), 0.0)
           FROM patterns WHERE (?1 IS NULL OR namespace = ?1)",
          rusqlite::params![namespace],
          |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let embeddings: i64 = conn.query_row(
          "SELECT COUNT(*)
           FROM pattern_embeddings e JOIN patterns p ON p.pattern_id = e.pattern_id
           WHERE (?1 IS NULL OR p.namespace = ?1)",
          rusqlite::params![namespace],
          |r| r.get(0),
        )?;
        let skills: i64 = conn.query_row(
          "SELECT COUNT(*) FROM skills WHERE (?1 IS NULL OR namespace = ?1)",
          rusqlite::params![namespace],
          |r| r.get(0),
        )?;
        Ok((count, avg, embeddings, skills))
      })
      .await?;

    Ok(Stats {
      count: decode_count(count)?,
      avg_confidence,
      embedding_count: decode_count(embedding_count)?,
      skill_count: decode_count(skill_count)?,
    })
  }

  async fn close(&self) -> Result<()> {
    // Every clone shares one database thread; whichever clone closes first
    // wins and the rest observe `ConnectionClosed`.
    match self.conn.clone().close().await {
      Ok(()) | Err(tokio_rusqlite::Error::ConnectionClosed) => Ok(()),
      Err(e) => Err(e.into()),
    }
  }
}
