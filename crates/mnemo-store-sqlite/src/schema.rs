//! SQL schema for the Mnemo SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
///
/// Timestamps are fixed-width RFC 3339 strings (microseconds, `Z`), so
/// string comparison in SQL matches chronological order.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous  = FULL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS patterns (
    pattern_id  TEXT PRIMARY KEY,
    namespace   TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    confidence  REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    CHECK (updated_at >= created_at)
);

-- 1:1 with patterns; removed with the pattern.
CREATE TABLE IF NOT EXISTS pattern_embeddings (
    embedding_id TEXT PRIMARY KEY,
    pattern_id   TEXT NOT NULL UNIQUE REFERENCES patterns(pattern_id) ON DELETE CASCADE,
    model        TEXT NOT NULL,
    dims         INTEGER NOT NULL CHECK (dims > 0),
    vector       BLOB NOT NULL,  -- little-endian f32 x dims
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS skills (
    skill_id    TEXT PRIMARY KEY,
    namespace   TEXT NOT NULL,
    name        TEXT NOT NULL,
    avg_reward  REAL NOT NULL CHECK (avg_reward >= 0.0 AND avg_reward <= 1.0),
    usage_count INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE (namespace, name)
);

-- Skill <-> pattern membership.
CREATE TABLE IF NOT EXISTS pattern_links (
    skill_id   TEXT NOT NULL REFERENCES skills(skill_id)     ON DELETE CASCADE,
    pattern_id TEXT NOT NULL REFERENCES patterns(pattern_id) ON DELETE CASCADE,
    PRIMARY KEY (skill_id, pattern_id)
);

-- Append-only audit of pattern use.
CREATE TABLE IF NOT EXISTS task_trajectories (
    trajectory_id TEXT PRIMARY KEY,
    pattern_id    TEXT NOT NULL REFERENCES patterns(pattern_id) ON DELETE CASCADE,
    namespace     TEXT NOT NULL,
    task          TEXT NOT NULL,
    success       INTEGER NOT NULL CHECK (success IN (0, 1)),
    recorded_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS patterns_rank_idx
    ON patterns(namespace, confidence DESC, usage_count DESC);
CREATE INDEX IF NOT EXISTS embeddings_model_idx   ON pattern_embeddings(model);
CREATE INDEX IF NOT EXISTS links_pattern_idx      ON pattern_links(pattern_id);
CREATE INDEX IF NOT EXISTS trajectories_window_idx
    ON task_trajectories(namespace, recorded_at);

PRAGMA user_version = 1;
";
