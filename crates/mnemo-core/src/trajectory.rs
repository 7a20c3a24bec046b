//! Task trajectories: an append-only audit trail of which pattern was used
//! for which task, and whether it worked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
  pub trajectory_id: Uuid,
  pub pattern_id:    Uuid,
  /// Copied from the pattern so window scans need no join.
  pub namespace:     String,
  pub task:          String,
  pub success:       bool,
  pub recorded_at:   DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTrajectory {
  pub pattern_id: Uuid,
  pub task:       String,
  pub success:    bool,
}
