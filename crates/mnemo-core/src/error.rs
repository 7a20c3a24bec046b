//! Error types for `mnemo-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("confidence {0} is outside [0, 1]")]
  InvalidConfidence(f64),

  #[error("embedding has {actual} dimensions, expected {expected}")]
  DimensionMismatch { expected: usize, actual: usize },

  #[error("a skill needs at least one source pattern")]
  EmptySkill,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
