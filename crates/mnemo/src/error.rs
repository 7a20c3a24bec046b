//! Error type for the `mnemo` engine.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  /// Input confidence outside `[0, 1]`. Rejected before anything is written.
  #[error("confidence {0} is outside [0, 1]")]
  InvalidConfidence(f64),

  #[error("pattern not found: {0}")]
  NotFound(Uuid),

  /// The embedding provider is down, errored, or not configured. Recovered
  /// by lexical fallback; never returned from `query`.
  #[error("embedding unavailable: {0}")]
  EmbeddingUnavailable(String),

  /// Semantic search lost the race against its deadline. Recovered like
  /// [`Error::EmbeddingUnavailable`].
  #[error("semantic search timed out after {0:?}")]
  SemanticTimeout(Duration),

  /// Durable storage failed. Always surfaced, never retried.
  #[error("storage error: {0}")]
  Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("config error: {0}")]
  Config(#[from] config::ConfigError),

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("pattern memory has been shut down")]
  ShutDown,
}

impl Error {
  pub fn storage(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Storage(Box::new(e))
  }

  /// Whether the error came from the semantic path and should trigger
  /// lexical fallback.
  pub fn is_semantic(&self) -> bool {
    matches!(self, Self::EmbeddingUnavailable(_) | Self::SemanticTimeout(_))
  }
}

impl From<mnemo_core::Error> for Error {
  fn from(e: mnemo_core::Error) -> Self {
    match e {
      mnemo_core::Error::InvalidConfidence(v) => Self::InvalidConfidence(v),
      other => Self::storage(other),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
