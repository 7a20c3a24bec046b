//! Embedding rows. Vectors are produced by an external provider; this crate
//! only carries them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result, pattern::Pattern};

/// A fixed-length vector attached 1:1 to a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
  pub embedding_id: Uuid,
  pub pattern_id:   Uuid,
  /// Identifier of the model that produced `vector`.
  pub model:        String,
  /// Length of `vector`; equal for every row sharing a `model`.
  pub dims:         usize,
  pub vector:       Vec<f32>,
  pub created_at:   DateTime<Utc>,
}

impl Embedding {
  /// Build an embedding for `pattern_id`, checking the vector against the
  /// model's declared dimensionality.
  pub fn new(
    pattern_id: Uuid,
    model: impl Into<String>,
    dims: usize,
    vector: Vec<f32>,
  ) -> Result<Self> {
    if vector.len() != dims {
      return Err(Error::DimensionMismatch { expected: dims, actual: vector.len() });
    }
    Ok(Self {
      embedding_id: Uuid::new_v4(),
      pattern_id,
      model: model.into(),
      dims,
      vector,
      created_at: Utc::now(),
    })
  }
}

/// A pattern bundled with its embedding, as read by semantic search.
#[derive(Debug, Clone)]
pub struct EmbeddedPattern {
  pub pattern:   Pattern,
  pub embedding: Embedding,
}

/// Encode a vector as little-endian `f32` bytes for blob storage.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
  vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vector_to_bytes`]. Returns `None` if the length is not a
/// multiple of four.
pub fn vector_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
  if bytes.len() % 4 != 0 {
    return None;
  }
  Some(
    bytes
      .chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_rejects_wrong_dimensions() {
    let err = Embedding::new(Uuid::new_v4(), "m", 3, vec![0.1, 0.2]).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
  }

  #[test]
  fn bytes_roundtrip_preserves_values() {
    let v = vec![0.0, -1.5, 3.25, f32::MIN_POSITIVE];
    assert_eq!(vector_from_bytes(&vector_to_bytes(&v)).unwrap(), v);
    assert!(vector_from_bytes(&[1, 2, 3]).is_none());
  }
}
