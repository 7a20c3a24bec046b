//! Mnemo: a namespaced pattern memory with bounded-latency hybrid retrieval.
//!
//! [`PatternMemory`] sits over any [`PatternStore`](mnemo_core::store::PatternStore)
//! and answers queries semantically when an embedding provider is configured
//! and responsive, and lexically otherwise. Results are cached with TTLs whose
//! timers all belong to one registry, so [`PatternMemory::shutdown`] leaves
//! nothing running.
//!
//! ```text
//! PatternMemory ─┬─ QueryCoordinator ─┬─ SemanticBackend (EmbeddingIndex | NoSemantic)
//!                │                    ├─ lexical fallback (PatternStore::search_lexical)
//!                │                    └─ query cache (TtlCache)
//!                ├─ Consolidator
//!                └─ Lifecycle ─ TimerRegistry
//! ```

#![allow(async_fn_in_trait)]

pub mod cache;
pub mod config;
pub mod consolidation;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod ranking;
pub mod semantic;
pub mod timer;

pub use crate::config::MemoryConfig;
pub use consolidation::{ConsolidateRequest, ConsolidationReport};
pub use coordinator::{FallbackReason, MatchedVia, Query, QueryOutcome, QueryResult};
pub use error::{Error, Result};
pub use lifecycle::ShutdownReport;
pub use memory::PatternMemory;
pub use semantic::{EmbeddingProvider, NoSemantic, ProviderError, SemanticBackend};

#[cfg(test)]
mod tests;
