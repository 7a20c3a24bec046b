//! Core types and trait definitions for the Mnemo pattern memory.
//!
//! This crate is deliberately free of runtime and database dependencies.
//! The storage backends and the query engine depend on it; it depends on
//! nothing but plain data crates.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod embedding;
pub mod error;
pub mod pattern;
pub mod skill;
pub mod store;
pub mod trajectory;

pub use error::{Error, Result};
