//! # Memory Harness Core
//!
//! Shared, runtime-free logic for Memory Harness: data models, chunking,
//! the vector store abstraction, ranking and context-budget selection,
//! conversation grouping, and the embedding trait.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Everything that touches disk, the network,
//! or a clock lives in the `memory-harness` app crate.

pub mod chunk;
pub mod consolidate;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieve;
pub mod store;

pub use error::MemoryError;
