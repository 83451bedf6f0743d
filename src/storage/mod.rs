//! Durable storage for vector records.
//!
//! This module contains the log-structured vector store: an append-only
//! record log with an in-memory offset index, live-record compaction, and a
//! background maintenance loop that reclaims space from overwritten and
//! deleted records.
//!
//! # Public Types
//!
//! - [`VectorStore`]: the durable `id -> Vector` map
//! - [`StoreOptions`]: tuning knobs (maintenance cadence and thresholds)
//! - [`StoreStats`]: size and liveness counters

mod compaction;
mod maintenance;
mod store;

pub use store::{StoreOptions, StoreStats, VectorStore};
