//! # `QuiverDB`
//!
//! Embedded vector database engine written in Rust.
//!
//! `QuiverDB` stores `f32` embeddings keyed by string identifiers together
//! with opaque JSON metadata, persists them in a durable log-structured
//! store, and answers approximate k-nearest-neighbor queries under cosine
//! distance through an in-memory HNSW index.
//!
//! ## Features
//!
//! - **Approximate k-NN**: native HNSW graph with tunable `ef_search`
//! - **Durable Storage**: append-only record log with background compaction
//! - **Crash Recovery**: the log is replayed on open; the index snapshot is
//!   an optimization, never the source of truth
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quiverdb::{CancelToken, Config, Engine, SearchParams, Vector};
//!
//! let mut config = Config::default();
//! config.index.dimensions = 768;
//! config.storage.data_dir = "./data".into();
//!
//! let engine = Engine::new(config)?;
//! engine.start(&CancelToken::new())?;
//!
//! engine.insert(Vector::new("doc-1", vec![0.1; 768]))?;
//!
//! let results = engine.search(&query, SearchParams::default())?;
//! engine.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod pool;
pub mod storage;
pub mod vector;
pub mod vectormath;

pub use config::Config;
pub use engine::{CancelToken, Engine, EngineStats};
pub use error::{Error, Result};
pub use index::{HnswIndex, IndexStats, VectorIndex};
pub use storage::VectorStore;
pub use vector::{SearchParams, SearchResult, Vector};
