//! Approximate nearest-neighbor indexing.
//!
//! The engine talks to its index through the [`VectorIndex`] trait; the
//! only implementation is the HNSW graph in [`hnsw`].

pub mod hnsw;

pub use hnsw::{HnswIndex, IndexHit, IndexStats};

use crate::error::Result;

/// Seam between the engine and an approximate k-NN index.
///
/// Implementations synchronize internally: mutations are exclusive,
/// searches may run concurrently with each other.
pub trait VectorIndex: Send + Sync {
    /// Adds an embedding under `id`. Re-adding an existing id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding dimension does not match.
    fn add(&self, id: &str, embedding: &[f32]) -> Result<()>;

    /// Approximate k-nearest-neighbor search.
    ///
    /// # Errors
    ///
    /// Returns an error if the query dimension does not match.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>>;

    /// Logically removes `id`: the graph node stays, but the id is
    /// filtered from all future results.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not present.
    fn remove(&self, id: &str) -> Result<()>;

    /// Number of nodes in the graph, tombstones included.
    fn len(&self) -> usize;

    /// Returns true if the graph holds no nodes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index statistics.
    fn stats(&self) -> IndexStats;
}
