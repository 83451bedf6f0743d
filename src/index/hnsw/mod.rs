//! HNSW index: graph, shadow maps, and tombstoning.
//!
//! [`HnswIndex`] wraps the arena [`graph`] with the bookkeeping the engine
//! needs: a bidirectional `id <-> node` shadow map used for dedup checks,
//! presence filtering, and logical removal. `remove` only deletes the
//! shadow-map entries; the graph node and its edges stay in place and are
//! filtered out of results at return time. A rebuild is the recovery path
//! for accumulated tombstones.

mod graph;
mod layer;
mod ordered_float;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use self::graph::Graph;
use self::layer::NodeId;
use super::VectorIndex;
use crate::error::{Error, Result};
use crate::vectormath;

/// Max out-edges per node on upper layers.
const M: usize = 16;
/// Candidate-list width during insertion.
const EF_CONSTRUCTION: usize = 200;
/// Default search expansion factor.
pub(crate) const DEFAULT_EF_SEARCH: usize = 50;
/// Clamp bounds for `ef_search`.
const EF_SEARCH_MIN: usize = 1;
const EF_SEARCH_MAX: usize = 1000;

/// Cosine distance as a total function: any computation error (dimension
/// mismatch, zero vector) maps to the maximum distance so the graph never
/// sees NaN.
fn guarded_cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    vectormath::cosine_distance(a, b).unwrap_or(2.0)
}

/// One search hit from the index: an id with its exact cosine distance
/// and similarity score.
#[derive(Debug, Clone)]
pub struct IndexHit {
    /// External vector id.
    pub id: String,
    /// Cosine distance to the query, in `[0, 2]`.
    pub distance: f32,
    /// Similarity score, `1 - distance`.
    pub score: f32,
}

/// Index statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IndexStats {
    /// Nodes in the graph, tombstones included.
    pub vectors: usize,
    /// Live (non-tombstoned) entries.
    pub active: usize,
    /// Configured vector dimension.
    pub dimensions: usize,
    /// Current search expansion factor.
    pub ef_search: usize,
    /// Highest occupied graph layer.
    pub levels: usize,
}

struct HnswInner {
    graph: Graph,
    /// Shadow map: external id -> graph node.
    id_to_node: FxHashMap<String, NodeId>,
    /// Reverse map for filtering search results.
    node_to_id: FxHashMap<NodeId, String>,
    ef_search: usize,
}

/// In-memory approximate k-NN index over `id -> embedding`.
///
/// All operations serialize behind one internal reader-writer lock:
/// `add`/`remove`/`set_search_ef` exclusive, `search`/`stats` shared.
pub struct HnswIndex {
    inner: RwLock<HnswInner>,
    dimensions: usize,
    seed: u64,
}

impl HnswIndex {
    /// Creates an empty index for embeddings of the given dimension.
    #[must_use]
    pub fn new(dimensions: usize, seed: u64) -> Self {
        Self {
            inner: RwLock::new(HnswInner {
                graph: Graph::new(guarded_cosine_distance, M, EF_CONSTRUCTION, seed),
                id_to_node: FxHashMap::default(),
                node_to_id: FxHashMap::default(),
                ef_search: DEFAULT_EF_SEARCH,
            }),
            dimensions,
            seed,
        }
    }

    /// Live (non-tombstoned) entry count.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.inner.read().id_to_node.len()
    }

    /// Number of graph nodes whose ids have been removed.
    ///
    /// Tombstones still cost traversal time; a high count is the signal to
    /// rebuild.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        let inner = self.inner.read();
        inner.graph.len().saturating_sub(inner.id_to_node.len())
    }

    /// Sets the search expansion factor, clamped to `[1, 1000]`.
    pub fn set_search_ef(&self, ef: usize) {
        let ef = ef.clamp(EF_SEARCH_MIN, EF_SEARCH_MAX);
        self.inner.write().ef_search = ef;
        info!(ef_search = ef, "Updated search effort");
    }

    /// Current search expansion factor.
    #[must_use]
    pub fn search_ef(&self) -> usize {
        self.inner.read().ef_search
    }

    /// Returns true if `id` is live in the index.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().id_to_node.contains_key(id)
    }

    /// Discards the graph and shadow maps, keeping configuration.
    ///
    /// Used by the engine's rebuild path to clear tombstones before
    /// re-indexing from storage.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.graph = Graph::new(guarded_cosine_distance, M, EF_CONSTRUCTION, self.seed);
        inner.id_to_node = FxHashMap::default();
        inner.node_to_id = FxHashMap::default();
    }
}

impl VectorIndex for HnswIndex {
    fn add(&self, id: &str, embedding: &[f32]) -> Result<()> {
        let mut inner = self.inner.write();

        if embedding.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }

        if inner.id_to_node.contains_key(id) {
            debug!(id, "Vector already in index, skipping");
            return Ok(());
        }

        let node = inner.graph.insert(embedding.to_vec());
        inner.id_to_node.insert(id.to_string(), node);
        inner.node_to_id.insert(node, id.to_string());

        debug!(id, total_vectors = inner.id_to_node.len(), "Inserted vector into index");
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        let inner = self.inner.read();

        if query.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }

        if inner.id_to_node.is_empty() {
            return Ok(Vec::new());
        }

        let k = k.min(inner.id_to_node.len());
        let ef = k.max(inner.ef_search);
        let candidates = inner.graph.search(query, ef);

        // Tombstone filter, then exact re-scoring: the graph's guarded
        // distance is what routed the traversal, the returned numbers are
        // recomputed from the stored embeddings.
        let mut hits: Vec<IndexHit> = candidates
            .into_iter()
            .filter_map(|(node, _)| {
                let id = inner.node_to_id.get(&node)?;
                let distance = vectormath::cosine_distance(query, inner.graph.vector(node))
                    .unwrap_or(2.0);
                Some(IndexHit {
                    id: id.clone(),
                    distance,
                    score: 1.0 - distance,
                })
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);

        debug!(results = hits.len(), requested_k = k, "Search completed");
        Ok(hits)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();

        let Some(node) = inner.id_to_node.remove(id) else {
            return Err(Error::VectorNotFound(id.to_string()));
        };
        inner.node_to_id.remove(&node);

        warn!(id, "Removed from tracking (node remains in graph until rebuild)");
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.read().graph.len()
    }

    fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        IndexStats {
            vectors: inner.graph.len(),
            active: inner.id_to_node.len(),
            dimensions: self.dimensions,
            ef_search: inner.ef_search,
            levels: inner.graph.top_layer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index3() -> HnswIndex {
        HnswIndex::new(3, 42)
    }

    #[test]
    fn test_add_and_search() {
        let index = index3();
        index.add("x", &[1.0, 0.0, 0.0]).unwrap();
        index.add("y", &[0.0, 1.0, 0.0]).unwrap();
        index.add("z", &[0.0, 0.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "x");
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert!(hits[1].score.abs() < 1e-5);
    }

    #[test]
    fn test_add_rejects_wrong_dimension() {
        let index = index3();
        assert!(matches!(
            index.add("bad", &[1.0, 0.0]),
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_add_is_idempotent() {
        let index = index3();
        index.add("x", &[1.0, 0.0, 0.0]).unwrap();
        index.add("x", &[0.0, 1.0, 0.0]).unwrap(); // ignored

        assert_eq!(index.len(), 1);
        let hits = index.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_search_empty_index() {
        let index = index3();
        assert!(index.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_search_clamps_k() {
        let index = index3();
        index.add("x", &[1.0, 0.0, 0.0]).unwrap();
        let hits = index.search(&[1.0, 0.0, 0.0], 100).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_remove_tombstones() {
        let index = index3();
        index.add("x", &[1.0, 0.0, 0.0]).unwrap();
        index.add("y", &[0.9, 0.1, 0.0]).unwrap();

        index.remove("x").unwrap();

        // Node stays in the graph but never surfaces in results.
        assert_eq!(index.len(), 2);
        assert_eq!(index.active_len(), 1);
        assert_eq!(index.tombstone_count(), 1);

        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert!(hits.iter().all(|h| h.id != "x"));
    }

    #[test]
    fn test_remove_missing_errors() {
        let index = index3();
        assert!(matches!(
            index.remove("ghost"),
            Err(Error::VectorNotFound(_))
        ));
    }

    #[test]
    fn test_ef_search_clamped() {
        let index = index3();
        index.set_search_ef(0);
        assert_eq!(index.search_ef(), 1);
        index.set_search_ef(5000);
        assert_eq!(index.search_ef(), 1000);
        index.set_search_ef(200);
        assert_eq!(index.search_ef(), 200);
    }

    #[test]
    fn test_reset_clears_tombstones() {
        let index = index3();
        index.add("x", &[1.0, 0.0, 0.0]).unwrap();
        index.remove("x").unwrap();
        assert_eq!(index.tombstone_count(), 1);

        index.reset();
        assert_eq!(index.len(), 0);
        assert_eq!(index.tombstone_count(), 0);

        index.add("x", &[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.active_len(), 1);
    }

    #[test]
    fn test_stats() {
        let index = index3();
        index.add("x", &[1.0, 0.0, 0.0]).unwrap();
        index.add("y", &[0.0, 1.0, 0.0]).unwrap();
        index.remove("y").unwrap();

        let stats = index.stats();
        assert_eq!(stats.vectors, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.dimensions, 3);
        assert_eq!(stats.ef_search, DEFAULT_EF_SEARCH);
    }

    #[test]
    fn test_zero_vector_never_panics() {
        let index = index3();
        index.add("zero", &[0.0, 0.0, 0.0]).unwrap();
        index.add("x", &[1.0, 0.0, 0.0]).unwrap();

        // Guarded distance keeps the zero vector at the far end rather
        // than poisoning the heap with NaN.
        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].id, "x");
        if let Some(zero_hit) = hits.iter().find(|h| h.id == "zero") {
            assert!((zero_hit.distance - 2.0).abs() < 1e-6);
        }
    }
}
