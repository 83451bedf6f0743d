//! HNSW graph structure.
//!
//! Implements the hierarchical navigable small world graph described by
//! Malkov & Yashunin: a stack of proximity graphs where upper layers are
//! progressively sparser and layer 0 contains every node.
//!
//! Nodes live in an arena: embeddings are stored in a dense vector keyed
//! by `NodeId`, and edges are `NodeId` adjacency lists per layer. The
//! graph itself knows nothing about external string ids or deletions; the
//! wrapper in [`super`] layers both on top.

use rustc_hash::FxHashSet;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::layer::{Layer, NodeId};
use super::ordered_float::OrderedFloat;

/// Distance callback: total over all inputs, never NaN, in `[0, 2]`.
pub(super) type DistanceFn = fn(&[f32], &[f32]) -> f32;

/// Hard cap on layer height; a geometric draw above this is clamped.
const MAX_LEVEL: usize = 15;

/// Arena-backed HNSW graph.
pub(super) struct Graph {
    /// Distance callback.
    distance: DistanceFn,
    /// Node embeddings, indexed by `NodeId`.
    vectors: Vec<Vec<f32>>,
    /// Hierarchy; index 0 is the dense bottom layer.
    layers: Vec<Layer>,
    /// Entry point for descent (a node on the top layer).
    entry_point: Option<NodeId>,
    /// Highest occupied layer.
    top_layer: usize,
    /// xorshift64 state for level draws.
    rng_state: u64,
    /// Max out-edges per node on upper layers (M).
    max_connections: usize,
    /// Max out-edges on layer 0 (2M).
    max_connections_0: usize,
    /// Candidate-list width during insertion.
    ef_construction: usize,
    /// Level multiplier, `1 / ln(M)`.
    level_mult: f64,
}

impl Graph {
    pub fn new(distance: DistanceFn, max_connections: usize, ef_construction: usize, seed: u64) -> Self {
        Self {
            distance,
            vectors: Vec::new(),
            layers: vec![Layer::default()],
            entry_point: None,
            top_layer: 0,
            // A zero seed would freeze xorshift; displace it.
            rng_state: seed | 1,
            max_connections,
            max_connections_0: max_connections * 2,
            ef_construction,
            level_mult: 1.0 / (max_connections as f64).ln(),
        }
    }

    /// Number of nodes, tombstoned or not.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Highest occupied layer.
    pub fn top_layer(&self) -> usize {
        self.top_layer
    }

    /// Embedding stored for a node.
    pub fn vector(&self, node_id: NodeId) -> &[f32] {
        &self.vectors[node_id]
    }

    /// Inserts an embedding and wires it into every layer up to its drawn
    /// level. Returns the node id.
    pub fn insert(&mut self, embedding: Vec<f32>) -> NodeId {
        let node_id = self.vectors.len();
        let node_layer = self.random_level();

        // The searches below borrow the arena, so keep a local copy of the
        // new embedding for querying while it is being wired in.
        let query = embedding.clone();
        self.vectors.push(embedding);

        while self.layers.len() <= node_layer {
            self.layers.push(Layer::with_capacity(node_id + 1));
        }
        for layer in &mut self.layers {
            layer.ensure_node(node_id);
        }

        if let Some(entry) = self.entry_point {
            // Greedy descent through layers above the node's level.
            let mut current = entry;
            for layer_idx in (node_layer + 1..=self.top_layer).rev() {
                current = self.search_layer_single(&query, current, layer_idx);
            }

            // Wire the node in from its level down to layer 0.
            for layer_idx in (0..=node_layer.min(self.top_layer)).rev() {
                let candidates =
                    self.search_layer(&query, &[current], self.ef_construction, layer_idx);

                let max_conn = self.max_connections_at(layer_idx);
                let selected = self.select_neighbors(&candidates, max_conn);

                self.layers[layer_idx].set_neighbors(node_id, selected.clone());
                for &neighbor in &selected {
                    self.connect(node_id, neighbor, layer_idx, max_conn);
                }

                if let Some(&(closest, _)) = candidates.first() {
                    current = closest;
                }
            }
        }

        if self.entry_point.is_none() || node_layer > self.top_layer {
            self.top_layer = self.top_layer.max(node_layer);
            self.entry_point = Some(node_id);
        }

        node_id
    }

    /// Best-first search on layer 0 with a candidate list of width `ef`,
    /// after greedy descent through the upper layers.
    ///
    /// Returns `(node, distance)` pairs sorted ascending by distance.
    pub fn search(&self, query: &[f32], ef: usize) -> Vec<(NodeId, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };

        let mut current = entry;
        for layer_idx in (1..=self.top_layer).rev() {
            current = self.search_layer_single(query, current, layer_idx);
        }

        self.search_layer(query, &[current], ef, 0)
    }

    fn max_connections_at(&self, layer_idx: usize) -> usize {
        if layer_idx == 0 {
            self.max_connections_0
        } else {
            self.max_connections
        }
    }

    /// Draws a node level from the geometric distribution
    /// `floor(-ln(U(0,1)) / ln(M))`, clamped to [`MAX_LEVEL`].
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn random_level(&mut self) -> usize {
        // xorshift64
        let mut state = self.rng_state;
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng_state = state;

        let uniform = (state as f64) / (u64::MAX as f64);
        let level = (-uniform.ln() * self.level_mult).floor() as usize;
        level.min(MAX_LEVEL)
    }

    /// Greedy 1-nearest descent within one layer.
    fn search_layer_single(&self, query: &[f32], entry: NodeId, layer_idx: usize) -> NodeId {
        let mut best = entry;
        let mut best_dist = (self.distance)(query, self.vector(entry));

        loop {
            let mut improved = false;
            for &neighbor in self.layers[layer_idx].neighbors(best) {
                let dist = (self.distance)(query, self.vector(neighbor));
                if dist < best_dist {
                    best = neighbor;
                    best_dist = dist;
                    improved = true;
                }
            }
            if !improved {
                return best;
            }
        }
    }

    /// Best-first search within one layer, bounded by an `ef`-wide result
    /// set. Returns candidates sorted ascending by distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[NodeId],
        ef: usize,
        layer_idx: usize,
    ) -> Vec<(NodeId, f32)> {
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat, NodeId)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedFloat, NodeId)> = BinaryHeap::new();

        for &entry in entry_points {
            let dist = (self.distance)(query, self.vector(entry));
            candidates.push(Reverse((OrderedFloat(dist), entry)));
            results.push((OrderedFloat(dist), entry));
            visited.insert(entry);
        }

        while let Some(Reverse((OrderedFloat(dist), node))) = candidates.pop() {
            let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);
            if dist > furthest && results.len() >= ef {
                break;
            }

            for &neighbor in self.layers[layer_idx].neighbors(node) {
                if visited.insert(neighbor) {
                    let dist = (self.distance)(query, self.vector(neighbor));
                    let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);

                    if dist < furthest || results.len() < ef {
                        candidates.push(Reverse((OrderedFloat(dist), neighbor)));
                        results.push((OrderedFloat(dist), neighbor));

                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut sorted: Vec<(NodeId, f32)> =
            results.into_iter().map(|(d, n)| (n, d.0)).collect();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
        sorted
    }

    /// Heuristic neighbor selection preferring diverse directions.
    ///
    /// A candidate is kept when it is at least as close to the query as to
    /// every already-selected neighbor; remaining slots are backfilled with
    /// the closest rejected candidates.
    fn select_neighbors(
        &self,
        candidates: &[(NodeId, f32)],
        max_neighbors: usize,
    ) -> Vec<NodeId> {
        if candidates.len() <= max_neighbors {
            return candidates.iter().map(|&(id, _)| id).collect();
        }

        let mut selected: Vec<NodeId> = Vec::with_capacity(max_neighbors);

        for &(candidate, candidate_dist) in candidates {
            if selected.len() >= max_neighbors {
                break;
            }

            let diverse = selected.iter().all(|&kept| {
                let dist_to_kept =
                    (self.distance)(self.vector(candidate), self.vector(kept));
                candidate_dist <= dist_to_kept
            });

            if diverse || selected.is_empty() {
                selected.push(candidate);
            }
        }

        if selected.len() < max_neighbors {
            for &(candidate, _) in candidates {
                if selected.len() >= max_neighbors {
                    break;
                }
                if !selected.contains(&candidate) {
                    selected.push(candidate);
                }
            }
        }

        selected
    }

    /// Adds the back-edge `neighbor -> node`, pruning the neighbor's list
    /// back to `max_conn` closest when it overflows.
    fn connect(&mut self, node: NodeId, neighbor: NodeId, layer_idx: usize, max_conn: usize) {
        let current = self.layers[layer_idx].neighbors(neighbor);

        if current.len() < max_conn {
            self.layers[layer_idx].add_neighbor(neighbor, node);
            return;
        }

        let mut with_dist: Vec<(NodeId, f32)> = current
            .iter()
            .copied()
            .chain(std::iter::once(node))
            .map(|n| (n, (self.distance)(self.vector(neighbor), self.vector(n))))
            .collect();
        with_dist.sort_by(|a, b| a.1.total_cmp(&b.1));

        let pruned: Vec<NodeId> = with_dist.into_iter().take(max_conn).map(|(n, _)| n).collect();
        self.layers[layer_idx].set_neighbors(neighbor, pruned);
    }
}
