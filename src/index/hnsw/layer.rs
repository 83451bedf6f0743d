//! A single layer in the HNSW hierarchy.

/// Unique identifier for a node in the graph.
pub type NodeId = usize;

/// A single layer holding per-node adjacency lists.
///
/// Synchronization happens one level up, behind the index lock, so the
/// lists are plain vectors.
#[derive(Debug, Default)]
pub(super) struct Layer {
    /// Adjacency list: `node_id -> neighbor node_ids`.
    neighbors: Vec<Vec<NodeId>>,
}

impl Layer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            neighbors: Vec::with_capacity(capacity),
        }
    }

    /// Grows the adjacency table to cover `node_id`.
    pub fn ensure_node(&mut self, node_id: NodeId) {
        if self.neighbors.len() <= node_id {
            self.neighbors.resize_with(node_id + 1, Vec::new);
        }
    }

    /// Neighbors of a node. Unknown nodes have none.
    pub fn neighbors(&self, node_id: NodeId) -> &[NodeId] {
        self.neighbors.get(node_id).map_or(&[], Vec::as_slice)
    }

    /// Replaces the adjacency list of a node.
    pub fn set_neighbors(&mut self, node_id: NodeId, neighbors: Vec<NodeId>) {
        self.ensure_node(node_id);
        self.neighbors[node_id] = neighbors;
    }

    /// Appends one neighbor to a node's adjacency list.
    pub fn add_neighbor(&mut self, node_id: NodeId, neighbor: NodeId) {
        self.ensure_node(node_id);
        self.neighbors[node_id].push(neighbor);
    }
}
