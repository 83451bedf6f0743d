//! Vector record and search types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Opaque metadata attached to a vector.
///
/// Persisted and returned verbatim; the engine and index never interpret it.
pub type Metadata = Map<String, JsonValue>;

/// A vector record in the database.
///
/// A record consists of:
/// - A unique string identifier (the primary key)
/// - An embedding of the globally configured dimension
/// - Optional opaque metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    /// Unique identifier for the vector.
    pub id: String,

    /// The embedding.
    pub embedding: Vec<f32>,

    /// Optional metadata, stored and returned verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Vector {
    /// Creates a new vector without metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            embedding,
            metadata: None,
        }
    }

    /// Creates a new vector with metadata.
    #[must_use]
    pub fn with_metadata(
        id: impl Into<String>,
        embedding: Vec<f32>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: id.into(),
            embedding,
            metadata: Some(metadata),
        }
    }

    /// Returns the dimension of the embedding.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// A search result: the matching vector with its distance and score.
///
/// `score = 1 - distance`, where distance is cosine distance in `[0, 2]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matching vector. Embedding and metadata may be stripped
    /// depending on the [`SearchParams`] flags.
    pub vector: Vector,

    /// Cosine distance to the query, in `[0, 2]`.
    pub distance: f32,

    /// Similarity score, `1 - distance`.
    pub score: f32,
}

/// Parameters controlling a k-nearest-neighbor search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of results to return.
    pub k: usize,

    /// Minimum score a result must reach to be returned.
    pub threshold: f32,

    /// Include embeddings in results.
    pub include_vecs: bool,

    /// Include metadata in results.
    pub include_meta: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            k: 10,
            threshold: 0.0,
            include_vecs: true,
            include_meta: true,
        }
    }
}
