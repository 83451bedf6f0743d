//! Error types for `QuiverDB`.
//!
//! This module provides a unified error type for all `QuiverDB` operations.
//! Error codes follow the pattern `QVR-NNN` for easy debugging.

use thiserror::Error;

use crate::pool::PoolError;

/// Result type alias for `QuiverDB` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in `QuiverDB` operations.
///
/// Each variant includes a descriptive error message suitable for end-users.
#[derive(Error, Debug)]
pub enum Error {
    /// Vector dimension mismatch between two operands (QVR-001).
    #[error("[QVR-001] Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Vector has zero magnitude (QVR-002).
    ///
    /// Cosine similarity is undefined for zero-norm vectors.
    #[error("[QVR-002] Vector has zero magnitude")]
    ZeroVector,

    /// Embedding does not match the configured dimensions (QVR-003).
    #[error("[QVR-003] Invalid vector dimensions: expected {expected}, got {actual}")]
    InvalidDimensions {
        /// Configured dimension.
        expected: usize,
        /// Dimension of the offending embedding.
        actual: usize,
    },

    /// Engine is already running (QVR-004).
    #[error("[QVR-004] Engine is already running")]
    AlreadyRunning,

    /// Engine is not running (QVR-005).
    #[error("[QVR-005] Engine is not running")]
    NotRunning,

    /// Vector not found (QVR-006).
    #[error("[QVR-006] Vector '{0}' not found")]
    VectorNotFound(String),

    /// Serialization error (QVR-007).
    #[error("[QVR-007] Serialization error: {0}")]
    Serialization(String),

    /// IO error (QVR-008).
    #[error("[QVR-008] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store has been closed (QVR-009).
    #[error("[QVR-009] Vector store is closed")]
    StoreClosed,

    /// A batched write failed (QVR-010).
    ///
    /// `batch_start` is the index of the first vector in the failed chunk.
    #[error("[QVR-010] Batch write failed at index {batch_start}: {source}")]
    BatchWriteFailed {
        /// Index of the first vector in the failed chunk.
        batch_start: usize,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Index error (QVR-011).
    #[error("[QVR-011] Index error: {0}")]
    Index(String),

    /// Configuration error (QVR-012).
    #[error("[QVR-012] Configuration error: {0}")]
    Config(String),

    /// Block pool error (QVR-013).
    #[error("[QVR-013] Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Internal error (QVR-014).
    ///
    /// Indicates an unexpected internal error. Please report if encountered.
    #[error("[QVR-014] Internal error: {0}")]
    Internal(String),

    /// Operation cancelled (QVR-015).
    #[error("[QVR-015] Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Returns the error code (e.g., "QVR-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "QVR-001",
            Self::ZeroVector => "QVR-002",
            Self::InvalidDimensions { .. } => "QVR-003",
            Self::AlreadyRunning => "QVR-004",
            Self::NotRunning => "QVR-005",
            Self::VectorNotFound(_) => "QVR-006",
            Self::Serialization(_) => "QVR-007",
            Self::Io(_) => "QVR-008",
            Self::StoreClosed => "QVR-009",
            Self::BatchWriteFailed { .. } => "QVR-010",
            Self::Index(_) => "QVR-011",
            Self::Config(_) => "QVR-012",
            Self::Pool(_) => "QVR-013",
            Self::Internal(_) => "QVR-014",
            Self::Cancelled => "QVR-015",
        }
    }

    /// Returns true if this error is recoverable.
    ///
    /// Non-recoverable errors include internal errors and a closed store.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Internal(_) | Self::StoreClosed)
    }
}
