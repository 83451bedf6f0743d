//! The coordinating engine.
//!
//! Routes reads and writes between the durable [`VectorStore`] and the
//! in-memory [`HnswIndex`], maintaining one invariant throughout: the
//! persisted set always contains the indexed set. Persistence failures
//! surface to the caller; indexing failures on write paths are logged and
//! healed by the next rebuild.
//!
//! # Locking
//!
//! One coarse reader-writer lock guards the lifecycle state. Writes
//! (`insert`, `batch_insert`, `delete`, `update`, `stop`, `rebuild`) hold
//! it exclusively for the whole operation, disk I/O included; reads
//! (`search`, `get`, `stats`) hold it shared. The store and the index
//! synchronize internally and are safe to call under either mode.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{HnswIndex, IndexStats, VectorIndex};
use crate::storage::{StoreStats, VectorStore};
use crate::vector::{SearchParams, SearchResult, Vector};

/// Cooperative cancellation flag for long-running engine operations.
///
/// Clones share the flag; cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Engine lifecycle: `New -> Running -> Stopped`, `Stopped` terminal.
enum Lifecycle {
    New,
    Running { started: Instant },
    Stopped,
}

impl Lifecycle {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Running { .. } => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// Merged engine, index, and store statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Lifecycle state: "new", "running", or "stopped".
    pub state: &'static str,
    /// Seconds since `start` completed; zero unless running.
    pub uptime_secs: u64,
    /// Advisory vector cap from configuration.
    pub max_vectors: usize,
    /// Index statistics.
    pub index: IndexStats,
    /// Store statistics.
    pub store: StoreStats,
}

/// The vector database engine.
pub struct Engine {
    config: Config,
    store: VectorStore,
    index: HnswIndex,
    lifecycle: RwLock<Lifecycle>,
}

impl Engine {
    /// Creates an engine: validates the configuration, opens the store at
    /// `storage.data_dir`, and builds an empty index.
    ///
    /// The engine starts in the `New` state; call [`start`](Self::start)
    /// to rebuild the index from persisted state and begin serving.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid configuration or a storage
    /// error if the store cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = VectorStore::open(&config.storage.data_dir)?;
        let index = HnswIndex::new(config.index.dimensions, config.index.rebuild_seed);
        index.set_search_ef(config.index.ef_search);

        Ok(Self {
            config,
            store,
            index,
            lifecycle: RwLock::new(Lifecycle::New),
        })
    }

    /// Rebuilds the index from persisted state and marks the engine
    /// running.
    ///
    /// Persisted vectors are loaded in a shuffled order (seeded by
    /// `index.rebuild_seed`) rather than key order, which protects HNSW
    /// quality from adversarial insertion sequences. Records with a wrong
    /// dimension are skipped and logged; index failures are counted and
    /// logged. Cancellation is honored between records and aborts with
    /// [`Error::Cancelled`], leaving the engine in the `New` state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if already running,
    /// [`Error::NotRunning`] if the engine was stopped, or storage errors
    /// from the load.
    pub fn start(&self, cancel: &CancelToken) -> Result<()> {
        let mut lifecycle = self.lifecycle.write();
        match *lifecycle {
            Lifecycle::Running { .. } => return Err(Error::AlreadyRunning),
            Lifecycle::Stopped => return Err(Error::NotRunning),
            Lifecycle::New => {}
        }

        let started = Instant::now();
        let indexed = self.load_into_index(cancel)?;

        *lifecycle = Lifecycle::Running { started };
        info!(
            indexed,
            startup_ms = started.elapsed().as_millis() as u64,
            "Engine started"
        );
        Ok(())
    }

    /// Flushes and closes the store, then marks the engine stopped.
    ///
    /// `Stopped` is terminal; the engine cannot be restarted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] unless the engine is running, or the
    /// store's final flush error. The engine is marked stopped regardless.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write();
        if !matches!(*lifecycle, Lifecycle::Running { .. }) {
            return Err(Error::NotRunning);
        }

        let result = self.store.close();
        *lifecycle = Lifecycle::Stopped;
        info!("Engine stopped");
        result
    }

    /// Inserts a vector: durable write first, then the index.
    ///
    /// The store write is the durability barrier and its failure fails the
    /// insert. An index failure afterwards is logged only; the vector is
    /// persisted and becomes searchable on the next rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`], [`Error::InvalidDimensions`], or a
    /// storage error.
    pub fn insert(&self, vector: Vector) -> Result<()> {
        let lifecycle = self.lifecycle.write();
        self.ensure_running(&lifecycle)?;

        self.check_dimensions(&vector)?;

        self.store.put(&vector)?;

        if let Err(e) = self.index.add(&vector.id, &vector.embedding) {
            warn!(
                id = %vector.id,
                error = %e,
                "Vector persisted but not indexed; searchable after next rebuild"
            );
        }

        Ok(())
    }

    /// Inserts a batch: one chunked durable write, then per-vector
    /// indexing.
    ///
    /// Persistence failures surface with the failed chunk's starting
    /// index. Per-vector index failures are counted and logged, never
    /// surfaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] or [`Error::BatchWriteFailed`].
    pub fn batch_insert(&self, vectors: &[Vector]) -> Result<()> {
        let lifecycle = self.lifecycle.write();
        self.ensure_running(&lifecycle)?;

        self.store.batch_put(vectors)?;

        let mut index_failures = 0usize;
        for vector in vectors {
            if self.check_dimensions(vector).is_err() {
                // batch_put accepts any record; dimension discipline for
                // the index is re-checked here.
                index_failures += 1;
                continue;
            }
            if self.index.add(&vector.id, &vector.embedding).is_err() {
                index_failures += 1;
            }
        }

        if index_failures > 0 {
            warn!(
                count = index_failures,
                total = vectors.len(),
                "Batch vectors persisted but not indexed; searchable after next rebuild"
            );
        }

        Ok(())
    }

    /// Approximate k-nearest-neighbor search.
    ///
    /// Hits below the score threshold are dropped; each surviving id is
    /// hydrated from the store. An id the index returns but the store no
    /// longer holds is a tombstone artifact: it is logged and skipped.
    /// Results come back in ascending distance order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`], [`Error::DimensionMismatch`] for a
    /// malformed query, or a storage error during hydration.
    pub fn search(&self, query: &Vector, params: SearchParams) -> Result<Vec<SearchResult>> {
        let lifecycle = self.lifecycle.read();
        self.ensure_running(&lifecycle)?;

        let hits = self.index.search(&query.embedding, params.k)?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.score < params.threshold {
                continue;
            }

            let mut vector = match self.store.get(&hit.id) {
                Ok(vector) => vector,
                Err(Error::VectorNotFound(id)) => {
                    warn!(
                        id = %id,
                        "Index returned an id missing from storage, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !params.include_vecs {
                vector.embedding = Vec::new();
            }
            if !params.include_meta {
                vector.metadata = None;
            }

            results.push(SearchResult {
                vector,
                distance: hit.distance,
                score: hit.score,
            });
        }

        debug!(results = results.len(), k = params.k, "Search completed");
        Ok(results)
    }

    /// Retrieves a vector by id. Returns `Ok(None)` for unknown ids.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub fn get(&self, id: &str) -> Result<Option<Vector>> {
        let _lifecycle = self.lifecycle.read();

        match self.store.get(id) {
            Ok(vector) => Ok(Some(vector)),
            Err(Error::VectorNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes a vector. The durable delete is authoritative; a missing
    /// index entry is only logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] or a storage error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let lifecycle = self.lifecycle.write();
        self.ensure_running(&lifecycle)?;

        self.store.delete(id)?;

        if let Err(e) = self.index.remove(id) {
            warn!(id, error = %e, "Index removal failed after durable delete");
        }

        Ok(())
    }

    /// Overwrites an existing vector's record.
    ///
    /// The index is deliberately left alone: it still reflects the old
    /// embedding until the next rebuild, which is logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`], [`Error::InvalidDimensions`],
    /// [`Error::VectorNotFound`] if the id does not exist, or a storage
    /// error.
    pub fn update(&self, vector: Vector) -> Result<()> {
        let lifecycle = self.lifecycle.write();
        self.ensure_running(&lifecycle)?;

        self.check_dimensions(&vector)?;

        // Prove existence before overwriting.
        self.store.get(&vector.id)?;
        self.store.put(&vector)?;

        info!(
            id = %vector.id,
            "Vector updated; index reflects the previous embedding until rebuild"
        );
        Ok(())
    }

    /// Rebuilds the index from persisted state, clearing tombstones.
    ///
    /// This is the recovery path for logically removed entries, which stay
    /// in the graph until a rebuild. Returns the number of vectors
    /// indexed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRunning`] or storage errors from the load.
    pub fn rebuild(&self) -> Result<usize> {
        let lifecycle = self.lifecycle.write();
        self.ensure_running(&lifecycle)?;

        self.index.reset();
        let indexed = self.load_into_index(&CancelToken::new())?;
        info!(indexed, "Index rebuilt");
        Ok(indexed)
    }

    /// Sets the index search expansion factor, clamped to `[1, 1000]`.
    pub fn set_search_ef(&self, ef: usize) {
        self.index.set_search_ef(ef);
    }

    /// Merged engine, index, and store statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let lifecycle = self.lifecycle.read();
        let uptime_secs = match *lifecycle {
            Lifecycle::Running { started } => started.elapsed().as_secs(),
            _ => 0,
        };

        EngineStats {
            state: lifecycle.as_str(),
            uptime_secs,
            max_vectors: self.config.database.max_vectors,
            index: self.index.stats(),
            store: self.store.stats(),
        }
    }

    fn ensure_running(&self, lifecycle: &Lifecycle) -> Result<()> {
        if matches!(lifecycle, Lifecycle::Running { .. }) {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn check_dimensions(&self, vector: &Vector) -> Result<()> {
        let expected = self.config.index.dimensions;
        if vector.embedding.len() == expected {
            Ok(())
        } else {
            Err(Error::InvalidDimensions {
                expected,
                actual: vector.embedding.len(),
            })
        }
    }

    /// Loads every persisted vector into the index in shuffled order.
    ///
    /// Returns the number indexed. Wrong-dimension records are skipped and
    /// logged; index failures are counted and logged; cancellation is
    /// checked between records.
    fn load_into_index(&self, cancel: &CancelToken) -> Result<usize> {
        let mut records: Vec<(String, Vec<f32>)> = Vec::new();
        self.store.iterate(|vector| {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            records.push((vector.id, vector.embedding));
            Ok(())
        })?;

        shuffle(&mut records, self.config.index.rebuild_seed);

        let expected = self.config.index.dimensions;
        let total = records.len();
        let mut indexed = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        for (n, (id, embedding)) in records.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if embedding.len() != expected {
                warn!(
                    id = %id,
                    expected,
                    actual = embedding.len(),
                    "Skipping persisted vector with wrong dimensions"
                );
                skipped += 1;
            } else if let Err(e) = self.index.add(&id, &embedding) {
                warn!(id = %id, error = %e, "Failed to index persisted vector");
                failed += 1;
            } else {
                indexed += 1;
            }

            if (n + 1) % 1000 == 0 {
                info!(loaded = n + 1, total, "Index load progress");
            }
        }

        if skipped > 0 || failed > 0 {
            warn!(indexed, skipped, failed, "Index load finished with omissions");
        }

        Ok(indexed)
    }
}

/// Fisher-Yates shuffle driven by xorshift64.
fn shuffle<T>(items: &mut [T], seed: u64) {
    // A zero seed would freeze xorshift; displace it.
    let mut state = seed | 1;
    for i in (1..items.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        #[allow(clippy::cast_possible_truncation)]
        let j = (state % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}
