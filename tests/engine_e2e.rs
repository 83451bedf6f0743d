//! End-to-end test suite for the engine.
//!
//! Exercises the full workflow over a real store directory: lifecycle,
//! CRUD, search semantics, batch ingestion, and persistence across
//! restarts.

use tempfile::TempDir;

use quiverdb::{CancelToken, Config, Engine, Error, SearchParams, Vector};

/// Builds a 3-dimensional engine config over a temp directory.
fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.index.dimensions = 3;
    config.storage.data_dir = dir.path().to_string_lossy().into_owned();
    config
}

/// Opens and starts an engine over the directory.
fn start_engine(dir: &TempDir) -> Engine {
    let engine = Engine::new(test_config(dir)).expect("Failed to create engine");
    engine.start(&CancelToken::new()).expect("Failed to start engine");
    engine
}

fn meta(key: &str, value: &str) -> quiverdb::vector::Metadata {
    let mut map = quiverdb::vector::Metadata::new();
    map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    map
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn test_start_stop_transitions() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(test_config(&dir)).unwrap();

        // Operations before start are rejected.
        assert!(matches!(
            engine.insert(Vector::new("a", vec![1.0, 0.0, 0.0])),
            Err(Error::NotRunning)
        ));
        assert!(matches!(engine.stop(), Err(Error::NotRunning)));

        engine.start(&CancelToken::new()).unwrap();
        assert!(matches!(
            engine.start(&CancelToken::new()),
            Err(Error::AlreadyRunning)
        ));

        engine.stop().unwrap();
        assert!(matches!(engine.stop(), Err(Error::NotRunning)));
        // Stopped is terminal.
        assert!(matches!(
            engine.start(&CancelToken::new()),
            Err(Error::NotRunning)
        ));
    }

    #[test]
    fn test_cancelled_start_aborts() {
        let dir = TempDir::new().unwrap();
        {
            let engine = start_engine(&dir);
            engine.insert(Vector::new("a", vec![1.0, 0.0, 0.0])).unwrap();
            engine.stop().unwrap();
        }

        let engine = Engine::new(test_config(&dir)).unwrap();
        let token = CancelToken::new();
        token.cancel();

        assert!(matches!(engine.start(&token), Err(Error::Cancelled)));

        // A fresh token still brings the engine up.
        engine.start(&CancelToken::new()).unwrap();
        assert!(engine.get("a").unwrap().is_some());
        engine.stop().unwrap();
    }

    #[test]
    fn test_stats_reflect_state() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(test_config(&dir)).unwrap();
        assert_eq!(engine.stats().state, "new");

        engine.start(&CancelToken::new()).unwrap();
        engine.insert(Vector::new("a", vec![1.0, 0.0, 0.0])).unwrap();

        let stats = engine.stats();
        assert_eq!(stats.state, "running");
        assert_eq!(stats.index.vectors, 1);
        assert_eq!(stats.index.active, 1);
        assert_eq!(stats.index.dimensions, 3);
        assert_eq!(stats.store.live_records, 1);
        assert_eq!(stats.max_vectors, 1_000_000);

        engine.stop().unwrap();
        assert_eq!(engine.stats().state, "stopped");
    }
}

// ============================================================================
// CRUD
// ============================================================================

mod crud {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        let vector = Vector::with_metadata("a", vec![1.0, 0.0, 0.0], meta("kind", "axis"));
        engine.insert(vector.clone()).unwrap();

        let back = engine.get("a").unwrap().expect("vector not found");
        assert_eq!(back, vector);

        engine.stop().unwrap();
    }

    #[test]
    fn test_dimension_rejection_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        let result = engine.insert(Vector::new("x", vec![1.0, 0.0]));
        assert!(matches!(
            result,
            Err(Error::InvalidDimensions {
                expected: 3,
                actual: 2
            })
        ));

        assert!(engine.get("x").unwrap().is_none());
        assert_eq!(engine.stats().index.vectors, 0);
        assert_eq!(engine.stats().store.live_records, 0);

        engine.stop().unwrap();
    }

    #[test]
    fn test_delete_semantics() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        engine.insert(Vector::new("a", vec![1.0, 0.0, 0.0])).unwrap();
        engine.insert(Vector::new("b", vec![0.0, 1.0, 0.0])).unwrap();

        engine.delete("a").unwrap();

        assert!(engine.get("a").unwrap().is_none());

        let results = engine
            .search(
                &Vector::new("q", vec![1.0, 0.0, 0.0]),
                SearchParams {
                    k: 2,
                    ..SearchParams::default()
                },
            )
            .unwrap();
        assert!(results.iter().all(|r| r.vector.id != "a"));

        engine.stop().unwrap();
    }

    #[test]
    fn test_update_overwrites_durably() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        engine.insert(Vector::new("a", vec![1.0, 0.0, 0.0])).unwrap();
        engine
            .update(Vector::with_metadata(
                "a",
                vec![0.5, 0.5, 0.0],
                meta("edited", "yes"),
            ))
            .unwrap();

        let back = engine.get("a").unwrap().unwrap();
        assert_eq!(back.embedding, vec![0.5, 0.5, 0.0]);
        assert!(back.metadata.is_some());

        // Updating a missing id is an error.
        assert!(matches!(
            engine.update(Vector::new("ghost", vec![0.0, 0.0, 1.0])),
            Err(Error::VectorNotFound(_))
        ));

        engine.stop().unwrap();
    }
}

// ============================================================================
// Search
// ============================================================================

mod search {
    use super::*;

    #[test]
    fn test_knn_orientation() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        engine.insert(Vector::new("v1", vec![1.0, 0.0, 0.0])).unwrap();
        engine.insert(Vector::new("v2", vec![0.0, 1.0, 0.0])).unwrap();
        engine.insert(Vector::new("v3", vec![0.0, 0.0, 1.0])).unwrap();

        let results = engine
            .search(
                &Vector::new("q", vec![1.0, 0.0, 0.0]),
                SearchParams {
                    k: 2,
                    ..SearchParams::default()
                },
            )
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].vector.id, "v1");
        assert!((results[0].score - 1.0).abs() < 1e-5);
        assert!(results[1].vector.id == "v2" || results[1].vector.id == "v3");
        assert!(results[1].score.abs() < 1e-5);

        // Results are ordered by ascending distance.
        assert!(results[0].distance <= results[1].distance);

        engine.stop().unwrap();
    }

    #[test]
    fn test_threshold_filters_results() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        engine.insert(Vector::new("near", vec![1.0, 0.0, 0.0])).unwrap();
        engine.insert(Vector::new("far", vec![0.0, 1.0, 0.0])).unwrap();

        let results = engine
            .search(
                &Vector::new("q", vec![1.0, 0.0, 0.0]),
                SearchParams {
                    k: 10,
                    threshold: 0.5,
                    ..SearchParams::default()
                },
            )
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].vector.id, "near");
        assert!(results.iter().all(|r| r.score >= 0.5));

        engine.stop().unwrap();
    }

    #[test]
    fn test_include_flags_strip_fields() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        engine
            .insert(Vector::with_metadata(
                "a",
                vec![1.0, 0.0, 0.0],
                meta("k", "v"),
            ))
            .unwrap();

        let results = engine
            .search(
                &Vector::new("q", vec![1.0, 0.0, 0.0]),
                SearchParams {
                    k: 1,
                    threshold: 0.0,
                    include_vecs: false,
                    include_meta: false,
                },
            )
            .unwrap();

        assert_eq!(results[0].vector.id, "a");
        assert!(results[0].vector.embedding.is_empty());
        assert!(results[0].vector.metadata.is_none());

        engine.stop().unwrap();
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        engine.insert(Vector::new("a", vec![1.0, 0.0, 0.0])).unwrap();

        let result = engine.search(
            &Vector::new("q", vec![1.0, 0.0]),
            SearchParams::default(),
        );
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));

        engine.stop().unwrap();
    }
}

// ============================================================================
// Persistence
// ============================================================================

mod persistence {
    use super::*;

    #[test]
    fn test_survives_restart() {
        let dir = TempDir::new().unwrap();

        {
            let engine = start_engine(&dir);
            engine
                .insert(Vector::with_metadata(
                    "p",
                    vec![0.1, 0.2, 0.3],
                    meta("durable", "yes"),
                ))
                .unwrap();
            engine.stop().unwrap();
        }

        let engine = start_engine(&dir);

        let back = engine.get("p").unwrap().expect("vector lost across restart");
        assert_eq!(back.embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(back.metadata, Some(meta("durable", "yes")));

        let results = engine
            .search(
                &Vector::new("q", vec![0.1, 0.2, 0.3]),
                SearchParams {
                    k: 1,
                    ..SearchParams::default()
                },
            )
            .unwrap();
        assert_eq!(results[0].vector.id, "p");

        engine.stop().unwrap();
    }

    #[test]
    fn test_delete_survives_restart() {
        let dir = TempDir::new().unwrap();

        {
            let engine = start_engine(&dir);
            engine.insert(Vector::new("keep", vec![1.0, 0.0, 0.0])).unwrap();
            engine.insert(Vector::new("drop", vec![0.0, 1.0, 0.0])).unwrap();
            engine.delete("drop").unwrap();
            engine.stop().unwrap();
        }

        let engine = start_engine(&dir);
        assert!(engine.get("keep").unwrap().is_some());
        assert!(engine.get("drop").unwrap().is_none());
        engine.stop().unwrap();
    }
}

// ============================================================================
// Batch ingestion
// ============================================================================

mod batch {
    use super::*;

    /// Deterministic, well-separated unit-ish vectors.
    fn batch_vector(i: usize) -> Vector {
        let x = (i as f32).mul_add(0.017, 0.3).sin();
        let y = (i as f32).mul_add(0.029, 0.7).cos();
        let z = 1.0 + (i as f32) * 0.001;
        Vector::new(format!("batch-{i:03}"), vec![x, y, z])
    }

    #[test]
    fn test_batch_insert_250() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        let vectors: Vec<Vector> = (0..250).map(batch_vector).collect();
        engine.batch_insert(&vectors).unwrap();

        // Every vector is durably retrievable.
        for i in 0..250 {
            let id = format!("batch-{i:03}");
            let back = engine.get(&id).unwrap().unwrap_or_else(|| panic!("{id} missing"));
            assert_eq!(back.embedding, batch_vector(i).embedding);
        }

        // Searching for any member returns that member first.
        for i in [0, 17, 123, 249] {
            let results = engine
                .search(
                    &batch_vector(i),
                    SearchParams {
                        k: 1,
                        ..SearchParams::default()
                    },
                )
                .unwrap();
            assert_eq!(results[0].vector.id, format!("batch-{i:03}"));
            assert!((results[0].score - 1.0).abs() < 1e-4);
        }

        assert_eq!(engine.stats().index.active, 250);
        engine.stop().unwrap();
    }
}

// ============================================================================
// Rebuild
// ============================================================================

mod rebuild {
    use super::*;

    #[test]
    fn test_rebuild_clears_tombstones() {
        let dir = TempDir::new().unwrap();
        let engine = start_engine(&dir);

        for i in 0..20 {
            let angle = (i as f32) * 0.3;
            engine
                .insert(Vector::new(
                    format!("v{i}"),
                    vec![angle.cos(), angle.sin(), 0.5],
                ))
                .unwrap();
        }
        for i in 0..10 {
            engine.delete(&format!("v{i}")).unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.index.vectors, 20);
        assert_eq!(stats.index.active, 10);

        let indexed = engine.rebuild().unwrap();
        assert_eq!(indexed, 10);

        let stats = engine.stats();
        assert_eq!(stats.index.vectors, 10);
        assert_eq!(stats.index.active, 10);

        // Deleted ids stay gone, survivors stay searchable.
        let results = engine
            .search(
                &Vector::new("q", vec![1.0, 0.0, 0.5]),
                SearchParams {
                    k: 10,
                    ..SearchParams::default()
                },
            )
            .unwrap();
        assert!(!results.is_empty());
        for result in &results {
            let n: usize = result.vector.id[1..].parse().unwrap();
            assert!(n >= 10);
        }

        engine.stop().unwrap();
    }
}
