//! Log compaction: rewriting live records to reclaim dead space.
//!
//! Compaction writes every live record to a temporary log, atomically
//! replaces the old log via `rename()`, and swaps the in-memory state.
//! A crash during compaction leaves the original log intact.

use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use super::store::{append_put, read_value, Slot, StoreInner};
use crate::error::Result;

/// Cross-platform atomic file replacement.
///
/// On Unix, `rename()` atomically replaces the destination. On Windows,
/// `rename()` fails if the destination exists, so a backup shuffle is used.
fn atomic_replace(src: &Path, dst: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::fs::rename(src, dst)
    }

    #[cfg(windows)]
    {
        let backup = dst.with_extension("log.bak");
        let _ = std::fs::remove_file(&backup);

        if dst.exists() {
            std::fs::rename(dst, &backup)?;
        }

        match std::fs::rename(src, dst) {
            Ok(()) => {
                let _ = std::fs::remove_file(&backup);
                Ok(())
            }
            Err(e) => {
                if backup.exists() {
                    let _ = std::fs::rename(&backup, dst);
                }
                Err(e)
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::fs::rename(src, dst)
    }
}

/// Rewrites the log keeping only live records. Returns bytes reclaimed.
///
/// Holds the log, index, and reader locks for the duration: readers and
/// writers are excluded while the swap happens, which keeps the offset
/// index and the file contents consistent at all times.
pub(super) fn compact(inner: &StoreInner) -> Result<u64> {
    let mut log = inner.log.write();
    let mut index = inner.index.write();
    let mut reader = inner.reader.write();

    log.flush()?;

    let old_len = inner.log_len.load(Ordering::Acquire);
    if inner.dead_bytes.load(Ordering::Acquire) == 0 {
        return Ok(0);
    }

    // Sort for a deterministic record layout in the rewritten log.
    let mut entries: Vec<(String, Slot)> =
        index.iter().map(|(id, slot)| (id.clone(), *slot)).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    // 1. Write all live records to a temporary log.
    let tmp_path = inner.path.join("vectors.log.tmp");
    let tmp_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut tmp_writer = io::BufWriter::new(tmp_file);
    let tmp_len = AtomicU64::new(0);

    let mut new_slots: FxHashMap<String, Slot> = FxHashMap::default();
    new_slots.reserve(entries.len());

    for (id, slot) in entries {
        let vector = read_value(&mut reader, slot)?;
        let value = serde_json::to_vec(&vector)
            .map_err(|e| crate::error::Error::Serialization(e.to_string()))?;
        let new_slot = append_put(&mut tmp_writer, &tmp_len, &id, &value)?;
        new_slots.insert(id, new_slot);
    }

    tmp_writer.flush()?;
    tmp_writer
        .into_inner()
        .map_err(io::IntoInnerError::into_error)?
        .sync_all()?;

    // 2. Atomic swap: rename temp over the live log.
    let log_path = inner.log_path();
    atomic_replace(&tmp_path, &log_path)?;

    // 3. Reopen handles against the compacted file.
    let writer_file = OpenOptions::new().append(true).open(&log_path)?;
    *log = io::BufWriter::new(writer_file);
    *reader = File::open(&log_path)?;

    // 4. Swap in-memory state.
    let new_len = tmp_len.load(Ordering::Acquire);
    *index = new_slots;
    inner.log_len.store(new_len, Ordering::Release);
    inner.dead_bytes.store(0, Ordering::Release);

    drop(reader);
    drop(index);
    drop(log);

    // 5. Snapshot describes the fresh log.
    inner.write_snapshot()?;

    Ok(old_len.saturating_sub(new_len))
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::storage::{StoreOptions, VectorStore};
    use crate::vector::Vector;
    use tempfile::tempdir;

    fn no_maintenance() -> StoreOptions {
        StoreOptions {
            maintenance: false,
            ..StoreOptions::default()
        }
    }

    #[test]
    fn test_compact_reclaims_dead_bytes() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open_with_options(dir.path(), no_maintenance()).unwrap();

        for i in 0..20 {
            store
                .put(&Vector::new(format!("v{i}"), vec![i as f32, 0.0, 0.0]))
                .unwrap();
        }
        for i in 0..10 {
            store.delete(&format!("v{i}")).unwrap();
        }
        // Overwrites add dead weight too.
        store.put(&Vector::new("v15", vec![99.0, 0.0, 0.0])).unwrap();

        let before = store.stats();
        assert!(before.dead_bytes > 0);

        let reclaimed = store.compact().unwrap();
        assert!(reclaimed > 0);

        let after = store.stats();
        assert_eq!(after.dead_bytes, 0);
        assert_eq!(after.live_records, 10);
        assert!(after.log_bytes < before.log_bytes);

        // Live data survives, including the overwrite.
        assert_eq!(store.get("v15").unwrap().embedding[0], 99.0);
        assert!(matches!(store.get("v3"), Err(Error::VectorNotFound(_))));
    }

    #[test]
    fn test_compact_noop_when_clean() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open_with_options(dir.path(), no_maintenance()).unwrap();

        store.put(&Vector::new("a", vec![1.0, 2.0, 3.0])).unwrap();
        assert_eq!(store.compact().unwrap(), 0);
        assert_eq!(store.get("a").unwrap().embedding.len(), 3);
    }

    #[test]
    fn test_store_usable_after_compact() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open_with_options(dir.path(), no_maintenance()).unwrap();

        store.put(&Vector::new("a", vec![1.0, 0.0, 0.0])).unwrap();
        store.delete("a").unwrap();
        store.compact().unwrap();

        // Writes land in the reopened log.
        store.put(&Vector::new("b", vec![2.0, 0.0, 0.0])).unwrap();
        assert_eq!(store.get("b").unwrap().embedding[0], 2.0);

        drop(store);

        // And replay still sees them after reopen.
        let store = VectorStore::open_with_options(dir.path(), no_maintenance()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("b").unwrap().embedding[0], 2.0);
    }

    #[test]
    fn test_fragmentation_ratio() {
        let dir = tempdir().unwrap();
        let store = VectorStore::open_with_options(dir.path(), no_maintenance()).unwrap();

        assert!((store.fragmentation_ratio() - 0.0).abs() < f64::EPSILON);

        store.put(&Vector::new("a", vec![1.0, 0.0, 0.0])).unwrap();
        store.delete("a").unwrap();

        // Everything in the log is now dead.
        assert!(store.fragmentation_ratio() > 0.99);
    }
}
