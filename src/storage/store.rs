//! Log-structured vector store.
//!
//! Stores vector records in an append-only log file with an in-memory
//! index of `id -> offset`. The log doubles as the write-ahead log: every
//! mutation is a single appended record, and the index is rebuilt by
//! replaying the log on open. A bincode snapshot of the index
//! (`vectors.idx`) is written on flush as a fast-open optimization; the
//! log remains authoritative.
//!
//! # On-disk record format
//!
//! ```text
//! put:    1u8 | id_len: u32 LE | id bytes | val_len: u32 LE | JSON(Vector)
//! delete: 2u8 | id_len: u32 LE | id bytes
//! ```

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::maintenance::MaintenanceHandle;
use crate::error::{Error, Result};
use crate::vector::Vector;

/// Vectors per write batch in [`VectorStore::batch_put`].
const BATCH_SIZE: usize = 100;

const MARKER_PUT: u8 = 1;
const MARKER_DELETE: u8 = 2;

/// Location of a live record's value within the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(super) struct Slot {
    /// Offset of the `val_len` field.
    pub value_offset: u64,
    /// Length of the serialized value in bytes.
    pub value_len: u32,
    /// Length of the id in bytes (needed to account the full record).
    pub id_len: u32,
}

impl Slot {
    /// Total on-disk size of the record this slot points at.
    pub fn record_len(&self) -> u64 {
        1 + 4 + u64::from(self.id_len) + 4 + u64::from(self.value_len)
    }
}

/// Index snapshot written to `vectors.idx` on flush.
///
/// `log_len` records the log length the snapshot describes; on open the
/// snapshot is used only when the log has not grown past it.
#[derive(Serialize, Deserialize)]
pub(super) struct IndexSnapshot {
    pub log_len: u64,
    pub dead_bytes: u64,
    pub slots: FxHashMap<String, Slot>,
}

/// Tuning knobs for a [`VectorStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Run the background maintenance loop.
    pub maintenance: bool,
    /// Maintenance tick interval.
    pub maintenance_interval: Duration,
    /// Log size above which compaction is considered.
    pub log_gc_threshold: u64,
    /// Minimum fragmentation ratio for compaction to run.
    pub gc_ratio: f64,
    /// Index snapshot size above which the snapshot is rewritten.
    pub snapshot_threshold: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            maintenance: true,
            maintenance_interval: Duration::from_secs(5 * 60),
            log_gc_threshold: 4 << 30,  // 4 GiB
            gc_ratio: 0.5,
            snapshot_threshold: 512 << 20, // 512 MiB
        }
    }
}

/// Size and liveness counters for a [`VectorStore`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    /// Size of the record log in bytes.
    pub log_bytes: u64,
    /// Size of the index snapshot file in bytes.
    pub index_bytes: u64,
    /// Number of live records.
    pub live_records: usize,
    /// Bytes occupied by overwritten and deleted records.
    pub dead_bytes: u64,
}

/// Shared state between the store handle, compaction, and maintenance.
pub(super) struct StoreInner {
    pub path: PathBuf,
    /// id -> live record location.
    pub index: RwLock<FxHashMap<String, Slot>>,
    /// Append writer for the record log.
    pub log: RwLock<io::BufWriter<File>>,
    /// Independent handle for random-access reads, locked for seeking.
    pub reader: RwLock<File>,
    /// Current log length. Tracked to avoid metadata round-trips.
    pub log_len: AtomicU64,
    /// Bytes belonging to overwritten or deleted records.
    pub dead_bytes: AtomicU64,
    pub closed: AtomicBool,
    pub options: StoreOptions,
}

impl StoreInner {
    pub fn log_path(&self) -> PathBuf {
        self.path.join("vectors.log")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join("vectors.idx")
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    /// Flushes the log and writes the index snapshot.
    pub fn flush(&self) -> Result<()> {
        {
            let mut log = self.log.write();
            log.flush()?;
            log.get_ref().sync_all()?;
        }
        self.write_snapshot()?;
        Ok(())
    }

    /// Writes the bincode index snapshot, fsynced.
    pub fn write_snapshot(&self) -> Result<()> {
        let snapshot = IndexSnapshot {
            log_len: self.log_len.load(Ordering::Acquire),
            dead_bytes: self.dead_bytes.load(Ordering::Acquire),
            slots: self.index.read().clone(),
        };

        let file = File::create(self.snapshot_path())?;
        let mut writer = io::BufWriter::new(file);
        bincode::serialize_into(&mut writer, &snapshot)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(io::IntoInnerError::into_error)?
            .sync_all()?;
        Ok(())
    }

    /// Returns the fragmentation ratio: dead bytes over total log bytes.
    pub fn fragmentation_ratio(&self) -> f64 {
        let len = self.log_len.load(Ordering::Acquire);
        if len == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.dead_bytes.load(Ordering::Acquire) as f64 / len as f64;
        ratio.min(1.0)
    }

    pub fn stats(&self) -> StoreStats {
        let index_bytes = std::fs::metadata(self.snapshot_path())
            .map(|m| m.len())
            .unwrap_or(0);
        StoreStats {
            log_bytes: self.log_len.load(Ordering::Acquire),
            index_bytes,
            live_records: self.index.read().len(),
            dead_bytes: self.dead_bytes.load(Ordering::Acquire),
        }
    }
}

/// Durable `id -> Vector` map backed by an append-only record log.
pub struct VectorStore {
    inner: Arc<StoreInner>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl VectorStore {
    /// Opens or creates a store at `path` with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the log
    /// cannot be opened and replayed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Opens or creates a store at `path`.
    ///
    /// Replays the record log to rebuild the in-memory index, using the
    /// `vectors.idx` snapshot as a fast path when it still describes the
    /// whole log. Spawns the background maintenance loop unless disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if file operations fail.
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let log_path = path.join("vectors.log");
        let writer_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_len = writer_file.metadata()?.len();

        let reader = File::open(&log_path)?;

        let snapshot_path = path.join("vectors.idx");
        let (index, dead_bytes) = match Self::try_load_snapshot(&snapshot_path, log_len) {
            Some(loaded) => loaded,
            None => Self::replay(&reader, log_len)?,
        };

        let inner = Arc::new(StoreInner {
            path,
            index: RwLock::new(index),
            log: RwLock::new(io::BufWriter::new(writer_file)),
            reader: RwLock::new(reader),
            log_len: AtomicU64::new(log_len),
            dead_bytes: AtomicU64::new(dead_bytes),
            closed: AtomicBool::new(false),
            options: options.clone(),
        });

        let maintenance = if options.maintenance {
            Some(MaintenanceHandle::spawn(Arc::clone(&inner)))
        } else {
            None
        };

        Ok(Self {
            inner,
            maintenance: Mutex::new(maintenance),
        })
    }

    /// Loads the index snapshot if it exactly describes the current log.
    fn try_load_snapshot(
        snapshot_path: &Path,
        log_len: u64,
    ) -> Option<(FxHashMap<String, Slot>, u64)> {
        let file = File::open(snapshot_path).ok()?;
        let snapshot: IndexSnapshot = bincode::deserialize_from(BufReader::new(file)).ok()?;
        if snapshot.log_len == log_len {
            Some((snapshot.slots, snapshot.dead_bytes))
        } else {
            None
        }
    }

    /// Replays the record log, rebuilding the offset index.
    ///
    /// A truncated trailing record (torn write) ends the replay with a
    /// warning; everything before it is kept.
    fn replay(reader: &File, log_len: u64) -> Result<(FxHashMap<String, Slot>, u64)> {
        let mut index: FxHashMap<String, Slot> = FxHashMap::default();
        let mut dead_bytes = 0u64;
        let mut buf = BufReader::new(reader.try_clone()?);
        buf.seek(SeekFrom::Start(0))?;

        let mut pos = 0u64;
        while pos < log_len {
            let mut marker = [0u8; 1];
            if buf.read_exact(&mut marker).is_err() {
                break;
            }
            pos += 1;

            let Ok(id) = read_string(&mut buf, &mut pos) else {
                warn!(offset = pos, "Truncated record at log tail, stopping replay");
                break;
            };
            #[allow(clippy::cast_possible_truncation)]
            let id_len = id.len() as u32;

            match marker[0] {
                MARKER_PUT => {
                    let mut len_bytes = [0u8; 4];
                    if buf.read_exact(&mut len_bytes).is_err() {
                        warn!(offset = pos, "Truncated record at log tail, stopping replay");
                        break;
                    }
                    let value_offset = pos;
                    let value_len = u32::from_le_bytes(len_bytes);
                    pos += 4;

                    // Seeking past EOF succeeds on files, so bound the
                    // value against the log length explicitly: a torn
                    // final record must not land in the index.
                    if value_offset + 4 + u64::from(value_len) > log_len
                        || buf.seek(SeekFrom::Current(i64::from(value_len))).is_err()
                    {
                        warn!(offset = pos, "Truncated record at log tail, stopping replay");
                        break;
                    }
                    pos += u64::from(value_len);

                    let slot = Slot {
                        value_offset,
                        value_len,
                        id_len,
                    };
                    if let Some(old) = index.insert(id, slot) {
                        dead_bytes += old.record_len();
                    }
                }
                MARKER_DELETE => {
                    if let Some(old) = index.remove(&id) {
                        dead_bytes += old.record_len();
                    }
                    // The delete record itself is dead weight too.
                    dead_bytes += 1 + 4 + u64::from(id_len);
                }
                other => {
                    return Err(Error::Serialization(format!(
                        "unknown record marker {other} at offset {pos}"
                    )));
                }
            }
        }

        Ok((index, dead_bytes))
    }

    /// Serializes and durably writes a vector, replacing any previous
    /// record for the same id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the record cannot be encoded or
    /// [`Error::Io`] if the write fails.
    pub fn put(&self, vector: &Vector) -> Result<()> {
        self.inner.ensure_open()?;

        let value =
            serde_json::to_vec(vector).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut log = self.inner.log.write();
        let mut index = self.inner.index.write();

        let slot = append_put(&mut log, &self.inner.log_len, &vector.id, &value)?;
        log.flush()?;

        if let Some(old) = index.insert(vector.id.clone(), slot) {
            self.inner
                .dead_bytes
                .fetch_add(old.record_len(), Ordering::AcqRel);
        }

        Ok(())
    }

    /// Reads and deserializes a vector by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VectorNotFound`] for unknown ids,
    /// [`Error::Io`] on read failure, or [`Error::Serialization`] if the
    /// stored record cannot be decoded.
    pub fn get(&self, id: &str) -> Result<Vector> {
        self.inner.ensure_open()?;

        let slot = {
            let index = self.inner.index.read();
            match index.get(id) {
                Some(slot) => *slot,
                None => return Err(Error::VectorNotFound(id.to_string())),
            }
        };

        let mut reader = self.inner.reader.write();
        read_value(&mut reader, slot)
    }

    /// Returns true if the store holds a live record for `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.index.read().contains_key(id)
    }

    /// Durably tombstones a key. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the delete record cannot be written.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.inner.ensure_open()?;

        let mut log = self.inner.log.write();
        let mut index = self.inner.index.write();

        let rec_len = append_delete(&mut log, &self.inner.log_len, id)?;
        log.flush()?;

        let mut dead = rec_len;
        if let Some(old) = index.remove(id) {
            dead += old.record_len();
        }
        self.inner.dead_bytes.fetch_add(dead, Ordering::AcqRel);

        Ok(())
    }

    /// Writes vectors in chunks of 100, each chunk as one buffered write
    /// and flush.
    ///
    /// A chunk failure stops the loop; the error reports the index of the
    /// first vector in the failed chunk. Vectors in earlier chunks remain
    /// durably written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchWriteFailed`] naming the failed chunk's
    /// starting index.
    pub fn batch_put(&self, vectors: &[Vector]) -> Result<()> {
        self.inner.ensure_open()?;

        for chunk_start in (0..vectors.len()).step_by(BATCH_SIZE) {
            let chunk = &vectors[chunk_start..(chunk_start + BATCH_SIZE).min(vectors.len())];
            self.write_chunk(chunk).map_err(|e| Error::BatchWriteFailed {
                batch_start: chunk_start,
                source: Box::new(e),
            })?;

            debug!(start = chunk_start, count = chunk.len(), "Batch chunk written");
        }

        Ok(())
    }

    fn write_chunk(&self, chunk: &[Vector]) -> Result<()> {
        // Serialize the whole chunk before touching the log so an encoding
        // failure leaves nothing half-written.
        let mut values = Vec::with_capacity(chunk.len());
        for vector in chunk {
            values.push(
                serde_json::to_vec(vector).map_err(|e| Error::Serialization(e.to_string()))?,
            );
        }

        let mut log = self.inner.log.write();
        let mut index = self.inner.index.write();

        let mut slots = Vec::with_capacity(chunk.len());
        for (vector, value) in chunk.iter().zip(&values) {
            slots.push(append_put(&mut log, &self.inner.log_len, &vector.id, value)?);
        }
        log.flush()?;

        for (vector, slot) in chunk.iter().zip(slots) {
            if let Some(old) = index.insert(vector.id.clone(), slot) {
                self.inner
                    .dead_bytes
                    .fetch_add(old.record_len(), Ordering::AcqRel);
            }
        }

        Ok(())
    }

    /// Iterates all live records in ascending id order.
    ///
    /// Records that fail to deserialize are logged and skipped. An error
    /// from the callback terminates the iteration and is returned.
    ///
    /// # Errors
    ///
    /// Returns the callback's error, or [`Error::Io`] on read failure.
    pub fn iterate<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Vector) -> Result<()>,
    {
        self.inner.ensure_open()?;

        let mut entries: Vec<(String, Slot)> = {
            let index = self.inner.index.read();
            index.iter().map(|(id, slot)| (id.clone(), *slot)).collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, slot) in entries {
            let value = {
                let mut reader = self.inner.reader.write();
                read_value(&mut reader, slot)
            };

            match value {
                Ok(vector) => callback(vector)?,
                Err(Error::Serialization(e)) => {
                    warn!(id = %id, error = %e, "Skipping corrupted record during iteration");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.index.read().len()
    }

    /// Returns true if no live records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.index.read().is_empty()
    }

    /// Flushes the log and writes the index snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if file operations fail.
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush()
    }

    /// Rewrites the log keeping only live records. Returns bytes reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if file operations fail; on failure the original
    /// log is untouched.
    pub fn compact(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        super::compaction::compact(&self.inner)
    }

    /// Returns the fragmentation ratio: dead bytes over total log bytes.
    #[must_use]
    pub fn fragmentation_ratio(&self) -> f64 {
        self.inner.fragmentation_ratio()
    }

    /// Returns size and liveness counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    /// Stops maintenance, flushes, and marks the store closed.
    ///
    /// Idempotent; operations after `close` fail [`Error::StoreClosed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails. The store is marked
    /// closed regardless.
    pub fn close(&self) -> Result<()> {
        if self.closed() {
            return Ok(());
        }

        if let Some(handle) = self.maintenance.lock().take() {
            handle.stop();
        }

        let result = self.inner.flush();
        self.inner.closed.store(true, Ordering::Release);
        result
    }

    /// Returns true if the store has been closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Key under the vector namespace (`v:`).
    #[must_use]
    pub fn vector_key(id: &str) -> String {
        format!("v:{id}")
    }

    /// Key under the index namespace (`i:`).
    #[must_use]
    pub fn index_key(id: &str) -> String {
        format!("i:{id}")
    }

    /// Key under the metadata namespace (`m:`).
    #[must_use]
    pub fn metadata_key(id: &str) -> String {
        format!("m:{id}")
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        if self.closed() {
            return;
        }
        if let Some(handle) = self.maintenance.lock().take() {
            handle.stop();
        }
        if let Err(e) = self.inner.flush() {
            error!(error = %e, "Failed to flush store in VectorStore::drop");
        }
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Appends a put record and returns its slot. Does not flush.
pub(super) fn append_put(
    log: &mut io::BufWriter<File>,
    log_len: &AtomicU64,
    id: &str,
    value: &[u8],
) -> Result<Slot> {
    let id_bytes = id.as_bytes();
    let id_len = u32::try_from(id_bytes.len())
        .map_err(|_| Error::Serialization("id too long".to_string()))?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| Error::Serialization("record too large".to_string()))?;

    let pos = log_len.load(Ordering::Acquire);

    log.write_all(&[MARKER_PUT])?;
    log.write_all(&id_len.to_le_bytes())?;
    log.write_all(id_bytes)?;
    log.write_all(&value_len.to_le_bytes())?;
    log.write_all(value)?;

    let value_offset = pos + 1 + 4 + u64::from(id_len);
    log_len.store(
        value_offset + 4 + u64::from(value_len),
        Ordering::Release,
    );

    Ok(Slot {
        value_offset,
        value_len,
        id_len,
    })
}

/// Appends a delete record and returns its on-disk size. Does not flush.
fn append_delete(log: &mut io::BufWriter<File>, log_len: &AtomicU64, id: &str) -> Result<u64> {
    let id_bytes = id.as_bytes();
    let id_len = u32::try_from(id_bytes.len())
        .map_err(|_| Error::Serialization("id too long".to_string()))?;

    log.write_all(&[MARKER_DELETE])?;
    log.write_all(&id_len.to_le_bytes())?;
    log.write_all(id_bytes)?;

    let rec_len = 1 + 4 + u64::from(id_len);
    log_len.fetch_add(rec_len, Ordering::AcqRel);
    Ok(rec_len)
}

/// Reads and decodes the value a slot points at.
pub(super) fn read_value(reader: &mut File, slot: Slot) -> Result<Vector> {
    reader.seek(SeekFrom::Start(slot.value_offset))?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut value = vec![0u8; len];
    reader.read_exact(&mut value)?;

    serde_json::from_slice(&value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Reads a length-prefixed string, advancing `pos`.
fn read_string(buf: &mut BufReader<File>, pos: &mut u64) -> io::Result<String> {
    let mut len_bytes = [0u8; 4];
    buf.read_exact(&mut len_bytes)?;
    *pos += 4;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut bytes = vec![0u8; len];
    buf.read_exact(&mut bytes)?;
    *pos += len as u64;

    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
