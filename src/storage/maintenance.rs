//! Background maintenance loop for the vector store.
//!
//! One thread per open store wakes on a fixed interval and inspects two
//! sizes: the record log (compacted when it is both large and sufficiently
//! fragmented) and the index snapshot (rewritten when oversized). Failures
//! are warned and retried on the next tick, never surfaced.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use super::store::StoreInner;

/// Handle to a running maintenance thread.
///
/// Dropping the handle without calling [`stop`](Self::stop) detaches the
/// thread; the store's `close()` path always stops it explicitly.
pub(super) struct MaintenanceHandle {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Spawns the maintenance loop for `inner`.
    pub fn spawn(inner: Arc<StoreInner>) -> Self {
        let (shutdown, signal) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("quiverdb-store-maintenance".to_string())
            .spawn(move || {
                let interval = inner.options.maintenance_interval;
                loop {
                    match signal.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => run_tick(&inner),
                        // Explicit shutdown or the store handle went away.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Store maintenance loop stopped");
            })
            .expect("failed to spawn store maintenance thread");

        Self {
            shutdown,
            thread: Some(thread),
        }
    }

    /// Signals the loop to stop and joins the thread.
    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// One maintenance inspection: log GC then snapshot rewrite.
fn run_tick(inner: &StoreInner) {
    let stats = inner.stats();

    if stats.log_bytes > inner.options.log_gc_threshold {
        let ratio = inner.fragmentation_ratio();
        if ratio >= inner.options.gc_ratio {
            match super::compaction::compact(inner) {
                Ok(reclaimed) => {
                    info!(
                        reclaimed_bytes = reclaimed,
                        fragmentation = ratio,
                        "Log compaction reclaimed space"
                    );
                }
                Err(e) => warn!(error = %e, "Log compaction error"),
            }
        }
    }

    if stats.index_bytes > inner.options.snapshot_threshold {
        if let Err(e) = inner.write_snapshot() {
            warn!(error = %e, "Index snapshot rewrite error");
        }
    }
}
