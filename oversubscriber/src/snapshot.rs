use std::{
    num::NonZeroUsize,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, info};
use sparse_store::{Checkpoint, Key, RowStore};

use crate::{
    MosErr, Result,
    cache::{DeviceCache, FlushBatch},
};

/// A background flush whose rows are still pinned in the cache.
struct PendingSnapshot {
    versions: Vec<(Key, u64)>,
    handle: JoinHandle<sparse_store::Result<Checkpoint>>,
}

/// Persists the dirty rows of the cache and checkpoints the store.
///
/// Snapshots are taken every `every` iterations and always at the end of a run. In background
/// mode periodic snapshots write their rows on a separate thread while training continues,
/// the rows stay pinned until `finish` collects the result.
pub struct SnapshotWriter {
    every: Option<NonZeroUsize>,
    background: bool,
    last_at: usize,
    pending: Option<PendingSnapshot>,
    taken: usize,
}

impl SnapshotWriter {
    /// Creates a new `SnapshotWriter`.
    ///
    /// # Arguments
    /// * `every` - The cadence in iterations, `None` only snapshots on completion.
    /// * `background` - Whether periodic snapshots run on a separate thread.
    ///
    /// # Returns
    /// A new `SnapshotWriter` instance.
    pub fn new(every: Option<NonZeroUsize>, background: bool) -> Self {
        Self {
            every,
            background,
            last_at: 0,
            pending: None,
            taken: 0,
        }
    }

    pub fn background(&self) -> bool {
        self.background
    }

    /// The amount of snapshots completed so far.
    pub fn taken(&self) -> usize {
        self.taken
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a periodic snapshot is due after `iterations` total iterations.
    pub fn due(&self, iterations: usize) -> bool {
        self.every
            .is_some_and(|every| iterations.saturating_sub(self.last_at) >= every.get())
    }

    /// Records that the periodic snapshot for `iterations` was started.
    pub fn mark(&mut self, iterations: usize) {
        self.last_at = iterations;
    }

    /// Flushes every dirty row and checkpoints the store, waiting for both.
    ///
    /// A background snapshot still in flight is completed first.
    ///
    /// # Arguments
    /// * `cache` - The cache holding the dirty rows.
    /// * `store` - The store to persist into.
    ///
    /// # Returns
    /// The published checkpoint or the store's error, the rows stay dirty on error.
    pub fn snapshot<S: RowStore + ?Sized>(
        &mut self,
        cache: &mut DeviceCache,
        store: &S,
    ) -> Result<Checkpoint> {
        self.finish(cache)?;

        let written = cache.flush(store)?;
        let checkpoint = store.checkpoint()?;
        self.taken += 1;

        info!(
            generation = checkpoint.generation,
            rows = written;
            "snapshot taken"
        );
        Ok(checkpoint)
    }

    /// Starts a snapshot on a separate thread.
    ///
    /// The dirty rows are copied out and pinned, they can keep being written but not evicted
    /// until `finish` runs.
    pub fn begin<S: RowStore + 'static>(
        &mut self,
        cache: &mut DeviceCache,
        store: &Arc<S>,
    ) -> Result<()> {
        self.finish(cache)?;

        let FlushBatch { rows, versions } = cache.begin_flush();
        let store = Arc::clone(store);

        debug!(rows = rows.len(); "starting background snapshot");

        let handle = thread::spawn(move || {
            let batch: Vec<_> = rows.iter().map(|(k, r)| (*k, r)).collect();
            store.write_rows(&batch)?;
            store.checkpoint()
        });

        self.pending = Some(PendingSnapshot { versions, handle });
        Ok(())
    }

    /// Waits for the background snapshot in flight, if any, and unpins its rows.
    ///
    /// # Returns
    /// The checkpoint it published, `None` if there was nothing in flight.
    pub fn finish(&mut self, cache: &mut DeviceCache) -> Result<Option<Checkpoint>> {
        let Some(PendingSnapshot { versions, handle }) = self.pending.take() else {
            return Ok(None);
        };

        let Ok(result) = handle.join() else {
            cache.complete_flush(&versions, false);
            return Err(MosErr::SnapshotPanicked);
        };

        cache.complete_flush(&versions, result.is_ok());
        let checkpoint = result?;
        self.taken += 1;

        info!(
            generation = checkpoint.generation,
            rows = versions.len();
            "background snapshot taken"
        );
        Ok(Some(checkpoint))
    }
}
