use std::sync::Arc;

use log::{debug, trace};
use sparse_store::{Checkpoint, EmbeddingRow, Key, KeyIndex, RowStore};

use crate::{
    MosErr, Result,
    cache::{DeviceCache, Residency, ResidencyPlan, StagedRows},
    initialization::ParamGen,
    keyset::KeysetShard,
    optimization::Optimizer,
    snapshot::SnapshotWriter,
};

/// Where the coordinator is in a shard transition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    ResolvingKeys,
    Evicting,
    Prefetching,
    Ready,
}

/// Drives the shard transitions of a run: resolves the keys of each shard, makes room in the
/// cache and loads the shard's rows before handing the cache over to the compute step.
pub struct Coordinator<S: RowStore> {
    store: Arc<S>,
    cache: DeviceCache,
    optimizer: Box<dyn Optimizer>,
    initializer: Box<dyn ParamGen>,
    snapshots: SnapshotWriter,
    phase: Phase,
}

impl<S: RowStore + 'static> Coordinator<S> {
    /// Creates a new `Coordinator`.
    ///
    /// # Arguments
    /// * `store` - The backing store of every row.
    /// * `cache` - The cache the compute step works on.
    /// * `optimizer` - The update rule for gradients.
    /// * `initializer` - Generates the weights of keys never seen before.
    /// * `snapshots` - The snapshot cadence.
    ///
    /// # Returns
    /// A new `Coordinator` or `InvalidConfig` if the store, cache and optimizer don't agree
    /// on the row layout.
    pub fn new(
        store: Arc<S>,
        cache: DeviceCache,
        optimizer: Box<dyn Optimizer>,
        initializer: Box<dyn ParamGen>,
        snapshots: SnapshotWriter,
    ) -> Result<Self> {
        let layout = store.layout();

        if cache.layout() != layout {
            return Err(MosErr::InvalidConfig(format!(
                "the cache holds rows of {:?} but the store holds {layout:?}",
                cache.layout()
            )));
        }

        if optimizer.state_width(layout.dim()) != layout.state_width() {
            return Err(MosErr::InvalidConfig(format!(
                "the optimizer needs {} state values per row, the store keeps {}",
                optimizer.state_width(layout.dim()),
                layout.state_width()
            )));
        }

        Ok(Self {
            store,
            cache,
            optimizer,
            initializer,
            snapshots,
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    pub fn snapshots(&self) -> &SnapshotWriter {
        &self.snapshots
    }

    /// A handle that reads rows ahead of time, usable while a shard is being computed.
    pub fn stager(&self) -> Stager<S> {
        Stager {
            store: Arc::clone(&self.store),
        }
    }

    /// Makes every key of `shard` resident and hands the cache over to the compute step.
    ///
    /// # Arguments
    /// * `shard` - The shard about to be trained on.
    ///
    /// # Returns
    /// A guard to compute through, the coordinator goes back to `Idle` once it's dropped.
    /// On error the coordinator is back at `Idle` and the error carries the shard's index.
    pub fn prepare<'a>(&'a mut self, shard: &'a KeysetShard) -> Result<ReadyShard<'a>> {
        self.prepare_staged(shard, None)
    }

    /// Like `prepare`, taking the rows of `staged` instead of reading them again.
    pub fn prepare_staged<'a>(
        &'a mut self,
        shard: &'a KeysetShard,
        staged: Option<StagedRows>,
    ) -> Result<ReadyShard<'a>> {
        let residency = match self.transition(shard.keys(), staged) {
            Ok(residency) => residency,
            Err(e) => {
                self.phase = Phase::Idle;
                return Err(e.at_shard(shard.index()));
            }
        };

        self.phase = Phase::Ready;
        debug!(
            shard = shard.index(),
            hits = residency.hits,
            loaded = residency.loaded,
            staged = residency.staged,
            evicted = residency.evicted,
            written_back = residency.written_back;
            "shard ready"
        );

        Ok(ReadyShard {
            index: shard.index(),
            keys: shard.keys(),
            residency,
            cache: &mut self.cache,
            optimizer: self.optimizer.as_ref(),
            key_index: self.store.index(),
            phase: &mut self.phase,
        })
    }

    fn transition(&mut self, keys: &[Key], staged: Option<StagedRows>) -> Result<Residency> {
        if keys.len() > self.cache.capacity() {
            return Err(MosErr::RequestExceedsCapacity {
                shard: None,
                requested: keys.len(),
                capacity: self.cache.capacity(),
            });
        }

        self.phase = Phase::ResolvingKeys;
        self.resolve_keys(keys)?;

        self.phase = Phase::Evicting;
        let plan = self.plan(keys)?;
        let mut residency = self.cache.evict(&plan, self.store.as_ref())?;

        self.phase = Phase::Prefetching;
        self.cache
            .prefetch(&plan, self.store.as_ref(), staged, &mut residency)?;

        Ok(residency)
    }

    /// Gives every key without a slot a freshly initialized row in the store.
    fn resolve_keys(&mut self, keys: &[Key]) -> Result<usize> {
        let layout = self.store.layout();
        let index = self.store.index();

        let rows: Vec<(Key, EmbeddingRow)> = keys
            .iter()
            .filter(|k| index.resolve(**k).is_none())
            .map(|k| {
                let weights = self.initializer.sample(layout.dim());
                (*k, EmbeddingRow::with_weights(layout, weights))
            })
            .collect();

        if rows.is_empty() {
            return Ok(0);
        }

        let batch: Vec<_> = rows.iter().map(|(k, r)| (*k, r)).collect();
        self.store.write_rows(&batch)?;

        trace!(created = rows.len(); "initialized rows for new keys");
        Ok(rows.len())
    }

    /// Plans the residency of `keys`, waiting once for the snapshot in flight if its pinned
    /// rows are in the way.
    fn plan(&mut self, keys: &[Key]) -> Result<ResidencyPlan> {
        match self.cache.plan(keys) {
            Err(MosErr::FlushInProgress { pinned }) => {
                debug!(pinned = pinned; "waiting for the snapshot in flight");
                self.snapshots.finish(&mut self.cache)?;
                self.cache.plan(keys)
            }
            plan => plan,
        }
    }

    /// Whether a periodic snapshot is due after `iterations` total iterations.
    pub fn snapshot_due(&self, iterations: usize) -> bool {
        self.snapshots.due(iterations)
    }

    /// Takes the periodic snapshot for `iterations`, in the background if so configured.
    pub fn periodic_snapshot(&mut self, iterations: usize) -> Result<()> {
        self.snapshots.mark(iterations);

        if self.snapshots.background() {
            self.snapshots.begin(&mut self.cache, &self.store)
        } else {
            self.snapshots.snapshot(&mut self.cache, self.store.as_ref())?;
            Ok(())
        }
    }

    /// Flushes every dirty row and checkpoints the store, waiting for both.
    pub fn snapshot(&mut self) -> Result<Checkpoint> {
        self.snapshots.snapshot(&mut self.cache, self.store.as_ref())
    }

    /// Waits for the background snapshot in flight, if any.
    pub fn finish_snapshot(&mut self) -> Result<Option<Checkpoint>> {
        self.snapshots.finish(&mut self.cache)
    }
}

/// Reads rows into a staging area, independently of the coordinator.
pub struct Stager<S> {
    store: Arc<S>,
}

impl<S: RowStore> Stager<S> {
    /// Reads the rows of `keys` from the store.
    ///
    /// # Arguments
    /// * `keys` - Keys that are indexed and not resident.
    ///
    /// # Returns
    /// The staged rows or the store's error.
    pub fn stage(&self, keys: &[Key]) -> Result<StagedRows> {
        if keys.is_empty() {
            return Ok(StagedRows::default());
        }

        let rows = self.store.read_rows(keys)?;
        trace!(rows = rows.len(); "staged rows");
        Ok(StagedRows::new(rows))
    }
}

/// A shard whose rows are all resident, the compute step works through it.
///
/// It mutably borrows the coordinator, so no other transition can start while it's alive.
pub struct ReadyShard<'a> {
    index: usize,
    keys: &'a [Key],
    residency: Residency,
    cache: &'a mut DeviceCache,
    optimizer: &'a dyn Optimizer,
    key_index: &'a KeyIndex,
    phase: &'a mut Phase,
}

impl ReadyShard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn keys(&self) -> &[Key] {
        self.keys
    }

    /// What the transition into this shard did to the cache.
    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn get(&self, key: Key) -> Result<&EmbeddingRow> {
        self.cache.get(key).ok_or(MosErr::NotResident { key })
    }

    /// Borrows a resident row for writing, marking it dirty.
    pub fn get_mut(&mut self, key: Key) -> Result<&mut EmbeddingRow> {
        self.cache.get_mut(key).ok_or(MosErr::NotResident { key })
    }

    /// Applies a gradient to the row of `key` with the session's optimizer.
    pub fn apply_gradient(&mut self, key: Key, grad: &[f32]) -> Result<()> {
        self.cache.apply_gradient(key, grad, self.optimizer)
    }

    /// Appends the weights of every key in `keys` to `out`, in order.
    ///
    /// # Returns
    /// `NotResident` for the first key whose row isn't resident, `out` may be partially
    /// filled in that case.
    pub fn gather(&self, keys: &[Key], out: &mut Vec<f32>) -> Result<()> {
        out.reserve(keys.len() * self.cache.layout().dim());

        for key in keys {
            out.extend_from_slice(self.get(*key)?.weights());
        }

        Ok(())
    }

    /// The keys of `next` worth reading ahead while this shard is computed.
    ///
    /// Only keys already in the store and not resident are staged, and only if both working
    /// sets fit in the cache's capacity at once.
    pub fn prefetch_keys(&self, next: &[Key]) -> Vec<Key> {
        let ahead: Vec<Key> = next
            .iter()
            .copied()
            .filter(|k| !self.cache.contains(*k) && self.key_index.contains(*k))
            .collect();

        if self.keys.len() + ahead.len() > self.cache.capacity() {
            return Vec::new();
        }

        ahead
    }
}

impl Drop for ReadyShard<'_> {
    fn drop(&mut self) {
        *self.phase = Phase::Idle;
    }
}
