use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
};

use log::{debug, trace};
use sparse_store::{EmbeddingRow, Key, RowLayout, RowStore};

use super::{EvictionPolicy, StagedRows, policy::Candidate};
use crate::{MosErr, Result, optimization::Optimizer};

#[derive(Debug)]
struct CacheSlot {
    row: EmbeddingRow,
    dirty: bool,
    last_used: u64,
    /// Bumped on every write, a flush only cleans the slot if it didn't change meanwhile.
    version: u64,
    pinned: bool,
}

impl CacheSlot {
    fn clean(row: EmbeddingRow, last_used: u64) -> Self {
        Self {
            row,
            dirty: false,
            last_used,
            version: 0,
            pinned: false,
        }
    }
}

/// What a residency request did to the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Residency {
    /// Requested keys that were already resident.
    pub hits: usize,
    /// Rows read from the store.
    pub loaded: usize,
    /// Rows taken from a staging area instead of the store.
    pub staged: usize,
    pub evicted: usize,
    /// Evicted rows that were dirty and had to be written back.
    pub written_back: usize,
}

/// The work left to make a key set resident, computed before anything is moved.
#[derive(Debug)]
pub(crate) struct ResidencyPlan {
    missing: Vec<(Key, u64)>,
    victims: Vec<Key>,
    hits: usize,
}

/// The dirty rows of a flush, copied out of the cache.
///
/// The slots stay pinned until the batch is handed back to `DeviceCache::complete_flush`.
#[derive(Debug)]
pub struct FlushBatch {
    pub(crate) rows: Vec<(Key, EmbeddingRow)>,
    pub(crate) versions: Vec<(Key, u64)>,
}

impl FlushBatch {
    /// The rows as the store expects them.
    pub fn rows(&self) -> Vec<(Key, &EmbeddingRow)> {
        self.rows.iter().map(|(k, r)| (*k, r)).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A fixed capacity table of the rows the compute step can currently use.
///
/// Rows move in and out in bulk, driven by the key set of each shard. Dirty rows only reach the
/// store when they are evicted or flushed, until then the cache holds the only up to date copy.
#[derive(Debug)]
pub struct DeviceCache {
    capacity: usize,
    layout: RowLayout,
    policy: EvictionPolicy,
    slots: HashMap<Key, CacheSlot>,
    clock: u64,
}

impl DeviceCache {
    /// Creates a new empty `DeviceCache`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of resident rows.
    /// * `layout` - The shape of every row.
    /// * `policy` - How victims are chosen.
    ///
    /// # Returns
    /// A new `DeviceCache` instance.
    pub fn new(capacity: NonZeroUsize, layout: RowLayout, policy: EvictionPolicy) -> Self {
        Self {
            capacity: capacity.get(),
            layout,
            policy,
            slots: HashMap::with_capacity(capacity.get()),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// The amount of resident rows.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.slots.contains_key(&key)
    }

    pub fn is_dirty(&self, key: Key) -> bool {
        self.slots.get(&key).is_some_and(|s| s.dirty)
    }

    pub fn is_pinned(&self, key: Key) -> bool {
        self.slots.get(&key).is_some_and(|s| s.pinned)
    }

    pub fn dirty_len(&self) -> usize {
        self.slots.values().filter(|s| s.dirty).count()
    }

    /// Every resident key, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.slots.keys().copied()
    }

    /// Makes every key of `keys` resident.
    ///
    /// Resident keys are only touched. The rest are loaded in one batch after evicting as many
    /// rows as needed, writing the dirty victims back in one batch.
    ///
    /// # Arguments
    /// * `keys` - The keys to make resident, duplicates are ignored.
    /// * `store` - Where missing rows come from and dirty victims go to.
    ///
    /// # Returns
    /// What the request did, `RequestExceedsCapacity` if the keys can't all fit at once,
    /// `FlushInProgress` if only pinned rows could make room, or the store's error.
    /// The cache is left unchanged by the first two.
    pub fn ensure_resident<S: RowStore + ?Sized>(
        &mut self,
        keys: &[Key],
        store: &S,
    ) -> Result<Residency> {
        let plan = self.plan(keys)?;
        let mut residency = self.evict(&plan, store)?;
        self.prefetch(&plan, store, None, &mut residency)?;
        Ok(residency)
    }

    /// Works out which rows are missing and which ones have to go.
    ///
    /// Nothing is modified unless the plan is feasible, then the resident keys of the request
    /// are touched in request order.
    pub(crate) fn plan(&mut self, keys: &[Key]) -> Result<ResidencyPlan> {
        let mut requested = HashSet::with_capacity(keys.len());
        let keys: Vec<Key> = keys.iter().copied().filter(|k| requested.insert(*k)).collect();

        if keys.len() > self.capacity {
            return Err(MosErr::RequestExceedsCapacity {
                shard: None,
                requested: keys.len(),
                capacity: self.capacity,
            });
        }

        let missing = keys.iter().filter(|k| !self.contains(**k)).count();
        let free = self.capacity - self.slots.len();
        let needed = missing.saturating_sub(free);

        let mut candidates: Vec<Candidate> = self
            .slots
            .iter()
            .filter(|(key, slot)| !slot.pinned && !requested.contains(*key))
            .map(|(key, slot)| Candidate {
                key: *key,
                dirty: slot.dirty,
                last_used: slot.last_used,
            })
            .collect();

        if candidates.len() < needed {
            let pinned = self.slots.values().filter(|s| s.pinned).count();
            return Err(MosErr::FlushInProgress { pinned });
        }

        self.policy.rank(&mut candidates);
        let victims = candidates[..needed].iter().map(|c| c.key).collect();

        let mut plan = ResidencyPlan {
            missing: Vec::with_capacity(missing),
            victims,
            hits: keys.len() - missing,
        };

        for key in keys {
            self.clock += 1;

            match self.slots.get_mut(&key) {
                Some(slot) => slot.last_used = self.clock,
                None => plan.missing.push((key, self.clock)),
            }
        }

        Ok(plan)
    }

    /// Drops the victims of `plan`, writing the dirty ones back first.
    ///
    /// If the write back fails every victim stays resident and dirty.
    pub(crate) fn evict<S: RowStore + ?Sized>(
        &mut self,
        plan: &ResidencyPlan,
        store: &S,
    ) -> Result<Residency> {
        let dirty: Vec<(Key, &EmbeddingRow)> = plan
            .victims
            .iter()
            .filter_map(|k| self.slots.get(k).filter(|s| s.dirty).map(|s| (*k, &s.row)))
            .collect();

        let written_back = dirty.len();
        if !dirty.is_empty() {
            store.write_rows(&dirty)?;
        }

        for key in &plan.victims {
            self.slots.remove(key);
        }

        if !plan.victims.is_empty() {
            debug!(evicted = plan.victims.len(), written_back = written_back; "evicted rows");
        }

        Ok(Residency {
            hits: plan.hits,
            evicted: plan.victims.len(),
            written_back,
            ..Default::default()
        })
    }

    /// Installs the missing rows of `plan` as clean slots.
    ///
    /// Rows found in `staged` are used as they are, the rest are read from `store` in one batch.
    pub(crate) fn prefetch<S: RowStore + ?Sized>(
        &mut self,
        plan: &ResidencyPlan,
        store: &S,
        mut staged: Option<StagedRows>,
        residency: &mut Residency,
    ) -> Result<()> {
        let mut rows = HashMap::with_capacity(plan.missing.len());
        let mut unstaged = Vec::new();

        for (key, _) in &plan.missing {
            match staged.as_mut().and_then(|s| s.take(*key)) {
                Some(row) => {
                    rows.insert(*key, row);
                }
                None => unstaged.push(*key),
            }
        }

        residency.staged = rows.len();

        if !unstaged.is_empty() {
            rows.extend(store.read_rows(&unstaged)?);
        }

        for (key, tick) in &plan.missing {
            let row = rows.remove(key).ok_or(sparse_store::StoreErr::NotFound(*key))?;
            row.check(*key, self.layout)?;
            self.slots.insert(*key, CacheSlot::clean(row, *tick));
        }

        residency.loaded = unstaged.len();
        trace!(loaded = residency.loaded, staged = residency.staged; "prefetched rows");
        Ok(())
    }

    /// Reads a resident row.
    pub fn get(&self, key: Key) -> Option<&EmbeddingRow> {
        self.slots.get(&key).map(|s| &s.row)
    }

    /// Borrows a resident row for writing, marking it dirty.
    ///
    /// Writes don't count as a use for the eviction policy, recency follows residency requests.
    pub fn get_mut(&mut self, key: Key) -> Option<&mut EmbeddingRow> {
        let slot = self.slots.get_mut(&key)?;
        slot.dirty = true;
        slot.version += 1;
        Some(&mut slot.row)
    }

    /// Applies `grad` to the resident row of `key`.
    ///
    /// # Arguments
    /// * `key` - The key of the row.
    /// * `grad` - The gradient of the row's weights.
    /// * `optimizer` - The optimizer holding the update rule.
    ///
    /// # Returns
    /// `NotResident` if the row isn't resident or `GradientMismatch` if `grad` doesn't match
    /// the row. The row is left untouched on error.
    pub fn apply_gradient(&mut self, key: Key, grad: &[f32], optimizer: &dyn Optimizer) -> Result<()> {
        let dim = self.layout.dim();
        let mismatch = MosErr::GradientMismatch {
            key,
            expected: dim,
            got: grad.len(),
        };

        if !self.slots.contains_key(&key) {
            return Err(MosErr::NotResident { key });
        }

        if grad.len() != dim {
            return Err(mismatch);
        }

        let row = self.get_mut(key).ok_or(MosErr::NotResident { key })?;

        optimizer
            .update_row(grad, row)
            .map_err(|_| mismatch)
    }

    /// Pins every dirty slot and copies its row out.
    ///
    /// Pinned slots aren't evicted until the batch is completed. They can still be written, in
    /// which case they stay dirty after the flush.
    pub fn begin_flush(&mut self) -> FlushBatch {
        let mut batch = FlushBatch {
            rows: Vec::new(),
            versions: Vec::new(),
        };

        for (key, slot) in self.slots.iter_mut().filter(|(_, s)| s.dirty) {
            slot.pinned = true;
            batch.rows.push((*key, slot.row.clone()));
            batch.versions.push((*key, slot.version));
        }

        batch
    }

    /// Unpins the slots of a flush.
    ///
    /// # Arguments
    /// * `versions` - The versions the rows had when the flush began.
    /// * `written` - Whether the rows reached the store, only then unchanged slots are cleaned.
    pub fn complete_flush(&mut self, versions: &[(Key, u64)], written: bool) {
        for (key, version) in versions {
            if let Some(slot) = self.slots.get_mut(key) {
                slot.pinned = false;
                slot.dirty &= !(written && slot.version == *version);
            }
        }
    }

    /// Writes every dirty row to `store` and marks them clean.
    ///
    /// # Returns
    /// The amount of rows written or the store's error, in which case the rows stay dirty.
    pub fn flush<S: RowStore + ?Sized>(&mut self, store: &S) -> Result<usize> {
        let batch = self.begin_flush();
        if batch.is_empty() {
            return Ok(0);
        }

        let result = store.write_rows(&batch.rows());
        self.complete_flush(&batch.versions, result.is_ok());

        result?;
        Ok(batch.len())
    }
}
