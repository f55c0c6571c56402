//! An in memory `RowStore` for unit tests, with failure injection.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use sparse_store::{Checkpoint, EmbeddingRow, Key, KeyIndex, RowLayout, RowStore, StoreErr};

pub(crate) struct MemStore {
    layout: RowLayout,
    index: KeyIndex,
    rows: Mutex<HashMap<Key, EmbeddingRow>>,
    offline: AtomicBool,
    generation: AtomicU64,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl MemStore {
    pub fn new(layout: RowLayout) -> Self {
        Self {
            layout,
            index: KeyIndex::new(None),
            rows: Mutex::default(),
            offline: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// A store holding a zeroed row for each of `keys`.
    pub fn with_zeroed(layout: RowLayout, keys: &[Key]) -> Self {
        let store = Self::new(layout);
        let rows: Vec<_> = keys.iter().map(|k| (*k, EmbeddingRow::zeroed(layout))).collect();
        let batch: Vec<_> = rows.iter().map(|(k, r)| (*k, r)).collect();
        store.write_rows(&batch).unwrap();
        store.writes.store(0, Ordering::Relaxed);
        store
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn stored(&self, key: Key) -> Option<EmbeddingRow> {
        self.rows.lock().get(&key).cloned()
    }

    fn check_online(&self) -> sparse_store::Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreErr::StorageUnavailable {
                path: PathBuf::from("mem"),
                key: None,
                source: io::Error::other("medium offline"),
            });
        }

        Ok(())
    }
}

impl RowStore for MemStore {
    fn layout(&self) -> RowLayout {
        self.layout
    }

    fn index(&self) -> &KeyIndex {
        &self.index
    }

    fn read_rows(&self, keys: &[Key]) -> sparse_store::Result<HashMap<Key, EmbeddingRow>> {
        self.check_online()?;
        self.reads.fetch_add(keys.len(), Ordering::Relaxed);

        let rows = self.rows.lock();
        keys.iter()
            .map(|k| {
                let row = rows.get(k).cloned().ok_or(StoreErr::NotFound(*k))?;
                Ok((*k, row))
            })
            .collect()
    }

    fn write_rows(&self, batch: &[(Key, &EmbeddingRow)]) -> sparse_store::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        self.check_online()?;
        self.writes.fetch_add(batch.len(), Ordering::Relaxed);

        let mut rows = self.rows.lock();
        for (key, row) in batch {
            row.check(*key, self.layout)?;
            self.index.insert(*key)?;
            rows.insert(*key, (*row).clone());
        }

        Ok(())
    }

    fn checkpoint(&self) -> sparse_store::Result<Checkpoint> {
        self.check_online()?;

        Ok(Checkpoint {
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            seq: 0,
            rows: self.index.len(),
            slots: self.index.allocated(),
            layout: self.layout,
        })
    }
}
